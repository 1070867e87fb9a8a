//! Building blocks for transformer encoder layers.
//!
//! The crate hosts the dense pieces of an encoder layer (affine projections,
//! layer normalisation, activations, the feed-forward block and post-norm
//! residual wiring) assembled from Candle primitives. Every component accepts
//! pre-existing parameter tensors; nothing here initialises or trains weights.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;

pub use activations::{Activation, ActivationKind};
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearLayer};
pub use mlp::{FeedForward, FeedForwardConfig, FeedForwardLayer};
pub use norm::{LayerNorm, NormConfig, NormalizationLayer};
pub use residual::PostNormResidual;
