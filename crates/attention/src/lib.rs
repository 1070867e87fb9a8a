//! Exact multi-head self-attention primitives for encoder layers.
//!
//! The crate defines a portable API for computing bidirectional scaled
//! dot-product attention over tensors with layout
//! `[batch, n_heads, seq_len, head_dim]`. The inputs `Q`, `K`, and `V` share the
//! same layout and dtype (f16 or f32). Scores and softmax are evaluated in
//! `f32`, and the output tensor matches the input dtype and shape.
//!
//! Encoder attention masks arrive from callers as binary
//! `[batch, seq_len, seq_len]` tensors (`1` attend, `0` masked). The
//! [`masks`] module converts them into the additive form the kernels consume.

pub mod core;
pub mod masks;
pub mod reference;

pub use core::{Attention, AttentionError, Config};
pub use reference::ExactAttention;
