//! The attention trait and the types it shares with callers.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::Config;
pub use errors::AttentionError;

/// Bidirectional scaled-dot-product attention.
///
/// `q`, `k` and `v` are `[batch, heads, seq, head_dim]` in one float dtype and
/// the result has the layout and dtype of `q`. An optional additive `f32` mask
/// is shaped `[batch, 1 | heads, q_len, k_len]`.
pub trait Attention: Send + Sync {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
