//! Post-norm residual connections.
//!
//! Residual branches combine tensors of shape `(batch, seq, hidden)`. Encoder
//! layers in the BERT layout normalise *after* the addition:
//! `LayerNorm(branch + residual)`. The addition happens in the compute dtype.

use candle_core::{Result, Tensor};

use crate::{
    checks,
    dtypes::PrecisionPolicy,
    norm::{LayerNorm, NormalizationLayer},
};

/// `LayerNorm(branch + residual)`.
#[derive(Debug, Clone)]
pub struct PostNormResidual {
    norm: LayerNorm,
}

impl PostNormResidual {
    pub fn new(norm: LayerNorm) -> Self {
        Self { norm }
    }

    pub fn norm(&self) -> &LayerNorm {
        &self.norm
    }

    /// Adds `branch` onto `residual` and normalises the sum.
    pub fn forward(
        &self,
        branch: &Tensor,
        residual: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        checks::expect_shape("residual.branch", branch, residual.dims())?;
        let sum = policy
            .cast_for_matmul(branch)?
            .add(&policy.cast_for_matmul(residual)?)?;
        self.norm.forward(&sum, policy)
    }
}
