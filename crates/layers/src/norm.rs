//! Last-axis layer normalisation over `(batch, seq, hidden)` activations.
//!
//! Mean and variance are taken in [`PrecisionPolicy::reduction`]; the affine
//! step runs in the compute dtype and the result is cast back to storage.

use candle_core::{Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy, linear::PARAMETER_DTYPES};

/// Variance stabiliser used by BERT-style encoder layers.
pub const DEFAULT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormConfig {
    pub hidden_size: usize,
    pub epsilon: f64,
}

impl NormConfig {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: DEFAULT_EPSILON,
        }
    }
}

pub trait NormalizationLayer: Send + Sync {
    fn config(&self) -> &NormConfig;

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// `gamma * (x - mean) / sqrt(var + eps) + beta`.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    gamma: Tensor,
    beta: Tensor,
}

impl LayerNorm {
    pub fn new(gamma: Tensor, beta: Tensor, config: NormConfig) -> Result<Self> {
        let expected = [config.hidden_size];
        checks::expect_shape("norm.gamma", &gamma, &expected)?;
        checks::expect_shape("norm.beta", &beta, &expected)?;
        checks::expect_dtype_in("norm.gamma", &gamma, &PARAMETER_DTYPES)?;
        checks::expect_same_dtype("norm.beta", &beta, "norm.gamma", &gamma)?;
        checks::expect_contiguous("norm.gamma", &gamma)?;
        checks::expect_contiguous("norm.beta", &beta)?;
        Ok(Self {
            config,
            gamma,
            beta,
        })
    }

    pub fn gamma(&self) -> &Tensor {
        &self.gamma
    }

    pub fn beta(&self) -> &Tensor {
        &self.beta
    }
}

impl NormalizationLayer for LayerNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let x = policy.cast_for_reduction(hidden)?;
        let centred = x.broadcast_sub(&x.mean_keepdim(D::Minus1)?)?;
        let inv_std = centred
            .sqr()?
            .mean_keepdim(D::Minus1)?
            .affine(1.0, self.config.epsilon)?
            .sqrt()?
            .recip()?;
        let normalised = policy.cast_for_matmul(&centred.broadcast_mul(&inv_std)?)?;

        let compute = normalised.dtype();
        let scaled = normalised
            .broadcast_mul(&self.gamma.to_dtype(compute)?)?
            .broadcast_add(&self.beta.to_dtype(compute)?)?;
        policy.cast_to_storage(&scaled)
    }
}
