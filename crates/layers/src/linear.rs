//! Biased affine projections, `y = x · Wᵀ + b`.
//!
//! `W` is stored `(output_dim, input_dim)`. Inputs may have any number of
//! leading axes; only the last one is projected. The matmul runs in
//! [`PrecisionPolicy::compute`] and the result comes back in the storage
//! dtype. The layer holds the caller's tensor handles and never copies them.

use candle_core::{bail, DType, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Parameter dtypes accepted by the blocks in this crate.
pub const PARAMETER_DTYPES: [DType; 3] = [DType::F16, DType::BF16, DType::F32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearConfig {
    pub input_dim: usize,
    pub output_dim: usize,
}

impl LinearConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
        }
    }
}

pub trait LinearLayer: Send + Sync {
    fn config(&self) -> &LinearConfig;

    /// Projects the last axis of `hidden`.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Tensor,
}

impl Linear {
    /// Wraps existing parameters after checking their shape, dtype and layout.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Tensor) -> Result<Self> {
        checks::expect_shape(
            "linear.weight",
            &weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_shape("linear.bias", &bias, &[config.output_dim])?;
        checks::expect_dtype_in("linear.weight", &weight, &PARAMETER_DTYPES)?;
        checks::expect_same_dtype("linear.bias", &bias, "linear.weight", &weight)?;
        checks::expect_contiguous("linear.weight", &weight)?;
        checks::expect_contiguous("linear.bias", &bias)?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let LinearConfig {
            input_dim,
            output_dim,
        } = self.config;
        let Some((&last, leading)) = hidden.dims().split_last() else {
            bail!("linear.input: scalar inputs cannot be projected")
        };
        if last != input_dim {
            bail!(
                "linear.input: expected last axis {input_dim}, got shape {:?}",
                hidden.dims()
            );
        }
        let rows: usize = leading.iter().product();
        let mut out_shape = leading.to_vec();
        out_shape.push(output_dim);

        let weight = policy.cast_for_matmul(&self.weight)?;
        let bias = policy.cast_for_matmul(&self.bias)?;
        let projected = policy
            .cast_for_matmul(hidden)?
            .reshape((rows, input_dim))?
            .matmul(&weight.t()?)?
            .broadcast_add(&bias)?
            .reshape(out_shape)?;
        policy.cast_to_storage(&projected)
    }
}
