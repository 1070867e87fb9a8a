//! Precision dispatch for encoder-layer kernels.
//!
//! A module selects exactly one kernel at construction time based on the dtype
//! of its weights. [`KernelHandle`] is the closed set of built-in kernels; the
//! [`EncoderKernel`] trait is the seam the module calls through, so tests can
//! substitute an instrumented kernel.

mod reference;

use std::fmt;

use attention::AttentionError;
use candle_core::{DType, Tensor};
use thiserror::Error;

use crate::config::EncoderConfig;
use crate::error::EncoderError;
use crate::weights::WeightSet;

pub use reference::{EncoderLayerKernel, Float16Kernel, Float32Kernel};

/// Numeric precision of an encoder instance, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    Float32,
    Float16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::Float32 => DType::F32,
            Precision::Float16 => DType::F16,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Float32 => "f32",
            Precision::Float16 => "f16",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "f32" => Some(Precision::Float32),
            "f16" => Some(Precision::Float16),
            _ => None,
        }
    }
}

impl TryFrom<DType> for Precision {
    type Error = EncoderError;

    fn try_from(dtype: DType) -> Result<Self, Self::Error> {
        match dtype {
            DType::F32 => Ok(Precision::Float32),
            DType::F16 => Ok(Precision::Float16),
            other => Err(EncoderError::UnsupportedPrecision { dtype: other }),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while a kernel computes.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("tensor backend error: {0}")]
    Backend(#[from] candle_core::Error),

    #[error("attention error: {0}")]
    Attention(#[from] AttentionError),

    #[error("unsupported kernel request: {0}")]
    Unsupported(String),
}

/// Arguments for one encoder-layer invocation.
///
/// All tensors have been validated by the caller. `output` is a zeroed
/// `(batch_size, seq_len, hidden)` tensor owned by the caller; the kernel
/// writes its result into it.
#[derive(Debug, Clone, Copy)]
pub struct KernelInvocation<'a> {
    pub batch_size: usize,
    pub seq_len: usize,
    pub input: &'a Tensor,
    pub attention_mask: &'a Tensor,
    pub output: &'a Tensor,
    pub sequence_lengths: Option<&'a Tensor>,
    pub remove_padding: bool,
}

/// One precision-specialised encoder-layer computation.
pub trait EncoderKernel: Send + Sync {
    fn precision(&self) -> Precision;

    /// Runs the layer. Must not retain any invocation tensor after returning.
    fn execute(&self, invocation: &KernelInvocation<'_>) -> Result<(), KernelError>;
}

/// Closed set of built-in kernels, one per supported precision.
#[derive(Debug)]
pub enum KernelHandle {
    Float32(Float32Kernel),
    Float16(Float16Kernel),
}

impl KernelHandle {
    /// Builds the kernel matching `precision` over the validated weights.
    pub fn select(
        precision: Precision,
        config: &EncoderConfig,
        weights: &WeightSet,
    ) -> Result<Self, KernelError> {
        let kernel = match precision {
            Precision::Float32 => KernelHandle::Float32(Float32Kernel::new(config, weights)?),
            Precision::Float16 => KernelHandle::Float16(Float16Kernel::new(config, weights)?),
        };
        log::debug!(
            "encoder kernel selected precision={precision} heads={} head_size={}",
            config.head_count,
            config.head_size
        );
        Ok(kernel)
    }
}

impl EncoderKernel for KernelHandle {
    fn precision(&self) -> Precision {
        match self {
            KernelHandle::Float32(kernel) => kernel.precision(),
            KernelHandle::Float16(kernel) => kernel.precision(),
        }
    }

    fn execute(&self, invocation: &KernelInvocation<'_>) -> Result<(), KernelError> {
        match self {
            KernelHandle::Float32(kernel) => kernel.execute(invocation),
            KernelHandle::Float16(kernel) => kernel.execute(invocation),
        }
    }
}
