//! Storage versus compute dtypes.
//!
//! Encoder parameters are stored as `f32` or `f16`. Half precision layers keep
//! `f16` for parameters and layer outputs while matmuls, activations and
//! normalisation statistics run in `f32`. Every block in this crate routes its
//! casts through a [`PrecisionPolicy`].

use candle_core::{DType, Result, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Half and bfloat16 storage compute in `f32`; statistics are always `f32`.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = if matches!(storage, DType::F16 | DType::BF16) {
            DType::F32
        } else {
            storage
        };
        Self::new(storage, compute, DType::F32)
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.compute)
    }

    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.reduction)
    }

    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.storage)
    }
}

/// Returns `tensor` itself when it already has `dtype`.
fn cast(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    match tensor.dtype() {
        current if current == dtype => Ok(tensor.clone()),
        _ => tensor.to_dtype(dtype),
    }
}
