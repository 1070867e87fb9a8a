#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use anyhow::Result;
use attention::masks::encoder_mask_from_lengths;
use candle_core::{DType, Device, Tensor};
use encoder::{
    EncoderConfig, EncoderKernel, KernelError, KernelInvocation, Precision, WeightName,
    WEIGHT_COUNT,
};

pub const HEADS: usize = 8;
pub const HEAD_SIZE: usize = 16;
pub const HIDDEN: usize = HEADS * HEAD_SIZE;

pub fn config(remove_padding: bool) -> EncoderConfig {
    EncoderConfig::new(HEADS, HEAD_SIZE, remove_padding)
}

/// Random weights for `hidden`, with unit layer-norm scales.
pub fn weights_for(hidden: usize, dtype: DType) -> Result<[Tensor; WEIGHT_COUNT]> {
    let device = Device::Cpu;
    let tensors = WeightName::ALL
        .into_iter()
        .map(|name| -> Result<Tensor> {
            let shape = name.expected_shape(hidden);
            let tensor = match name {
                WeightName::AttnOutLnGamma | WeightName::OutLnGamma => {
                    Tensor::ones(shape, DType::F32, &device)?
                }
                _ => Tensor::randn(0f32, 0.05, shape, &device)?,
            };
            Ok(tensor.to_dtype(dtype)?)
        })
        .collect::<Result<Vec<_>>>()?;
    tensors
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected {WEIGHT_COUNT} weight tensors"))
}

pub fn weights(dtype: DType) -> Result<[Tensor; WEIGHT_COUNT]> {
    weights_for(HIDDEN, dtype)
}

pub fn input(batch: usize, seq_len: usize, dtype: DType) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1.0, (batch, seq_len, HIDDEN), &Device::Cpu)?.to_dtype(dtype)?)
}

pub fn mask(lengths: &[usize], seq_len: usize, dtype: DType) -> Result<Tensor> {
    Ok(encoder_mask_from_lengths(&Device::Cpu, lengths, seq_len, dtype)?)
}

pub fn lengths(values: &[u32]) -> Result<Tensor> {
    Ok(Tensor::new(values, &Device::Cpu)?)
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?)
}

/// Kernel double that counts invocations and drops, and can be told to fail.
#[derive(Debug)]
pub struct SpyKernel {
    precision: Precision,
    pub calls: Arc<AtomicUsize>,
    drops: Arc<AtomicUsize>,
    fail: bool,
}

impl SpyKernel {
    pub fn new(precision: Precision, drops: Arc<AtomicUsize>, fail: bool) -> Self {
        Self {
            precision,
            calls: Arc::new(AtomicUsize::new(0)),
            drops,
            fail,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EncoderKernel for SpyKernel {
    fn precision(&self) -> Precision {
        self.precision
    }

    fn execute(&self, invocation: &KernelInvocation<'_>) -> Result<(), KernelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(KernelError::Unsupported("spy kernel refused".to_string()));
        }
        invocation.output.slice_set(invocation.input, 0, 0)?;
        Ok(())
    }
}

impl Drop for SpyKernel {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}
