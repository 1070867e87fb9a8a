//! `softmax(q·kᵀ·scale + mask)·v` evaluated in `f32` for every head at once.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::core::{Attention, AttentionError, Config};
use crate::masks::MASK_DTYPE;

#[derive(Debug, Default)]
pub struct ExactAttention {
    announced: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

fn shape_error(context: impl Into<String>) -> AttentionError {
    AttentionError::InvalidShape {
        context: context.into(),
    }
}

/// Checks placement, dtype and layout of `q`, `k`, `v` and returns
/// `(batch, heads, q_len, k_len, head_dim)`.
fn check_operands(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
) -> Result<(usize, usize, usize, usize, usize), AttentionError> {
    let dtype = q.dtype();
    if !matches!(dtype, DType::F32 | DType::F16) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }
    for (name, tensor) in [("k", k), ("v", v)] {
        if !tensor.device().same_device(q.device()) {
            return Err(shape_error(format!("{name} is on a different device than q")));
        }
        if tensor.dtype() != dtype {
            return Err(shape_error(format!(
                "{name} has dtype {:?} but q has {dtype:?}",
                tensor.dtype()
            )));
        }
    }
    if [q, k, v].iter().any(|tensor| !tensor.is_contiguous()) {
        return Err(shape_error("q, k and v must be contiguous"));
    }

    let rank4 = |name: &str, tensor: &Tensor| {
        tensor.dims4().map_err(|_| {
            shape_error(format!(
                "{name} must be [batch, heads, seq, head_dim], got {:?}",
                tensor.dims()
            ))
        })
    };
    let (batch, heads, q_len, head_dim) = rank4("q", q)?;
    let (kb, kh, k_len, kd) = rank4("k", k)?;
    if (kb, kh, kd) != (batch, heads, head_dim) {
        return Err(shape_error(format!(
            "k is {:?}, expected [{batch}, {heads}, _, {head_dim}]",
            k.dims()
        )));
    }
    if rank4("v", v)? != (batch, heads, k_len, head_dim) {
        return Err(shape_error(format!(
            "v is {:?}, expected [{batch}, {heads}, {k_len}, {head_dim}]",
            v.dims()
        )));
    }
    Ok((batch, heads, q_len, k_len, head_dim))
}

/// Broadcasts an additive `[batch, 1|heads, q_len, k_len]` mask over heads.
fn expand_mask(
    mask: &Tensor,
    q: &Tensor,
    shape: (usize, usize, usize, usize),
) -> Result<Tensor, AttentionError> {
    let (batch, heads, q_len, k_len) = shape;
    if !mask.device().same_device(q.device()) {
        return Err(shape_error("mask is on a different device than q"));
    }
    if mask.dtype() != MASK_DTYPE {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("mask dtype {:?}, expected {MASK_DTYPE:?}", mask.dtype()),
        });
    }
    match *mask.dims() {
        [b, h, q, k] if b == batch && (h == 1 || h == heads) && q == q_len && k == k_len => {
            Ok(mask.broadcast_as(shape)?)
        }
        ref dims => Err(shape_error(format!(
            "mask is {dims:?}, expected [{batch}, 1 or {heads}, {q_len}, {k_len}]"
        ))),
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if self.announced.set(()).is_ok() {
            log::info!(
                "attention::exact first call dtype={:?} scale={:?} mask_fill={}",
                q.dtype(),
                config.scale,
                config.mask_fill
            );
        }
        let (batch, heads, q_len, k_len, head_dim) = check_operands(q, k, v)?;
        let groups = batch * heads;

        let flat = |tensor: &Tensor, len: usize| {
            tensor
                .to_dtype(DType::F32)?
                .reshape((groups, len, head_dim))
        };
        let (q32, k32, v32) = (flat(q, q_len)?, flat(k, k_len)?, flat(v, k_len)?);

        let mut scores = q32
            .matmul(&k32.t()?)?
            .affine(f64::from(config.scale_for(head_dim)), 0.0)?;
        if let Some(mask) = mask {
            let mask = expand_mask(mask, q, (batch, heads, q_len, k_len))?;
            scores = scores.add(&mask.reshape((groups, q_len, k_len))?)?;
        }

        let context = softmax_last_dim(&scores)?.matmul(&v32)?;
        Ok(context
            .reshape((batch, heads, q_len, head_dim))?
            .to_dtype(q.dtype())?)
    }
}
