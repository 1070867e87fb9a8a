//! Mask utilities shared by attention implementations.
//!
//! Encoder callers describe visibility with binary masks shaped
//! `[batch, q_len, k_len]` in the activation dtype: `1` keeps a position, `0`
//! discards it. Kernels consume additive tensors with dtype [`MASK_DTYPE`],
//! shaped `[batch, 1, q_len, k_len]`, holding `0.0` (keep) or a large negative
//! fill (discard).

pub mod padding;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use padding::{additive_from_binary, encoder_mask_from_lengths};
