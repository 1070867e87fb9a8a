//! Builders for padding-aware encoder masks.

use candle_core::{DType, Device, Result, Tensor};

use super::MASK_DTYPE;

/// Construct binary encoder masks from per-batch valid lengths.
///
/// The result is shaped `[batch, seq_len, seq_len]` with dtype `dtype`.
/// Entry `(b, q, k)` is `1` when both `q` and `k` fall inside the first
/// `lengths[b]` positions and `0` otherwise.
pub fn encoder_mask_from_lengths(
    device: &Device,
    lengths: &[usize],
    seq_len: usize,
    dtype: DType,
) -> Result<Tensor> {
    let batch = lengths.len();
    let mut data = vec![0f32; batch * seq_len * seq_len];

    for (b, &valid) in lengths.iter().enumerate() {
        let valid = valid.min(seq_len);
        for q in 0..valid {
            let row_start = (b * seq_len + q) * seq_len;
            data[row_start..row_start + valid].fill(1.0);
        }
    }

    Tensor::from_vec(data, (batch, seq_len, seq_len), device)?.to_dtype(dtype)
}

/// Convert a binary `[batch, q_len, k_len]` mask into the additive
/// `[batch, 1, q_len, k_len]` form: `(mask - 1) * -fill`.
///
/// A kept position (`1`) maps to `0.0` and a masked position (`0`) maps to
/// `fill`.
pub fn additive_from_binary(mask: &Tensor, fill: f32) -> Result<Tensor> {
    let (batch, q_len, k_len) = mask.dims3()?;
    let fill = f64::from(fill);
    mask.to_dtype(MASK_DTYPE)?
        .affine(-fill, fill)?
        .reshape((batch, 1, q_len, k_len))
}
