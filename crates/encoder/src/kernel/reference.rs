//! Portable post-norm encoder layer built from the `layers` and `attention`
//! crates.
//!
//! ```text
//! q, k, v  = x·Wqᵀ + bq, x·Wkᵀ + bk, x·Wvᵀ + bv
//! context  = softmax(q·kᵀ / sqrt(head_size) + (mask - 1)·10000)·v   per head
//! h        = LayerNorm(context·Woᵀ + bo + x)
//! y        = LayerNorm(gelu(h·Wiᵀ + bi)·Wfᵀ + bf + h)
//! ```
//!
//! Dense invocations run the whole padded batch. Padding-removal invocations
//! gather the first `length[b]` tokens of every sequence into one packed
//! `(1, total, hidden)` tensor, run the token-wise stages once over it, attend
//! within each sequence separately and scatter the rows back. Rows past a
//! sequence's length are left at zero in that mode.

use std::{fmt, marker::PhantomData, sync::OnceLock};

use attention::{masks::additive_from_binary, Attention, Config as AttentionConfig, ExactAttention};
use candle_core::{DType, Device, Tensor, WithDType};
use layers::{
    ActivationKind, FeedForward, FeedForwardConfig, FeedForwardLayer, LayerNorm, Linear,
    LinearConfig, LinearLayer, NormConfig, PostNormResidual, PrecisionPolicy,
};

use super::{EncoderKernel, KernelError, KernelInvocation, Precision};
use crate::config::EncoderConfig;
use crate::weights::{WeightName, WeightSet, INTERMEDIATE_RATIO};

pub type Float32Kernel = EncoderLayerKernel<f32>;
pub type Float16Kernel = EncoderLayerKernel<half::f16>;

/// Encoder layer whose parameters are stored as `T`.
pub struct EncoderLayerKernel<T: WithDType> {
    config: EncoderConfig,
    policy: PrecisionPolicy,
    query: Linear,
    key: Linear,
    value: Linear,
    attn_output: Linear,
    attn_residual: PostNormResidual,
    feed_forward: FeedForward,
    out_residual: PostNormResidual,
    attention: ExactAttention,
    attention_config: AttentionConfig,
    first_call: OnceLock<()>,
    _storage: PhantomData<fn() -> T>,
}

impl<T: WithDType> fmt::Debug for EncoderLayerKernel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderLayerKernel")
            .field("dtype", &T::DTYPE)
            .field("config", &self.config)
            .finish()
    }
}

/// Valid prefix of one sequence inside the packed token tensor.
#[derive(Debug, Clone, Copy)]
struct Segment {
    batch: usize,
    offset: usize,
    len: usize,
}

impl<T: WithDType> EncoderLayerKernel<T> {
    /// Wraps the validated weights. Parameter tensors are shared, not copied.
    pub fn new(config: &EncoderConfig, weights: &WeightSet) -> Result<Self, KernelError> {
        if weights.dtype() != T::DTYPE {
            return Err(KernelError::Unsupported(format!(
                "{:?} kernel cannot run {:?} weights",
                T::DTYPE,
                weights.dtype()
            )));
        }
        let hidden = config.hidden_dim();
        if weights.hidden_dim() != hidden {
            return Err(KernelError::Unsupported(format!(
                "weights sized for hidden {} but config implies {hidden}",
                weights.hidden_dim()
            )));
        }

        let projection = |kernel: WeightName, bias: WeightName| {
            Linear::new(
                LinearConfig::new(hidden, hidden),
                weights.get(kernel).clone(),
                weights.get(bias).clone(),
            )
        };
        let norm = |gamma: WeightName, beta: WeightName| {
            LayerNorm::new(
                weights.get(gamma).clone(),
                weights.get(beta).clone(),
                NormConfig::new(hidden),
            )
            .map(PostNormResidual::new)
        };

        let feed_forward = FeedForward::new(
            FeedForwardConfig::new(hidden, INTERMEDIATE_RATIO * hidden, ActivationKind::Gelu),
            weights.get(WeightName::InterKernel).clone(),
            weights.get(WeightName::InterBias).clone(),
            weights.get(WeightName::OutKernel).clone(),
            weights.get(WeightName::OutBias).clone(),
        )?;

        Ok(Self {
            config: *config,
            policy: PrecisionPolicy::from_parameter_dtype(T::DTYPE),
            query: projection(WeightName::QKernel, WeightName::QBias)?,
            key: projection(WeightName::KKernel, WeightName::KBias)?,
            value: projection(WeightName::VKernel, WeightName::VBias)?,
            attn_output: projection(WeightName::AttnOutKernel, WeightName::AttnOutBias)?,
            attn_residual: norm(WeightName::AttnOutLnGamma, WeightName::AttnOutLnBeta)?,
            feed_forward,
            out_residual: norm(WeightName::OutLnGamma, WeightName::OutLnBeta)?,
            attention: ExactAttention::new(),
            attention_config: AttentionConfig::default(),
            first_call: OnceLock::new(),
            _storage: PhantomData,
        })
    }

    /// `(n, s, hidden)` to `(n, heads, s, head_size)`.
    fn split_heads(&self, hidden: &Tensor) -> candle_core::Result<Tensor> {
        let (n, s, _) = hidden.dims3()?;
        hidden
            .reshape((n, s, self.config.head_count, self.config.head_size))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn project_heads(&self, hidden: &Tensor) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
        let q = self.split_heads(&self.query.forward(hidden, &self.policy)?)?;
        let k = self.split_heads(&self.key.forward(hidden, &self.policy)?)?;
        let v = self.split_heads(&self.value.forward(hidden, &self.policy)?)?;
        Ok((q, k, v))
    }

    /// Output projection, both residual blocks and the feed-forward stack.
    fn finish(&self, residual: &Tensor, context: &Tensor) -> candle_core::Result<Tensor> {
        let (n, _, s, _) = context.dims4()?;
        let merged = context
            .transpose(1, 2)?
            .contiguous()?
            .reshape((n, s, self.config.hidden_dim()))?;
        let attended = self.attn_output.forward(&merged, &self.policy)?;
        let hidden = self.attn_residual.forward(&attended, residual, &self.policy)?;
        let expanded = self.feed_forward.forward(&hidden, &self.policy)?;
        self.out_residual.forward(&expanded, &hidden, &self.policy)
    }

    fn forward_dense(&self, input: &Tensor, mask: &Tensor) -> Result<Tensor, KernelError> {
        let additive = additive_from_binary(mask, self.attention_config.mask_fill)?;
        let (q, k, v) = self.project_heads(input)?;
        let context = self
            .attention
            .attend(&q, &k, &v, Some(&additive), &self.attention_config)?;
        Ok(self.finish(input, &context)?)
    }

    fn forward_packed(
        &self,
        invocation: &KernelInvocation<'_>,
        lengths: &Tensor,
    ) -> Result<(), KernelError> {
        let lengths = read_lengths(lengths)?;
        let segments = segments(&lengths);
        let total: usize = segments.iter().map(|segment| segment.len).sum();
        log::debug!(
            "encoder packed {total} of {} tokens across {} sequences",
            invocation.batch_size * invocation.seq_len,
            segments.len()
        );
        if segments.is_empty() {
            return Ok(());
        }

        let rows = segments
            .iter()
            .map(|segment| invocation.input.get(segment.batch)?.narrow(0, 0, segment.len))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let packed = Tensor::cat(&rows, 0)?.unsqueeze(0)?;

        let (q, k, v) = self.project_heads(&packed)?;
        let mut contexts = Vec::with_capacity(segments.len());
        for segment in &segments {
            let window = |tensor: &Tensor| tensor.narrow(2, segment.offset, segment.len)?.contiguous();
            let mask = invocation
                .attention_mask
                .get(segment.batch)?
                .narrow(0, 0, segment.len)?
                .narrow(1, 0, segment.len)?
                .unsqueeze(0)?;
            let additive = additive_from_binary(&mask, self.attention_config.mask_fill)?;
            contexts.push(self.attention.attend(
                &window(&q)?,
                &window(&k)?,
                &window(&v)?,
                Some(&additive),
                &self.attention_config,
            )?);
        }
        let context = Tensor::cat(&contexts, 2)?;
        let encoded = self.finish(&packed, &context)?.squeeze(0)?;

        let hidden = self.config.hidden_dim();
        let device = invocation.input.device();
        let padding = |rows: usize| Tensor::zeros((rows, hidden), T::DTYPE, device);
        let mut sequences = Vec::with_capacity(invocation.batch_size);
        let mut cursor = segments.iter().peekable();
        for (batch, &len) in lengths.iter().enumerate() {
            let sequence = match cursor.next_if(|segment| segment.batch == batch) {
                Some(segment) if segment.len == invocation.seq_len => {
                    encoded.narrow(0, segment.offset, segment.len)?
                }
                Some(segment) => Tensor::cat(
                    &[
                        encoded.narrow(0, segment.offset, segment.len)?,
                        padding(invocation.seq_len - len)?,
                    ],
                    0,
                )?,
                None => padding(invocation.seq_len)?,
            };
            sequences.push(sequence);
        }
        let unpacked = Tensor::stack(&sequences, 0)?.contiguous()?;
        invocation.output.slice_set(&unpacked, 0, 0)?;
        Ok(())
    }
}

fn read_lengths(lengths: &Tensor) -> Result<Vec<usize>, KernelError> {
    let values = lengths
        .to_device(&Device::Cpu)?
        .to_dtype(DType::I64)?
        .to_vec1::<i64>()?;
    values
        .into_iter()
        .map(|value| {
            usize::try_from(value)
                .map_err(|_| KernelError::Unsupported(format!("negative sequence length {value}")))
        })
        .collect()
}

/// Packed layout for `lengths`; zero-length sequences contribute no segment.
fn segments(lengths: &[usize]) -> Vec<Segment> {
    let mut offset = 0;
    lengths
        .iter()
        .enumerate()
        .filter(|(_, len)| **len > 0)
        .map(|(batch, &len)| {
            let segment = Segment { batch, offset, len };
            offset += len;
            segment
        })
        .collect()
}

impl<T: WithDType> EncoderKernel for EncoderLayerKernel<T> {
    fn precision(&self) -> Precision {
        if T::DTYPE == DType::F16 {
            Precision::Float16
        } else {
            Precision::Float32
        }
    }

    fn execute(&self, invocation: &KernelInvocation<'_>) -> Result<(), KernelError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "encoder::reference init dtype={:?} heads={} head_size={} remove_padding={}",
                T::DTYPE,
                self.config.head_count,
                self.config.head_size,
                invocation.remove_padding
            );
        }

        if invocation.remove_padding {
            let lengths = invocation.sequence_lengths.ok_or_else(|| {
                KernelError::Unsupported("padding removal requires sequence lengths".to_string())
            })?;
            self.forward_packed(invocation, lengths)
        } else {
            let encoded = self.forward_dense(invocation.input, invocation.attention_mask)?;
            invocation.output.slice_set(&encoded.contiguous()?, 0, 0)?;
            Ok(())
        }
    }
}
