//! The encoder module: validated weights, a precision-specific kernel and the
//! per-call input checks in front of it.

use candle_core::{DType, Device, Tensor};

use crate::config::EncoderConfig;
use crate::error::{EncoderError, InputArgument, Result};
use crate::kernel::{EncoderKernel, KernelError, KernelHandle, KernelInvocation, Precision};
use crate::weights::{WeightName, WeightSet, WEIGHT_COUNT};

/// Integer dtypes accepted for `sequence_lengths`.
pub const LENGTH_DTYPES: [DType; 2] = [DType::U32, DType::I64];

/// Number of tensors returned by [`EncoderModule::get_state`].
pub const STATE_LEN: usize = WEIGHT_COUNT + 1;

/// One transformer encoder layer bound to a fixed set of weights.
///
/// The precision is taken from the weights at construction and never changes.
/// `forward` takes `&self` and allocates a fresh output per call, so a module
/// can be shared across threads when its kernel allows it.
pub struct EncoderModule<K: EncoderKernel = KernelHandle> {
    // Declared first so the kernel's weight views are dropped before the set.
    kernel: K,
    weights: WeightSet,
    config: EncoderConfig,
    precision: Precision,
    metadata: Tensor,
}

impl<K: EncoderKernel> std::fmt::Debug for EncoderModule<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderModule")
            .field("config", &self.config)
            .field("precision", &self.precision)
            .field("device", &self.weights.device().location())
            .finish()
    }
}

impl EncoderModule {
    /// Validates `weights` and binds them to the built-in kernel for their dtype.
    pub fn new(config: EncoderConfig, weights: [Tensor; WEIGHT_COUNT]) -> Result<Self> {
        Self::with_kernel(config, weights, KernelHandle::select)
    }

    /// Rebuilds a module from the seventeen tensors returned by
    /// [`EncoderModule::get_state`].
    pub fn from_state(state: Vec<Tensor>) -> Result<Self> {
        let (config, weights) = split_state(state)?;
        Self::new(config, weights)
    }
}

impl<K: EncoderKernel> EncoderModule<K> {
    /// Same validation as [`EncoderModule::new`], with the kernel built by
    /// `factory` from the chosen precision and the accepted weights.
    pub fn with_kernel<F>(
        config: EncoderConfig,
        weights: [Tensor; WEIGHT_COUNT],
        factory: F,
    ) -> Result<Self>
    where
        F: FnOnce(Precision, &EncoderConfig, &WeightSet) -> std::result::Result<K, KernelError>,
    {
        config.validate()?;

        let reference = &weights[WeightName::QKernel.index()];
        let dtype = reference.dtype();
        let device = reference.device().clone();
        let weights = WeightSet::validate(weights, dtype, &device, config.hidden_dim())?;
        let precision = Precision::try_from(dtype)?;

        let kernel = factory(precision, &config, &weights)?;
        let metadata = config.metadata_tensor()?;
        log::debug!(
            "encoder module ready precision={precision} hidden={} remove_padding={} device={:?}",
            config.hidden_dim(),
            config.remove_padding,
            device.location()
        );

        Ok(Self {
            kernel,
            weights,
            config,
            precision,
            metadata,
        })
    }

    /// Runs the encoder layer over `input`.
    ///
    /// `input` is `(batch, seq_len, hidden)` and `attention_mask` is
    /// `(batch, seq_len, seq_len)` with `1` for attended pairs, both in the
    /// module dtype. `sequence_lengths` is required when padding removal is
    /// enabled and ignored otherwise. Output rows past a sequence's length
    /// carry no meaning in padding-removal mode.
    pub fn forward(
        &self,
        input: &Tensor,
        attention_mask: &Tensor,
        sequence_lengths: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch_size, seq_len) = self.check_input(input)?;
        self.check_mask(attention_mask, batch_size, seq_len)?;
        let sequence_lengths = if self.config.remove_padding {
            let lengths = sequence_lengths.ok_or_else(|| {
                EncoderError::invalid_input(
                    InputArgument::SequenceLengths,
                    "required when padding removal is enabled",
                )
            })?;
            self.check_lengths(lengths, batch_size, seq_len)?;
            Some(lengths)
        } else {
            None
        };

        let output = input.zeros_like().map_err(KernelError::from)?;
        self.kernel.execute(&KernelInvocation {
            batch_size,
            seq_len,
            input,
            attention_mask,
            output: &output,
            sequence_lengths,
            remove_padding: self.config.remove_padding,
        })?;
        Ok(output)
    }

    /// The sixteen weights in storage order followed by the metadata tensor.
    pub fn get_state(&self) -> Vec<Tensor> {
        let mut state = Vec::with_capacity(STATE_LEN);
        state.extend(self.weights.as_slice().iter().cloned());
        state.push(self.metadata.clone());
        state
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn dtype(&self) -> DType {
        self.weights.dtype()
    }

    pub fn device(&self) -> &Device {
        self.weights.device()
    }

    pub fn weights(&self) -> &WeightSet {
        &self.weights
    }

    pub fn hidden_dim(&self) -> usize {
        self.config.hidden_dim()
    }

    /// `[head_count, head_size, remove_padding]` as a CPU `I64` tensor.
    pub fn metadata(&self) -> &Tensor {
        &self.metadata
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    fn check_placement(&self, argument: InputArgument, tensor: &Tensor) -> Result<()> {
        if !tensor.device().same_device(self.device()) {
            return Err(EncoderError::invalid_input(
                argument,
                format!(
                    "expected device {:?}, got {:?}",
                    self.device().location(),
                    tensor.device().location()
                ),
            ));
        }
        if !tensor.is_contiguous() {
            return Err(EncoderError::invalid_input(
                argument,
                format!("must be contiguous, got strides {:?}", tensor.stride()),
            ));
        }
        Ok(())
    }

    fn check_dtype(&self, argument: InputArgument, tensor: &Tensor) -> Result<()> {
        if tensor.dtype() != self.dtype() {
            return Err(EncoderError::invalid_input(
                argument,
                format!("expected dtype {:?}, got {:?}", self.dtype(), tensor.dtype()),
            ));
        }
        Ok(())
    }

    fn check_input(&self, input: &Tensor) -> Result<(usize, usize)> {
        let argument = InputArgument::Input;
        self.check_placement(argument, input)?;
        self.check_dtype(argument, input)?;
        let hidden = self.hidden_dim();
        match *input.dims() {
            [batch, seq, last] if batch > 0 && seq > 0 && last == hidden => Ok((batch, seq)),
            [batch, seq, last] => Err(EncoderError::invalid_input(
                argument,
                format!("expected non-empty (batch, seq_len, {hidden}), got ({batch}, {seq}, {last})"),
            )),
            ref dims => Err(EncoderError::invalid_input(
                argument,
                format!("expected rank 3 (batch, seq_len, {hidden}), got {dims:?}"),
            )),
        }
    }

    fn check_mask(&self, mask: &Tensor, batch_size: usize, seq_len: usize) -> Result<()> {
        let argument = InputArgument::AttentionMask;
        self.check_placement(argument, mask)?;
        self.check_dtype(argument, mask)?;
        if mask.dims() != [batch_size, seq_len, seq_len] {
            return Err(EncoderError::invalid_input(
                argument,
                format!(
                    "expected shape [{batch_size}, {seq_len}, {seq_len}], got {:?}",
                    mask.dims()
                ),
            ));
        }
        Ok(())
    }

    fn check_lengths(&self, lengths: &Tensor, batch_size: usize, seq_len: usize) -> Result<()> {
        let argument = InputArgument::SequenceLengths;
        self.check_placement(argument, lengths)?;
        if !LENGTH_DTYPES.contains(&lengths.dtype()) {
            return Err(EncoderError::invalid_input(
                argument,
                format!("expected integer dtype {LENGTH_DTYPES:?}, got {:?}", lengths.dtype()),
            ));
        }
        let count = match *lengths.dims() {
            [count] => count,
            ref dims => {
                return Err(EncoderError::invalid_input(
                    argument,
                    format!("expected rank 1, got shape {dims:?}"),
                ))
            }
        };
        if count == 0 {
            return Err(EncoderError::invalid_input(argument, "must not be empty"));
        }
        if count != batch_size {
            return Err(EncoderError::invalid_input(
                argument,
                format!("expected {batch_size} entries (one per batch element), got {count}"),
            ));
        }

        let values = lengths
            .to_device(&Device::Cpu)
            .and_then(|t| t.to_dtype(DType::I64))
            .and_then(|t| t.to_vec1::<i64>())
            .map_err(|err| {
                EncoderError::invalid_input(argument, format!("unreadable lengths: {err}"))
            })?;
        if let Some(bad) = values
            .iter()
            .find(|&&len| len < 0 || len as u64 > seq_len as u64)
        {
            return Err(EncoderError::invalid_input(
                argument,
                format!("length {bad} outside 0..={seq_len}"),
            ));
        }
        Ok(())
    }
}

/// Splits a state list into its configuration and the sixteen weights.
pub(crate) fn split_state(
    mut state: Vec<Tensor>,
) -> Result<(EncoderConfig, [Tensor; WEIGHT_COUNT])> {
    if state.len() != STATE_LEN {
        return Err(EncoderError::InvalidState(format!(
            "expected {STATE_LEN} tensors, got {}",
            state.len()
        )));
    }
    let metadata = state.pop().ok_or_else(|| {
        EncoderError::InvalidState("state is missing its metadata tensor".to_string())
    })?;
    let config = EncoderConfig::from_metadata(&metadata)?;
    let weights: [Tensor; WEIGHT_COUNT] = state.try_into().map_err(|rest: Vec<Tensor>| {
        EncoderError::InvalidState(format!("expected {WEIGHT_COUNT} weights, got {}", rest.len()))
    })?;
    Ok((config, weights))
}
