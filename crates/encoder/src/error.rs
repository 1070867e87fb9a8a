use thiserror::Error;

use crate::kernel::KernelError;
use crate::weights::{WeightName, WeightProperty};

pub type Result<T> = std::result::Result<T, EncoderError>;

/// Per-call arguments accepted by [`EncoderModule::forward`](crate::EncoderModule::forward).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputArgument {
    Input,
    AttentionMask,
    SequenceLengths,
}

impl InputArgument {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputArgument::Input => "input",
            InputArgument::AttentionMask => "attention_mask",
            InputArgument::SequenceLengths => "sequence_lengths",
        }
    }
}

impl std::fmt::Display for InputArgument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("invalid weight `{name}`: {property} expected {expected}, got {actual}")]
    InvalidWeight {
        name: WeightName,
        property: WeightProperty,
        expected: String,
        actual: String,
    },

    #[error("unsupported precision {dtype:?}: only F32 and F16 encoder kernels exist")]
    UnsupportedPrecision { dtype: candle_core::DType },

    #[error("invalid `{argument}`: {reason}")]
    InvalidInput {
        argument: InputArgument,
        reason: String,
    },

    #[error("encoder kernel failed: {0}")]
    KernelFailure(#[source] KernelError),

    #[error("invalid encoder configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid encoder state: {0}")]
    InvalidState(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde_json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl EncoderError {
    pub(crate) fn invalid_input(argument: InputArgument, reason: impl Into<String>) -> Self {
        EncoderError::InvalidInput {
            argument,
            reason: reason.into(),
        }
    }

    pub(crate) fn persistence(message: impl Into<String>) -> Self {
        EncoderError::Persistence(message.into())
    }
}

impl From<KernelError> for EncoderError {
    fn from(err: KernelError) -> Self {
        EncoderError::KernelFailure(err)
    }
}
