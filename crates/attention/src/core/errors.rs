//! Failures reported by [`Attention`](super::Attention) implementations.

use std::fmt;

#[derive(Debug)]
pub enum AttentionError {
    /// Q/K/V or mask layout disagrees with `[batch, heads, seq, head_dim]`.
    InvalidShape { context: String },
    UnsupportedDType { requested: String },
    /// Error raised by the tensor backend while computing.
    Backend { message: String },
}

impl fmt::Display for AttentionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidShape { context } => write!(f, "attention shape mismatch: {context}"),
            Self::UnsupportedDType { requested } => {
                write!(f, "attention cannot run in dtype {requested}")
            }
            Self::Backend { message } => write!(f, "attention backend failure: {message}"),
        }
    }
}

impl std::error::Error for AttentionError {}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }
}
