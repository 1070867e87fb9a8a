use std::{fs, path::Path};

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{EncoderError, Result};
use crate::weights::INTERMEDIATE_RATIO;

/// Number of entries in the packed metadata tensor.
pub const METADATA_LEN: usize = 3;

/// Hyperparameters fixed for the lifetime of an encoder module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub head_count: usize,
    pub head_size: usize,
    #[serde(default)]
    pub remove_padding: bool,
}

impl EncoderConfig {
    pub fn new(head_count: usize, head_size: usize, remove_padding: bool) -> Self {
        Self {
            head_count,
            head_size,
            remove_padding,
        }
    }

    /// `head_count * head_size`.
    pub fn hidden_dim(&self) -> usize {
        self.head_count * self.head_size
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.head_count == 0 {
            errors.push("head_count must be greater than zero".to_string());
        }
        if self.head_size == 0 {
            errors.push("head_size must be greater than zero".to_string());
        }
        for (label, value) in [("head_count", self.head_count), ("head_size", self.head_size)] {
            if i64::try_from(value).is_err() {
                errors.push(format!("{label} {value} does not fit the metadata tensor"));
            }
        }
        match self.head_count.checked_mul(self.head_size) {
            None => errors.push("head_count * head_size overflows".to_string()),
            Some(hidden) if hidden.checked_mul(INTERMEDIATE_RATIO).is_none() => errors.push(
                format!("feed-forward width {INTERMEDIATE_RATIO} * {hidden} overflows"),
            ),
            Some(_) => {}
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EncoderError::InvalidConfig(errors.join("; ")))
        }
    }

    /// Packs `(head_count, head_size, remove_padding)` into a CPU `I64` tensor.
    pub fn metadata_tensor(&self) -> Result<Tensor> {
        let values = [
            self.head_count as i64,
            self.head_size as i64,
            i64::from(self.remove_padding),
        ];
        Tensor::new(&values, &Device::Cpu).map_err(|err| {
            EncoderError::InvalidState(format!("failed to build metadata tensor: {err}"))
        })
    }

    /// Decodes the tensor produced by [`EncoderConfig::metadata_tensor`].
    pub fn from_metadata(metadata: &Tensor) -> Result<Self> {
        if metadata.dims() != [METADATA_LEN] {
            return Err(EncoderError::InvalidState(format!(
                "metadata tensor must have shape [{METADATA_LEN}], got {:?}",
                metadata.dims()
            )));
        }
        if !matches!(metadata.dtype(), DType::I64 | DType::U32 | DType::U8) {
            return Err(EncoderError::InvalidState(format!(
                "metadata tensor must hold integers, got {:?}",
                metadata.dtype()
            )));
        }
        let values = metadata
            .to_dtype(DType::I64)
            .and_then(|t| t.to_vec1::<i64>())
            .map_err(|err| EncoderError::InvalidState(format!("unreadable metadata: {err}")))?;

        let dim = |index: usize, label: &str| -> Result<usize> {
            usize::try_from(values[index])
                .ok()
                .filter(|value| *value > 0)
                .ok_or_else(|| {
                    EncoderError::InvalidState(format!(
                        "metadata {label} must be positive, got {}",
                        values[index]
                    ))
                })
        };
        let head_count = dim(0, "head_count")?;
        let head_size = dim(1, "head_size")?;
        let remove_padding = match values[2] {
            0 => false,
            1 => true,
            other => {
                return Err(EncoderError::InvalidState(format!(
                    "metadata remove_padding must be 0 or 1, got {other}"
                )))
            }
        };
        Ok(Self::new(head_count, head_size, remove_padding))
    }

    /// Loads a configuration from a `.json` or `.toml` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: EncoderConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(EncoderError::InvalidConfig(format!(
                    "unsupported configuration extension '{other}'"
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }
}
