//! The sixteen encoder-layer parameters and their validation gate.
//!
//! Tensors are kept in a fixed order (see [`WeightName::ALL`]). Kernel matrices
//! are stored `(out_features, in_features)`:
//!
//! | name                 | shape             |
//! |----------------------|-------------------|
//! | `q/k/v_kernel`       | `(h, h)`          |
//! | `attn_out_kernel`    | `(h, h)`          |
//! | `inter_kernel`       | `(4h, h)`         |
//! | `out_kernel`         | `(h, 4h)`         |
//! | `inter_bias`         | `(4h,)`           |
//! | other bias/gamma/beta| `(h,)`            |
//!
//! A [`WeightSet`] holds Candle tensor handles, which share storage with the
//! tensors the caller passed in. Validation never copies, casts or reshapes.

use std::fmt;

use candle_core::{DType, Device, Tensor};

use crate::error::{EncoderError, Result};

/// Number of parameter tensors in one encoder layer.
pub const WEIGHT_COUNT: usize = 16;

/// Feed-forward expansion ratio.
pub const INTERMEDIATE_RATIO: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightName {
    QKernel,
    QBias,
    KKernel,
    KBias,
    VKernel,
    VBias,
    AttnOutKernel,
    AttnOutBias,
    AttnOutLnGamma,
    AttnOutLnBeta,
    InterKernel,
    InterBias,
    OutKernel,
    OutBias,
    OutLnGamma,
    OutLnBeta,
}

impl WeightName {
    /// All names in storage order.
    pub const ALL: [WeightName; WEIGHT_COUNT] = [
        WeightName::QKernel,
        WeightName::QBias,
        WeightName::KKernel,
        WeightName::KBias,
        WeightName::VKernel,
        WeightName::VBias,
        WeightName::AttnOutKernel,
        WeightName::AttnOutBias,
        WeightName::AttnOutLnGamma,
        WeightName::AttnOutLnBeta,
        WeightName::InterKernel,
        WeightName::InterBias,
        WeightName::OutKernel,
        WeightName::OutBias,
        WeightName::OutLnGamma,
        WeightName::OutLnBeta,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WeightName::QKernel => "q_kernel",
            WeightName::QBias => "q_bias",
            WeightName::KKernel => "k_kernel",
            WeightName::KBias => "k_bias",
            WeightName::VKernel => "v_kernel",
            WeightName::VBias => "v_bias",
            WeightName::AttnOutKernel => "attn_out_kernel",
            WeightName::AttnOutBias => "attn_out_bias",
            WeightName::AttnOutLnGamma => "attn_out_ln_gamma",
            WeightName::AttnOutLnBeta => "attn_out_ln_beta",
            WeightName::InterKernel => "inter_kernel",
            WeightName::InterBias => "inter_bias",
            WeightName::OutKernel => "out_kernel",
            WeightName::OutBias => "out_bias",
            WeightName::OutLnGamma => "out_ln_gamma",
            WeightName::OutLnBeta => "out_ln_beta",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|weight| weight.as_str() == name)
    }

    /// Required dimensions for a layer with the given hidden size.
    pub fn expected_shape(self, hidden: usize) -> Vec<usize> {
        let inter = hidden.saturating_mul(INTERMEDIATE_RATIO);
        match self {
            WeightName::QKernel
            | WeightName::KKernel
            | WeightName::VKernel
            | WeightName::AttnOutKernel => vec![hidden, hidden],
            WeightName::InterKernel => vec![inter, hidden],
            WeightName::OutKernel => vec![hidden, inter],
            WeightName::InterBias => vec![inter],
            WeightName::QBias
            | WeightName::KBias
            | WeightName::VBias
            | WeightName::AttnOutBias
            | WeightName::AttnOutLnGamma
            | WeightName::AttnOutLnBeta
            | WeightName::OutBias
            | WeightName::OutLnGamma
            | WeightName::OutLnBeta => vec![hidden],
        }
    }
}

impl fmt::Display for WeightName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Property a weight tensor can fail on, in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightProperty {
    Device,
    Contiguity,
    DType,
    Shape,
}

impl fmt::Display for WeightProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WeightProperty::Device => "device",
            WeightProperty::Contiguity => "layout",
            WeightProperty::DType => "dtype",
            WeightProperty::Shape => "shape",
        };
        f.write_str(name)
    }
}

/// Validated, immutable set of encoder-layer parameters.
#[derive(Debug, Clone)]
pub struct WeightSet {
    tensors: [Tensor; WEIGHT_COUNT],
    dtype: DType,
    device: Device,
    hidden_dim: usize,
}

impl WeightSet {
    /// Checks every tensor against `dtype`, `device` and the shapes implied by
    /// `hidden_dim`, returning the tensors unchanged on success.
    ///
    /// Tensors are checked in storage order, each for device, contiguity,
    /// dtype and shape; the first failure is reported.
    pub fn validate(
        tensors: [Tensor; WEIGHT_COUNT],
        dtype: DType,
        device: &Device,
        hidden_dim: usize,
    ) -> Result<Self> {
        for (name, tensor) in WeightName::ALL.into_iter().zip(tensors.iter()) {
            check_weight(name, tensor, dtype, device, hidden_dim)?;
        }
        Ok(Self {
            tensors,
            dtype,
            device: device.clone(),
            hidden_dim,
        })
    }

    pub fn get(&self, name: WeightName) -> &Tensor {
        &self.tensors[name.index()]
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// `(name, tensor)` pairs in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (WeightName, &Tensor)> {
        WeightName::ALL.into_iter().zip(self.tensors.iter())
    }

    pub fn as_slice(&self) -> &[Tensor] {
        &self.tensors
    }
}

fn check_weight(
    name: WeightName,
    tensor: &Tensor,
    dtype: DType,
    device: &Device,
    hidden_dim: usize,
) -> Result<()> {
    let fail = |property, expected: String, actual: String| EncoderError::InvalidWeight {
        name,
        property,
        expected,
        actual,
    };

    if !tensor.device().same_device(device) {
        return Err(fail(
            WeightProperty::Device,
            format!("{:?}", device.location()),
            format!("{:?}", tensor.device().location()),
        ));
    }
    if !tensor.is_contiguous() {
        return Err(fail(
            WeightProperty::Contiguity,
            "contiguous row-major".to_string(),
            format!("strides {:?}", tensor.stride()),
        ));
    }
    if tensor.dtype() != dtype {
        return Err(fail(
            WeightProperty::DType,
            format!("{dtype:?}"),
            format!("{:?}", tensor.dtype()),
        ));
    }
    let expected = name.expected_shape(hidden_dim);
    if tensor.dims() != expected.as_slice() {
        return Err(fail(
            WeightProperty::Shape,
            format!("{expected:?}"),
            format!("{:?}", tensor.dims()),
        ));
    }
    Ok(())
}
