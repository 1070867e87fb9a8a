//! Activation catalogue for encoder feed-forward stacks.
//!
//! Activations consume tensors of any layout and return tensors with identical
//! layout. Each implementation promotes inputs to the compute dtype requested
//! by [`PrecisionPolicy`] before evaluating the non-linearity, then casts the
//! result back to the storage dtype.
//!
//! # Built-in formulas
//!
//! * **GELU** uses the tanh approximation
//!   `0.5 * x * (1 + tanh(sqrt(2 / pi) * (x + 0.044715 * x^3)))`, the form
//!   BERT-style encoder kernels evaluate.
//! * **Identity** only casts to the storage dtype.

use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Identity function, useful for debugging or wiring custom stacks.
    Identity,
    /// GeLU with the tanh approximation.
    Gelu,
}

/// Common interface shared by transformer-friendly activation functions.
pub trait Activation: Send + Sync {
    /// Returns the [`ActivationKind`] for introspection when wiring composite blocks.
    fn kind(&self) -> ActivationKind;

    /// Applies the activation to `input` using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        match self.kind {
            ActivationKind::Identity => policy.cast_to_storage(input),
            ActivationKind::Gelu => policy.cast_to_storage(&policy.cast_for_matmul(input)?.gelu()?),
        }
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}
