//! Position-wise feed-forward blocks built on top of projections and activations.
//!
//! MLPs operate on hidden states shaped `(batch, seq, hidden)` and return the
//! same layout. The intermediate projection expands the hidden dimension to
//! `config.intermediate_size`, the activation is applied, and the output
//! projection contracts back to the model hidden size.

use std::{fmt, sync::Arc};

use candle_core::{Result, Tensor};

use crate::{
    activations::{self, Activation, ActivationKind},
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearLayer},
};

/// Configuration shared by transformer feed-forward networks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
    /// Activation applied between projections.
    pub activation: ActivationKind,
}

impl FeedForwardConfig {
    /// Creates a standard two-projection MLP configuration.
    pub fn new(hidden_size: usize, intermediate_size: usize, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation,
        }
    }
}

/// Shared interface for feed-forward stacks.
pub trait FeedForwardLayer: Send + Sync {
    /// Configuration metadata used during block assembly.
    fn config(&self) -> &FeedForwardConfig;

    /// Performs the forward pass through the MLP.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Expand, activate, contract.
#[derive(Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    intermediate: Linear,
    output: Linear,
    activation: Arc<dyn Activation>,
}

impl fmt::Debug for FeedForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedForward")
            .field("config", &self.config)
            .finish()
    }
}

impl FeedForward {
    /// Builds the block from pre-existing projection parameters.
    ///
    /// `inter_weight` is `(intermediate, hidden)` and `out_weight` is
    /// `(hidden, intermediate)`.
    pub fn new(
        config: FeedForwardConfig,
        inter_weight: Tensor,
        inter_bias: Tensor,
        out_weight: Tensor,
        out_bias: Tensor,
    ) -> Result<Self> {
        let intermediate = Linear::new(
            LinearConfig::new(config.hidden_size, config.intermediate_size),
            inter_weight,
            inter_bias,
        )?;
        let output = Linear::new(
            LinearConfig::new(config.intermediate_size, config.hidden_size),
            out_weight,
            out_bias,
        )?;
        let activation = activations::builtin(config.activation);
        Ok(Self {
            config,
            intermediate,
            output,
            activation,
        })
    }
}

impl FeedForwardLayer for FeedForward {
    fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("mlp.input", hidden, self.config.hidden_size)?;
        let expanded = self.intermediate.forward(hidden, policy)?;
        let activated = self.activation.forward(&expanded, policy)?;
        self.output.forward(&activated, policy)
    }
}
