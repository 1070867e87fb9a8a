//! Configuration options shared by all attention implementations.

/// Additive value written for masked positions when converting binary masks.
///
/// Large and finite so fully masked rows still produce a finite softmax.
pub const DEFAULT_MASK_FILL: f32 = -10_000.0;

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Multiplier applied to `Q·Kᵀ`. `None` uses `1 / sqrt(head_dim)`.
    pub scale: Option<f32>,
    /// Additive value used for masked positions.
    pub mask_fill: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scale: None,
            mask_fill: DEFAULT_MASK_FILL,
        }
    }
}

impl Config {
    /// Resolves the score scale for a given head dimension.
    pub fn scale_for(&self, head_dim: usize) -> f32 {
        self.scale
            .unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt())
    }
}
