//! Layer configuration and the feature-transform catalogue.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::errors::{KernelAttentionError, Result};

/// Nonlinearity applied when mapping queries and keys into feature space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureTransform {
    /// `relu(u) + eps`. Cheap, but not an unbiased softmax estimator.
    Relu,
    /// `elu(u) + 1`, strictly positive features.
    Elu,
    /// Softmax-kernel estimator with per-row stabilization on the query side.
    Exp,
    /// As [`Exp`](Self::Exp), stabilized over the whole sequence slab.
    ExpPlus,
}

impl FeatureTransform {
    /// All supported transforms, in declaration order.
    pub const ALL: [FeatureTransform; 4] = [
        FeatureTransform::Relu,
        FeatureTransform::Elu,
        FeatureTransform::Exp,
        FeatureTransform::ExpPlus,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FeatureTransform::Relu => "relu",
            FeatureTransform::Elu => "elu",
            FeatureTransform::Exp => "exp",
            FeatureTransform::ExpPlus => "expplus",
        }
    }
}

impl fmt::Display for FeatureTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FeatureTransform {
    type Err = KernelAttentionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "relu" => Ok(FeatureTransform::Relu),
            "elu" => Ok(FeatureTransform::Elu),
            "exp" => Ok(FeatureTransform::Exp),
            "expplus" => Ok(FeatureTransform::ExpPlus),
            other => Err(KernelAttentionError::InvalidConfig(format!(
                "Unsupported feature_transform {other:?}; expected one of relu, elu, exp, expplus"
            ))),
        }
    }
}

/// Hyperparameters of the kernel attention layer.
///
/// `num_random_features == 0` disables the random projection and applies the
/// feature transform to the scaled queries and keys directly. `begin_kernel`
/// selects how many leading query positions use exact softmax attention
/// before the kernel approximation takes over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelAttentionConfig {
    pub num_heads: usize,
    pub key_dim: usize,
    pub feature_transform: FeatureTransform,
    pub num_random_features: usize,
    /// Seed for weight initialization and projection sampling. Two layers
    /// built from equal configs produce identical outputs.
    pub seed: u64,
    /// Re-sample the projection matrix on every training-mode forward pass.
    pub redraw: bool,
    /// Use the quadratic feature-score path instead of the linear one.
    pub is_short_seq: bool,
    pub begin_kernel: usize,
    /// Scale queries by `ln(k_len) / ln(512)` before the feature map.
    pub scale_by_length: bool,
    pub use_windowed_causal: bool,
    pub chunk_length: usize,
    pub window_length: usize,
}

impl Default for KernelAttentionConfig {
    fn default() -> Self {
        Self {
            num_heads: 1,
            key_dim: 64,
            feature_transform: FeatureTransform::Exp,
            num_random_features: 256,
            seed: 0,
            redraw: false,
            is_short_seq: false,
            begin_kernel: 0,
            scale_by_length: false,
            use_windowed_causal: false,
            chunk_length: 128,
            window_length: 3,
        }
    }
}

impl KernelAttentionConfig {
    /// Validate structural invariants before any tensor work.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 {
            return Err(KernelAttentionError::InvalidConfig(
                "num_heads must be greater than zero".into(),
            ));
        }
        if self.key_dim == 0 {
            return Err(KernelAttentionError::InvalidConfig(
                "key_dim must be greater than zero".into(),
            ));
        }
        if self.redraw && self.num_random_features == 0 {
            return Err(KernelAttentionError::InvalidConfig(
                "There is nothing to redraw when num_random_features is 0".into(),
            ));
        }
        if self.use_windowed_causal {
            if self.chunk_length == 0 {
                return Err(KernelAttentionError::InvalidConfig(
                    "chunk_length must be greater than zero".into(),
                ));
            }
            if self.window_length == 0 {
                return Err(KernelAttentionError::InvalidConfig(
                    "window_length must be greater than zero".into(),
                ));
            }
            if self.is_short_seq {
                return Err(KernelAttentionError::InvalidConfig(
                    "windowed causal attention is incompatible with is_short_seq".into(),
                ));
            }
            if self.begin_kernel > 0 {
                return Err(KernelAttentionError::InvalidConfig(
                    "windowed causal attention is incompatible with begin_kernel".into(),
                ));
            }
        }
        Ok(())
    }

    /// Serialize the configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Rebuild a configuration from JSON, validating the result.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }
}
