//! Error types emitted by the kernel attention layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KernelAttentionError>;

#[derive(Error, Debug)]
pub enum KernelAttentionError {
    /// The configuration combines hyperparameters the layer cannot honor.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {0}")]
    InvalidShape(String),

    /// The layer does not support the requested data type.
    #[error("unsupported dtype {0}")]
    UnsupportedDType(String),

    /// A tensor backend failure propagated to the caller.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    /// Configuration (de)serialization failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
