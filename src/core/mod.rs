//! Configuration and error types shared across the crate.
//!
//! The [`KernelAttentionConfig`] struct names every hyperparameter of the
//! layer and serializes through serde, so a configuration can be
//! round-tripped to JSON and rebuilt without loss. Validation lives on the
//! config rather than the layer so invalid combinations are rejected before
//! any tensor work happens.

pub mod config;
pub mod errors;

pub use config::{FeatureTransform, KernelAttentionConfig};
pub use errors::{KernelAttentionError, Result};
