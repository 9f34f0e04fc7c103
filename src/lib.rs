//! Kernelized attention with random-feature projections for Candle.
//!
//! The crate implements a linear-time approximation of softmax attention:
//! queries and keys are mapped into a nonnegative feature space, optionally
//! through a Gaussian orthogonal random projection, and attention is computed
//! as two matrix products instead of a full `seq x seq` score matrix. Inputs
//! are `[batch, seq_len, hidden_dim]` tensors (bf16, f16, or f32); compute is
//! performed in `f32` and the output matches the input dtype and leading
//! shape.
//!
//! Besides the linear path the layer supports a quadratic short-sequence
//! path, an exact-softmax prefix for the first `begin_kernel` positions, and
//! a chunked windowed causal variant that restricts attention to a local
//! window of recent chunks. Padding masks are multiplicative `[batch, k_len]`
//! tensors; accepted shapes are documented on
//! [`KernelAttention::forward`](layer::KernelAttention::forward).

pub mod core;
pub mod features;
pub mod layer;
pub mod masks;

pub use core::{FeatureTransform, KernelAttentionConfig, KernelAttentionError};
pub use layer::KernelAttention;
