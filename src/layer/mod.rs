//! The kernelized attention layer.
//!
//! [`KernelAttention`] owns dense query/key/value head projections, an output
//! projection, and (optionally) a Gaussian orthogonal random projection into
//! feature space. `forward` dispatches between four computation paths:
//!
//! * the linear path, `phi(q) (phi(k)^T v)`, the default;
//! * the quadratic short-sequence path, which materializes the
//!   `q_len x k_len` feature-score matrix;
//! * an exact-softmax prefix for the first `begin_kernel` query positions;
//! * chunked windowed causal attention (see [`causal`]).
//!
//! All paths share the shape contract: the output mirrors the query's
//! `[batch, seq_len, hidden_dim]` layout and dtype.

pub mod causal;

use std::fmt;
use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::softmax_last_dim;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::core::{KernelAttentionConfig, KernelAttentionError, Result};
use crate::features::projection::sample_gaussian_matrix;
use crate::features::{feature_map, RandomProjection, NUMERIC_STABILIZER};

/// Base of the logarithm used by `scale_by_length`. Sequences of exactly this
/// length are scaled by 1.0, shorter ones are damped, longer ones amplified.
pub const LENGTH_SCALE_BASE: f64 = 512.0;

/// Linear-time kernelized attention layer.
pub struct KernelAttention {
    config: KernelAttentionConfig,
    hidden_dim: usize,
    query_proj: Tensor,
    key_proj: Tensor,
    value_proj: Tensor,
    output_proj: Tensor,
    projection: Option<RandomProjection>,
    device: Device,
    first_call: OnceLock<()>,
}

impl fmt::Debug for KernelAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelAttention")
            .field("hidden_dim", &self.hidden_dim)
            .field("config", &self.config)
            .finish()
    }
}

impl KernelAttention {
    /// Construct the layer. Weight initialization and projection sampling
    /// draw from a host-side RNG seeded with `config.seed`, so equal configs
    /// build identical layers.
    pub fn new(config: KernelAttentionConfig, hidden_dim: usize, device: &Device) -> Result<Self> {
        config.validate()?;
        if hidden_dim == 0 {
            return Err(KernelAttentionError::InvalidConfig(
                "hidden_dim must be greater than zero".into(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let inner = config.num_heads * config.key_dim;
        let input_std = (hidden_dim as f64).powf(-0.5);
        let inner_std = (inner as f64).powf(-0.5);
        let query_proj =
            sample_gaussian_matrix(&mut rng, hidden_dim, inner, device)?.affine(input_std, 0.0)?;
        let key_proj =
            sample_gaussian_matrix(&mut rng, hidden_dim, inner, device)?.affine(input_std, 0.0)?;
        let value_proj =
            sample_gaussian_matrix(&mut rng, hidden_dim, inner, device)?.affine(input_std, 0.0)?;
        let output_proj =
            sample_gaussian_matrix(&mut rng, inner, hidden_dim, device)?.affine(inner_std, 0.0)?;

        let projection = if config.num_random_features > 0 {
            Some(RandomProjection::new(
                rng,
                device,
                config.num_random_features,
                config.key_dim,
            )?)
        } else {
            None
        };

        Ok(Self {
            config,
            hidden_dim,
            query_proj,
            key_proj,
            value_proj,
            output_proj,
            projection,
            device: device.clone(),
            first_call: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &KernelAttentionConfig {
        &self.config
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Compute attention over `value` for each position of `query`.
    ///
    /// * `query` and `value` are `[batch, seq_len, hidden_dim]`; the key
    ///   input is the value input.
    /// * `attention_mask`, when present, is a `[batch, k_len]` multiplicative
    ///   padding mask (`1.0` keep, `0.0` drop).
    /// * `training` controls projection redraw; inference never redraws.
    ///
    /// The output mirrors the query's leading shape and dtype.
    pub fn forward(
        &self,
        query: &Tensor,
        value: &Tensor,
        attention_mask: Option<&Tensor>,
        training: bool,
    ) -> Result<Tensor> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "kernel_attention init heads={} key_dim={} transform={} random_features={} redraw={} short_seq={} begin_kernel={} windowed={} scale_by_length={}",
                self.config.num_heads,
                self.config.key_dim,
                self.config.feature_transform,
                self.config.num_random_features,
                self.config.redraw,
                self.config.is_short_seq,
                self.config.begin_kernel,
                self.config.use_windowed_causal,
                self.config.scale_by_length,
            );
        }

        let dtype = query.dtype();
        if dtype != value.dtype() {
            return Err(KernelAttentionError::InvalidShape(
                "query and value must share the same dtype".into(),
            ));
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(KernelAttentionError::UnsupportedDType(format!("{dtype:?}")));
        }
        if !self.device.same_device(query.device()) || !self.device.same_device(value.device()) {
            return Err(KernelAttentionError::InvalidShape(
                "inputs must reside on the layer device".into(),
            ));
        }

        let (batch, q_len, q_dim) = query.dims3().map_err(|_| {
            KernelAttentionError::InvalidShape(
                "query must have shape [batch, seq_len, hidden_dim]".into(),
            )
        })?;
        let (vb, k_len, v_dim) = value.dims3().map_err(|_| {
            KernelAttentionError::InvalidShape(
                "value must have shape [batch, seq_len, hidden_dim]".into(),
            )
        })?;
        if vb != batch {
            return Err(KernelAttentionError::InvalidShape(format!(
                "value batch mismatch: expected {batch}, got {vb}"
            )));
        }
        if q_dim != self.hidden_dim || v_dim != self.hidden_dim {
            return Err(KernelAttentionError::InvalidShape(format!(
                "inputs must have hidden_dim {}, got query {q_dim} and value {v_dim}",
                self.hidden_dim
            )));
        }
        if self.config.use_windowed_causal {
            if q_len != k_len {
                return Err(KernelAttentionError::InvalidShape(format!(
                    "windowed causal attention requires q_len == k_len, got {q_len} and {k_len}"
                )));
            }
            if q_len % self.config.chunk_length != 0 {
                return Err(KernelAttentionError::InvalidShape(format!(
                    "sequence length {q_len} is not divisible by chunk_length {}",
                    self.config.chunk_length
                )));
            }
        }

        let key_mask = match attention_mask {
            Some(mask) => {
                let (mb, mk) = mask.dims2().map_err(|_| {
                    KernelAttentionError::InvalidShape(
                        "attention_mask must have shape [batch, key_len]".into(),
                    )
                })?;
                if mb != batch || mk != k_len {
                    return Err(KernelAttentionError::InvalidShape(format!(
                        "attention_mask shape mismatch: expected [{batch}, {k_len}], got [{mb}, {mk}]"
                    )));
                }
                Some(mask.to_dtype(DType::F32)?)
            }
            None => None,
        };

        let q32 = query.to_dtype(DType::F32)?;
        let v32 = value.to_dtype(DType::F32)?;

        let normalizer = (self.config.key_dim as f64).powf(-0.25);
        let mut q = self
            .project_heads(&q32, &self.query_proj)?
            .affine(normalizer, 0.0)?;
        let k = self
            .project_heads(&v32, &self.key_proj)?
            .affine(normalizer, 0.0)?;
        let v = self.project_heads(&v32, &self.value_proj)?;

        if self.config.scale_by_length {
            let factor = (k_len.max(1) as f64).ln() / LENGTH_SCALE_BASE.ln();
            q = q.affine(factor, 0.0)?;
        }

        if training && self.config.redraw {
            if let Some(projection) = &self.projection {
                projection.redraw(&self.device)?;
            }
        }
        let projection_matrix = self.projection.as_ref().map(|p| p.matrix()).transpose()?;

        let transform = self.config.feature_transform;
        let phi_q = feature_map(transform, &q, projection_matrix.as_ref(), true)?;
        let mut phi_k = feature_map(transform, &k, projection_matrix.as_ref(), false)?;
        if let Some(mask) = &key_mask {
            phi_k = phi_k.broadcast_mul(&mask.reshape((batch, 1, k_len, 1))?)?;
        }

        let context = if self.config.use_windowed_causal {
            causal::windowed_attention(
                &phi_q,
                &phi_k,
                &v,
                self.config.chunk_length,
                self.config.window_length,
            )?
        } else if self.config.begin_kernel > 0 {
            let split = self.config.begin_kernel.min(q_len);
            let prefix_keys = self.config.begin_kernel.min(k_len);
            let prefix_mask = key_mask
                .as_ref()
                .map(|m| m.narrow(1, 0, prefix_keys))
                .transpose()?;
            let prefix = self.softmax_attention(
                &q.narrow(2, 0, split)?,
                &k.narrow(2, 0, prefix_keys)?,
                &v.narrow(2, 0, prefix_keys)?,
                prefix_mask.as_ref(),
            )?;
            if split < q_len {
                let phi_q_tail = phi_q.narrow(2, split, q_len - split)?.contiguous()?;
                let tail = if self.config.is_short_seq {
                    quadratic_attention(&phi_q_tail, &phi_k, &v)?
                } else {
                    linear_attention(&phi_q_tail, &phi_k, &v)?
                };
                Tensor::cat(&[&prefix, &tail], 2)?
            } else {
                prefix
            }
        } else if self.config.is_short_seq {
            quadratic_attention(&phi_q, &phi_k, &v)?
        } else {
            linear_attention(&phi_q, &phi_k, &v)?
        };

        let output = self.merge_heads(&context)?;
        Ok(output.to_dtype(dtype)?)
    }

    fn project_heads(&self, input: &Tensor, weights: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = input.dims3()?;
        let projected = input.broadcast_matmul(weights)?;
        let split =
            projected.reshape((batch, seq, self.config.num_heads, self.config.key_dim))?;
        Ok(split.transpose(1, 2)?.contiguous()?)
    }

    fn merge_heads(&self, context: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq, dim) = context.dims4()?;
        let merged = context
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, heads * dim))?;
        Ok(merged.broadcast_matmul(&self.output_proj)?)
    }

    /// Exact softmax attention for the `begin_kernel` prefix.
    ///
    /// The `1/sqrt(key_dim)` score scale is already carried by the normalized
    /// queries and keys. Padding is applied multiplicatively to the
    /// probabilities and renormalized, so fully masked rows yield zeros
    /// rather than NaN.
    fn softmax_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        key_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch, heads, q_len, dim) = q.dims4()?;
        let k_len = k.dim(2)?;
        let merged = batch * heads;

        let q_flat = q.contiguous()?.reshape((merged, q_len, dim))?;
        let k_flat = k.contiguous()?.reshape((merged, k_len, dim))?;
        let scores = q_flat.matmul(&k_flat.transpose(1, 2)?.contiguous()?)?;
        let probs = softmax_last_dim(&scores)?.reshape((batch, heads, q_len, k_len))?;

        let probs = match key_mask {
            Some(mask) => {
                let masked = probs.broadcast_mul(&mask.reshape((batch, 1, 1, k_len))?)?;
                let denom = masked
                    .sum_keepdim(D::Minus1)?
                    .affine(1.0, NUMERIC_STABILIZER)?;
                masked.broadcast_div(&denom)?
            }
            None => probs,
        };

        let context = probs
            .reshape((merged, q_len, k_len))?
            .matmul(&v.contiguous()?.reshape((merged, k_len, dim))?)?;
        Ok(context.reshape((batch, heads, q_len, dim))?)
    }
}

/// Quadratic feature-score attention for short sequences.
pub(crate) fn quadratic_attention(
    phi_q: &Tensor,
    phi_k: &Tensor,
    v: &Tensor,
) -> candle_core::Result<Tensor> {
    let (batch, heads, q_len, m) = phi_q.dims4()?;
    let k_len = phi_k.dim(2)?;
    let dim = v.dim(D::Minus1)?;
    let merged = batch * heads;

    let scores = phi_q.reshape((merged, q_len, m))?.matmul(
        &phi_k
            .reshape((merged, k_len, m))?
            .transpose(1, 2)?
            .contiguous()?,
    )?;
    let denom = scores
        .sum_keepdim(D::Minus1)?
        .affine(1.0, NUMERIC_STABILIZER)?;
    let weights = scores.broadcast_div(&denom)?;
    let context = weights.matmul(&v.reshape((merged, k_len, dim))?)?;
    context.reshape((batch, heads, q_len, dim))
}

/// Linear-time attention: `phi(q) (phi(k)^T v)` normalized by
/// `phi(q) . sum(phi(k))`.
pub(crate) fn linear_attention(
    phi_q: &Tensor,
    phi_k: &Tensor,
    v: &Tensor,
) -> candle_core::Result<Tensor> {
    let (batch, heads, q_len, m) = phi_q.dims4()?;
    let k_len = phi_k.dim(2)?;
    let dim = v.dim(D::Minus1)?;
    let merged = batch * heads;

    let phi_q_flat = phi_q.reshape((merged, q_len, m))?;
    let phi_k_flat = phi_k.reshape((merged, k_len, m))?;
    let kv = phi_k_flat
        .transpose(1, 2)?
        .contiguous()?
        .matmul(&v.reshape((merged, k_len, dim))?)?;
    let numerator = phi_q_flat.matmul(&kv)?;
    let key_sums = phi_k.sum(2)?.reshape((merged, m, 1))?;
    let denom = phi_q_flat
        .matmul(&key_sums)?
        .affine(1.0, NUMERIC_STABILIZER)?;
    numerator.broadcast_div(&denom)?.reshape((batch, heads, q_len, dim))
}
