//! Chunked windowed causal attention for the linear path.
//!
//! The sequence is split into chunks of `chunk_length`. Per-chunk key
//! statistics (`phi(k)^T v` and `sum(phi(k))`) are pooled over a sliding
//! window of the most recent `window_length` chunks, computed as a cumulative
//! sum along the chunk axis minus the same cumulative sum lagged by the
//! window. Queries in chunk `c` attend to the pooled context of chunks
//! `max(0, c - window_length + 1) ..= c`: causality holds at chunk
//! granularity, and no `seq x seq` score matrix is ever materialized.

use candle_core::{Result, Tensor};

use crate::features::NUMERIC_STABILIZER;

/// Windowed causal linear attention over chunked feature maps.
///
/// `phi_q` and `phi_k` are `[batch, heads, seq, m]`, `v` is
/// `[batch, heads, seq, dim]`; `seq` must be divisible by `chunk_length`
/// (the caller validates this).
pub(crate) fn windowed_attention(
    phi_q: &Tensor,
    phi_k: &Tensor,
    v: &Tensor,
    chunk_length: usize,
    window_length: usize,
) -> Result<Tensor> {
    let (batch, heads, seq, m) = phi_q.dims4()?;
    let dim = v.dims4()?.3;
    let chunks = seq / chunk_length;
    let flat_chunks = batch * heads * chunks;

    let q_chunked = phi_q.reshape((flat_chunks, chunk_length, m))?;
    let k_chunked = phi_k.reshape((flat_chunks, chunk_length, m))?;
    let v_chunked = v.reshape((flat_chunks, chunk_length, dim))?;

    // Per-chunk key statistics.
    let kv = k_chunked
        .transpose(1, 2)?
        .contiguous()?
        .matmul(&v_chunked)?;
    let key_sums = k_chunked.sum(1)?;

    // Pool statistics over the trailing window of chunks.
    let kv = windowed_sum(&kv.reshape((batch, heads, chunks, m, dim))?, window_length)?
        .reshape((flat_chunks, m, dim))?;
    let key_sums = windowed_sum(&key_sums.reshape((batch, heads, chunks, m, 1))?, window_length)?
        .reshape((flat_chunks, m, 1))?;

    let numerator = q_chunked.matmul(&kv)?;
    let denom = q_chunked
        .matmul(&key_sums)?
        .affine(1.0, NUMERIC_STABILIZER)?;
    numerator
        .broadcast_div(&denom)?
        .reshape((batch, heads, seq, dim))
}

/// Sliding-window sum along the chunk axis (dim 2).
fn windowed_sum(t: &Tensor, window: usize) -> Result<Tensor> {
    let chunks = t.dim(2)?;
    // candle's cumsum matmuls along the target dim, and the CPU backend only
    // supports rank-4 (two batch dims) matmuls with the summed dim last; fold
    // batch/heads together and move the chunk axis last before summing.
    let cumulative = t
        .flatten(0, 1)?
        .transpose(1, 3)?
        .contiguous()?
        .cumsum(3)?
        .transpose(1, 3)?
        .contiguous()?
        .reshape(t.shape())?;
    if window >= chunks {
        return Ok(cumulative);
    }
    let mut lag_dims = t.dims().to_vec();
    lag_dims[2] = window;
    let zeros = Tensor::zeros(lag_dims, t.dtype(), t.device())?;
    let lagged = Tensor::cat(&[&zeros, &cumulative.narrow(2, 0, chunks - window)?], 2)?;
    cumulative.sub(&lagged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::linear_attention;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn uniform_tensor(
        rng: &mut StdRng,
        lo: f32,
        hi: f32,
        shape: (usize, usize, usize, usize),
        device: &Device,
    ) -> Result<Tensor> {
        let (a, b, c, d) = shape;
        let data: Vec<f32> = (0..a * b * c * d)
            .map(|_| lo + (hi - lo) * rng.gen::<f32>())
            .collect();
        Tensor::from_vec(data, shape, device)
    }

    fn feature_inputs(device: &Device, seq: usize) -> Result<(Tensor, Tensor, Tensor)> {
        let mut rng = StdRng::seed_from_u64(3);
        // Feature maps are nonnegative in practice; mirror that here.
        let phi_q = uniform_tensor(&mut rng, 0.0, 1.0, (1, 2, seq, 4), device)?;
        let phi_k = uniform_tensor(&mut rng, 0.0, 1.0, (1, 2, seq, 4), device)?;
        let values: Vec<f32> = (0..2 * seq * 3)
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();
        let v = Tensor::from_vec(values, (1, 2, seq, 3), device)?;
        Ok((phi_q, phi_k, v))
    }

    #[test]
    fn single_chunk_matches_bidirectional_linear_attention() -> Result<()> {
        let device = Device::Cpu;
        let (phi_q, phi_k, v) = feature_inputs(&device, 6)?;
        let windowed = windowed_attention(&phi_q, &phi_k, &v, 6, 3)?;
        let full = linear_attention(&phi_q, &phi_k, &v)?;
        let diff = windowed
            .sub(&full)?
            .abs()?
            .flatten_all()?
            .to_vec1::<f32>()?
            .into_iter()
            .fold(0.0_f32, f32::max);
        assert!(diff < 1e-5, "single-chunk window diverged by {diff}");
        Ok(())
    }

    #[test]
    fn early_chunks_ignore_future_keys() -> Result<()> {
        let device = Device::Cpu;
        let (phi_q, phi_k, v) = feature_inputs(&device, 8)?;
        let baseline = windowed_attention(&phi_q, &phi_k, &v, 2, 2)?;

        // Perturb the last chunk of keys only.
        let mut rng = StdRng::seed_from_u64(17);
        let noise = uniform_tensor(&mut rng, 0.5, 1.5, (1, 2, 2, 4), &device)?;
        let phi_k_perturbed = Tensor::cat(&[&phi_k.narrow(2, 0, 6)?, &noise], 2)?;
        let perturbed = windowed_attention(&phi_q, &phi_k_perturbed, &v, 2, 2)?;

        let prefix_diff = baseline
            .narrow(2, 0, 6)?
            .sub(&perturbed.narrow(2, 0, 6)?)?
            .abs()?
            .flatten_all()?
            .to_vec1::<f32>()?
            .into_iter()
            .fold(0.0_f32, f32::max);
        assert_eq!(prefix_diff, 0.0, "future keys leaked into earlier chunks");
        Ok(())
    }

    #[test]
    fn window_limits_the_visible_prefix() -> Result<()> {
        let device = Device::Cpu;
        let (phi_q, phi_k, v) = feature_inputs(&device, 8)?;
        let baseline = windowed_attention(&phi_q, &phi_k, &v, 2, 1)?;

        // With a one-chunk window, the first chunk of keys cannot influence
        // the last chunk of queries.
        let mut rng = StdRng::seed_from_u64(17);
        let noise = uniform_tensor(&mut rng, 0.5, 1.5, (1, 2, 2, 4), &device)?;
        let phi_k_perturbed = Tensor::cat(&[&noise, &phi_k.narrow(2, 2, 6)?], 2)?;
        let perturbed = windowed_attention(&phi_q, &phi_k_perturbed, &v, 2, 1)?;

        let tail_diff = baseline
            .narrow(2, 6, 2)?
            .sub(&perturbed.narrow(2, 6, 2)?)?
            .abs()?
            .flatten_all()?
            .to_vec1::<f32>()?
            .into_iter()
            .fold(0.0_f32, f32::max);
        assert!(tail_diff < 1e-5, "keys outside the window leaked in: {tail_diff}");
        Ok(())
    }
}
