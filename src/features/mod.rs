//! Feature maps for kernelized attention.
//!
//! A feature map lifts queries and keys, shaped `[batch, heads, seq, key_dim]`
//! and already scaled by `key_dim^-1/4`, into a nonnegative feature space
//! `[batch, heads, seq, m]`. With a random projection `m` is the number of
//! random features; without one the transform applies to the inputs directly
//! and `m == key_dim`.
//!
//! The `exp` transforms estimate the softmax kernel and subtract a running
//! maximum before exponentiating. Queries are stabilized per row, which
//! cancels in the attention normalization; keys are stabilized by a single
//! maximum over the whole sequence slab, since per-key scaling would bias the
//! kernel estimate.

pub mod projection;

pub use projection::RandomProjection;

use candle_core::{Result, Tensor, D};

use crate::core::FeatureTransform;

/// Stabilizer added to feature maps and attention denominators.
pub const NUMERIC_STABILIZER: f64 = 1e-6;

/// Apply `transform` to `data`, optionally through `projection`
/// (`[m, key_dim]`).
pub fn feature_map(
    transform: FeatureTransform,
    data: &Tensor,
    projection: Option<&Tensor>,
    is_query: bool,
) -> Result<Tensor> {
    let u = match projection {
        Some(matrix) => project(data, matrix)?,
        None => data.clone(),
    };
    match transform {
        FeatureTransform::Relu => u.relu()?.affine(1.0, NUMERIC_STABILIZER),
        FeatureTransform::Elu => u.elu(1.0)?.affine(1.0, 1.0),
        FeatureTransform::Exp => {
            let logits = subtract_half_norm(&u, data)?;
            let logits = if is_query {
                let row_max = logits.max_keepdim(D::Minus1)?;
                logits.broadcast_sub(&row_max)?
            } else {
                let slab_max = logits.max_keepdim(D::Minus1)?.max_keepdim(D::Minus2)?;
                logits.broadcast_sub(&slab_max)?
            };
            logits
                .exp()?
                .affine(feature_scale(projection, &u)?, NUMERIC_STABILIZER)
        }
        FeatureTransform::ExpPlus => {
            let logits = subtract_half_norm(&u, data)?;
            let slab_max = logits.max_keepdim(D::Minus1)?.max_keepdim(D::Minus2)?;
            let logits = logits.broadcast_sub(&slab_max)?;
            logits
                .exp()?
                .affine(feature_scale(projection, &u)?, NUMERIC_STABILIZER)
        }
    }
}

fn project(data: &Tensor, matrix: &Tensor) -> Result<Tensor> {
    let (batch, heads, seq, dim) = data.dims4()?;
    let (m, _) = matrix.dims2()?;
    let flat = data.reshape((batch * heads, seq, dim))?;
    let lifted = flat.broadcast_matmul(&matrix.t()?.contiguous()?)?;
    lifted.reshape((batch, heads, seq, m))
}

/// `u - |x|^2 / 2`, the log of the softmax-kernel feature map.
fn subtract_half_norm(u: &Tensor, data: &Tensor) -> Result<Tensor> {
    let half_norm = data.sqr()?.sum_keepdim(D::Minus1)?.affine(0.5, 0.0)?;
    u.broadcast_sub(&half_norm)
}

fn feature_scale(projection: Option<&Tensor>, u: &Tensor) -> Result<f64> {
    Ok(match projection {
        Some(_) => (u.dim(D::Minus1)? as f64).sqrt().recip(),
        None => 1.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn sample_data(rng: &mut StdRng, device: &Device) -> Result<Tensor> {
        let data: Vec<f32> = (0..2 * 3 * 5 * 4)
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();
        Tensor::from_vec(data, (2, 3, 5, 4), device)
    }

    #[test]
    fn maps_are_nonnegative_and_keep_leading_shape() -> Result<()> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(11);
        let data = sample_data(&mut rng, &device)?;
        let matrix = projection::sample_orthogonal_gaussian(&mut rng, &device, 7, 4)?;

        for transform in FeatureTransform::ALL {
            for (projection, m) in [(Some(&matrix), 7), (None, 4)] {
                let features = feature_map(transform, &data, projection, true)?;
                assert_eq!(features.dims(), &[2, 3, 5, m], "transform={transform}");
                let min = features
                    .flatten_all()?
                    .to_vec1::<f32>()?
                    .into_iter()
                    .fold(f32::INFINITY, f32::min);
                assert!(min >= 0.0, "transform={transform} produced {min}");
            }
        }
        Ok(())
    }

    #[test]
    fn exp_map_stays_finite_for_large_inputs() -> Result<()> {
        let device = Device::Cpu;
        let data = Tensor::full(50.0f32, (1, 1, 4, 4), &device)?;
        let mut rng = StdRng::seed_from_u64(11);
        let matrix = projection::sample_orthogonal_gaussian(&mut rng, &device, 8, 4)?;

        for is_query in [true, false] {
            let features = feature_map(FeatureTransform::Exp, &data, Some(&matrix), is_query)?;
            assert_eq!(features.dtype(), DType::F32);
            let values = features.flatten_all()?.to_vec1::<f32>()?;
            assert!(values.iter().all(|v| v.is_finite()));
        }
        Ok(())
    }
}
