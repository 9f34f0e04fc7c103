//! Gaussian orthogonal random features.
//!
//! The projection matrix is `[num_features, key_dim]`. Rows are drawn as
//! standard normals in blocks of at most `key_dim`, each block is
//! orthonormalized with modified Gram-Schmidt, and every row is rescaled by
//! the Euclidean norm of an independent Gaussian row so row norms follow a
//! chi distribution. Orthogonal blocks lower the variance of the softmax
//! kernel estimate compared to unstructured Gaussian features.
//!
//! All sampling goes through a host-side seeded RNG that is materialized
//! into tensors with `Tensor::from_vec`, so layers built from equal configs
//! stay deterministic on every device. The projection owns its RNG; redraws
//! continue the same stream.

use std::sync::Mutex;

use candle_core::{Device, Error, Result, Tensor};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

/// Random projection with optional in-place redraw.
#[derive(Debug)]
pub struct RandomProjection {
    num_features: usize,
    key_dim: usize,
    state: Mutex<ProjectionState>,
}

#[derive(Debug)]
struct ProjectionState {
    rng: StdRng,
    matrix: Tensor,
}

impl RandomProjection {
    /// Build the initial projection, consuming `rng` so redraws continue the
    /// same stream.
    pub fn new(
        mut rng: StdRng,
        device: &Device,
        num_features: usize,
        key_dim: usize,
    ) -> Result<Self> {
        let matrix = sample_orthogonal_gaussian(&mut rng, device, num_features, key_dim)?;
        Ok(Self {
            num_features,
            key_dim,
            state: Mutex::new(ProjectionState { rng, matrix }),
        })
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Current projection matrix, shaped `[num_features, key_dim]`.
    pub fn matrix(&self) -> Result<Tensor> {
        let guard = self
            .state
            .lock()
            .map_err(|_| Error::Msg("projection mutex poisoned".to_string()))?;
        Ok(guard.matrix.clone())
    }

    /// Replace the projection with a fresh sample from the owned RNG.
    pub fn redraw(&self, device: &Device) -> Result<()> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| Error::Msg("projection mutex poisoned".to_string()))?;
        let ProjectionState { rng, matrix } = &mut *guard;
        *matrix = sample_orthogonal_gaussian(rng, device, self.num_features, self.key_dim)?;
        Ok(())
    }
}

/// Draw a `[rows, cols]` matrix of standard normals from `rng`.
pub fn sample_gaussian_matrix<R: Rng + ?Sized>(
    rng: &mut R,
    rows: usize,
    cols: usize,
    device: &Device,
) -> Result<Tensor> {
    Tensor::from_vec(gaussian_values(rng, rows * cols), (rows, cols), device)
}

/// Sample a `[rows, dim]` Gaussian matrix with orthogonal row blocks and
/// chi-distributed row norms.
pub fn sample_orthogonal_gaussian<R: Rng + ?Sized>(
    rng: &mut R,
    device: &Device,
    rows: usize,
    dim: usize,
) -> Result<Tensor> {
    let mut data: Vec<f32> = Vec::with_capacity(rows * dim);
    let mut produced = 0;
    while produced < rows {
        let take = (rows - produced).min(dim);
        let draw: Vec<Vec<f32>> = (0..dim).map(|_| gaussian_values(rng, dim)).collect();
        let block = orthonormal_rows(draw);
        for row in block.into_iter().take(take) {
            data.extend_from_slice(&row);
        }
        produced += take;
    }

    for row in 0..rows {
        let norm = gaussian_values(rng, dim)
            .iter()
            .map(|v| v * v)
            .sum::<f32>()
            .sqrt();
        for value in &mut data[row * dim..(row + 1) * dim] {
            *value *= norm;
        }
    }

    Tensor::from_vec(data, (rows, dim), device)
}

fn gaussian_values<R: Rng + ?Sized>(rng: &mut R, count: usize) -> Vec<f32> {
    (0..count)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect()
}

fn orthonormal_rows(mut rows: Vec<Vec<f32>>) -> Vec<Vec<f32>> {
    for i in 0..rows.len() {
        let (done, rest) = rows.split_at_mut(i);
        let current = &mut rest[0];
        for prev in done.iter() {
            let dot: f32 = current.iter().zip(prev.iter()).map(|(a, b)| a * b).sum();
            for (c, p) in current.iter_mut().zip(prev.iter()) {
                *c -= dot * p;
            }
        }
        let norm = current.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for value in current.iter_mut() {
                *value /= norm;
            }
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn row(matrix: &[Vec<f32>], i: usize) -> &[f32] {
        &matrix[i]
    }

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn blocks_have_orthogonal_rows() -> Result<()> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(7);
        let matrix = sample_orthogonal_gaussian(&mut rng, &device, 6, 8)?.to_vec2::<f32>()?;

        // All six rows live in the first block, so every pair is orthogonal.
        for i in 0..6 {
            for j in 0..i {
                let cos = dot(row(&matrix, i), row(&matrix, j))
                    / (dot(row(&matrix, i), row(&matrix, i)).sqrt()
                        * dot(row(&matrix, j), row(&matrix, j)).sqrt());
                assert!(cos.abs() < 1e-4, "rows {i} and {j} not orthogonal: {cos}");
            }
        }
        Ok(())
    }

    #[test]
    fn rows_exceeding_dim_wrap_into_new_blocks() -> Result<()> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(7);
        let matrix = sample_orthogonal_gaussian(&mut rng, &device, 11, 4)?;
        assert_eq!(matrix.dims(), &[11, 4]);
        Ok(())
    }

    #[test]
    fn equal_seeds_sample_identical_matrices() -> Result<()> {
        let device = Device::Cpu;
        let mut first = StdRng::seed_from_u64(7);
        let mut second = StdRng::seed_from_u64(7);
        let a = sample_orthogonal_gaussian(&mut first, &device, 5, 4)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let b = sample_orthogonal_gaussian(&mut second, &device, 5, 4)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn redraw_replaces_the_matrix() -> Result<()> {
        let device = Device::Cpu;
        let projection = RandomProjection::new(StdRng::seed_from_u64(7), &device, 4, 4)?;
        assert_eq!(projection.num_features(), 4);
        let before = projection.matrix()?.flatten_all()?.to_vec1::<f32>()?;
        projection.redraw(&device)?;
        let after = projection.matrix()?.flatten_all()?.to_vec1::<f32>()?;
        assert_ne!(before, after);
        Ok(())
    }
}
