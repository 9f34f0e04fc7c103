//! Padding-mask builders for kernelized attention.
//!
//! Masks here are multiplicative tensors with dtype `f32`, shaped
//! `[batch, k_len]`. Entries are `1.0` where a key participates and `0.0`
//! where it is padding. Multiplicative masks keep the linear attention paths
//! finite even when every key is dropped, which additive `-inf` masks do not.

use candle_core::{DType, Device, Result, Tensor};

/// Dtype shared by all padding masks.
pub const MASK_DTYPE: DType = DType::F32;

/// Construct a keep mask from per-batch valid key lengths.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    k_len: usize,
) -> Result<Tensor> {
    let batch = key_lengths.len();
    let mut data = vec![0f32; batch * k_len];

    for (b, &valid) in key_lengths.iter().enumerate() {
        let valid = valid.min(k_len);
        for k in 0..valid {
            data[b * k_len + k] = 1.0;
        }
    }

    Tensor::from_vec(data, (batch, k_len), device)
}

/// Construct a keep mask from boolean padding indicators.
///
/// Each inner slice corresponds to a batch element and must share the same
/// length. `true` indicates a padded (dropped) key position.
pub fn padding_mask_from_booleans(device: &Device, padding: &[Vec<bool>]) -> Result<Tensor> {
    if padding.is_empty() {
        return Tensor::zeros((0, 0), MASK_DTYPE, device);
    }

    let k_len = padding[0].len();
    for mask in padding.iter() {
        assert_eq!(
            mask.len(),
            k_len,
            "all boolean padding masks must share k_len"
        );
    }

    let batch = padding.len();
    let mut data = vec![0f32; batch * k_len];

    for (b, mask) in padding.iter().enumerate() {
        for (k, &is_padding) in mask.iter().enumerate() {
            if !is_padding {
                data[b * k_len + k] = 1.0;
            }
        }
    }

    Tensor::from_vec(data, (batch, k_len), device)
}
