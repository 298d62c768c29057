//! Distance functions over bit-packed binary vectors.
//!
//! Operands are equal-length `u64` slices as produced by the binary
//! quantizer. XOR/AND/OR plus `count_ones` compile down to hardware
//! popcount on x86_64 (POPCNT) and aarch64 (CNT).

use crate::error::{VectorError, VectorResult};

/// Name of the Hamming kernel.
pub const DISTANCE_HAMMING: &str = "hamming";
/// Name of the Jaccard kernel.
pub const DISTANCE_JACCARD: &str = "jaccard";

/// A distance function over two equal-length bit-packed slices.
pub type BitDistFn = fn(&[u64], &[u64]) -> f32;

/// Hamming distance: the number of positions where the bits differ.
///
/// # Panics
///
/// Debug-panics if the slices have different lengths.
#[inline]
#[must_use]
pub fn hamming_distance(a: &[u64], b: &[u64]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "bit vectors must have same length");
    a.iter().zip(b.iter()).map(|(&x, &y)| (x ^ y).count_ones()).sum::<u32>() as f32
}

/// Jaccard distance: `1 - |A & B| / |A | B|`.
///
/// Two all-zero vectors are identical by convention (distance 0).
///
/// # Panics
///
/// Debug-panics if the slices have different lengths.
#[inline]
#[must_use]
pub fn jaccard_distance(a: &[u64], b: &[u64]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "bit vectors must have same length");

    let mut intersection: u32 = 0;
    let mut union: u32 = 0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        intersection += (x & y).count_ones();
        union += (x | y).count_ones();
    }

    if union == 0 {
        0.0
    } else {
        1.0 - intersection as f32 / union as f32
    }
}

/// Resolve a bit kernel by name.
///
/// # Errors
///
/// Returns [`VectorError::UnsupportedDistance`] for an unknown name.
pub fn get_bit_distance_fn(name: &str) -> VectorResult<BitDistFn> {
    match name {
        DISTANCE_HAMMING => Ok(hamming_distance),
        DISTANCE_JACCARD => Ok(jaccard_distance),
        other => Err(VectorError::UnsupportedDistance(other.to_string())),
    }
}
