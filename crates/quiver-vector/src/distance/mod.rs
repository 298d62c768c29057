//! Distance functions over float vectors.
//!
//! Kernels are resolved by name at construction time so the schema layer
//! can store plain strings; an unknown name fails fast with
//! [`VectorError::UnsupportedDistance`].
//!
//! Euclidean here means *squared* L2 throughout the crate. The product
//! quantizer's lookup tables sum per-subvector terms, and only squared
//! distances add up across subvectors.

pub mod bit;

use crate::error::{VectorError, VectorResult};

/// Name of the squared Euclidean kernel.
pub const DISTANCE_EUCLIDEAN: &str = "euclidean";
/// Name of the cosine kernel.
pub const DISTANCE_COSINE: &str = "cosine";
/// Name of the (negated) dot product kernel.
pub const DISTANCE_DOT: &str = "dot";

/// A distance function over two equal-length float slices.
///
/// Lower is closer for every kernel, including dot product.
pub type FloatDistFn = fn(&[f32], &[f32]) -> f32;

/// Squared Euclidean (L2) distance.
///
/// # Panics
///
/// Debug-panics if the slices have different lengths.
#[inline]
#[must_use]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vectors must have same dimension");
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Cosine distance, `1 - a . b`.
///
/// Assumes unit-normalized inputs; callers are expected to have
/// normalized vectors at ingest time.
#[inline]
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - dot_product(a, b)
}

/// Negated dot product.
///
/// Not a metric; the negation keeps the lower-is-closer convention so
/// search loops can treat it like any other kernel.
#[inline]
#[must_use]
pub fn dot_distance(a: &[f32], b: &[f32]) -> f32 {
    -dot_product(a, b)
}

#[inline]
fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vectors must have same dimension");
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Resolve a float kernel by name.
///
/// # Errors
///
/// Returns [`VectorError::UnsupportedDistance`] for an unknown name.
pub fn get_float_distance_fn(name: &str) -> VectorResult<FloatDistFn> {
    match name {
        DISTANCE_EUCLIDEAN => Ok(euclidean_distance),
        DISTANCE_COSINE => Ok(cosine_distance),
        DISTANCE_DOT => Ok(dot_distance),
        other => Err(VectorError::UnsupportedDistance(other.to_string())),
    }
}
