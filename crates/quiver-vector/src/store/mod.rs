//! Quantized vector stores.
//!
//! Three stores share one contract: the ANN index holds a [`VectorStore`],
//! inserts float vectors by id, asks for distance closures, and never
//! learns which representation sits underneath.
//!
//! - [`ProductQuantizer`] - subvector codebooks, byte codes
//! - [`BinaryQuantizer`] - per-dimension threshold, packed bit codes
//! - [`PlainStore`] - passthrough, full-precision vectors
//!
//! Points are a closed sum ([`VectorStorePoint`]) rather than an open
//! trait: the set of representations is known at compile time, and the
//! distance closures need to downcast in a hot loop. A point of the wrong
//! variant is treated as maximally distant and logged, never a panic, so
//! the search loop stays oblivious to the store kind.

mod binary;
mod plain;
mod product;

pub use binary::{BinaryQuantizer, BqPoint};
pub use plain::{PlainStore, RawPoint};
pub use product::{PqPoint, ProductQuantizer};

use std::sync::Arc;

use quiver_storage::Storage;

use crate::cache::SharedPoint;
use crate::config::QuantizerKind;
use crate::distance::get_float_distance_fn;
use crate::error::VectorResult;

/// A point handed out by a vector store.
///
/// The variant tags which store produced it; distance closures check the
/// tag before touching the payload.
#[derive(Debug, Clone)]
pub enum VectorStorePoint {
    /// A product-quantized point.
    Product(SharedPoint<PqPoint>),
    /// A binary-quantized point.
    Binary(SharedPoint<BqPoint>),
    /// A full-precision point.
    Plain(SharedPoint<RawPoint>),
}

impl VectorStorePoint {
    /// The point's id. Returns 0 if the point's lock was poisoned; the id
    /// is only used for logging on that path.
    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            Self::Product(p) => p.read().map_or(0, |p| p.id()),
            Self::Binary(p) => p.read().map_or(0, |p| p.id()),
            Self::Plain(p) => p.read().map_or(0, |p| p.id()),
        }
    }
}

/// A distance function over candidate points, closed over whatever the
/// store precomputed for one query.
///
/// Construction amortizes the per-query work (lookup tables, query
/// encoding); each call is then cheap. The closure owns snapshots of the
/// tables it needs, so it remains valid even if the store is dropped.
pub type PointDistFn = Box<dyn Fn(&VectorStorePoint) -> f32 + Send + Sync>;

/// A vector store dispatching to the configured quantizer.
pub enum VectorStore {
    /// Product quantization.
    Product(ProductQuantizer),
    /// Binary quantization.
    Binary(BinaryQuantizer),
    /// No compression.
    Plain(PlainStore),
}

impl VectorStore {
    /// Construct the store a collection's configuration asks for.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidGeometry`](crate::VectorError::InvalidGeometry)
    /// or [`UnsupportedDistance`](crate::VectorError::UnsupportedDistance)
    /// for an invalid configuration; these are fatal to opening the
    /// collection.
    pub fn new(
        storage: Arc<dyn Storage>,
        distance_name: &str,
        kind: &QuantizerKind,
        vector_len: usize,
    ) -> VectorResult<Self> {
        match kind {
            QuantizerKind::None => {
                Ok(Self::Plain(PlainStore::new(storage, distance_name, vector_len)?))
            }
            QuantizerKind::Product(params) => Ok(Self::Product(ProductQuantizer::new(
                storage,
                distance_name,
                params.clone(),
                vector_len,
            )?)),
            QuantizerKind::Binary(params) => {
                let float_dist_fn = get_float_distance_fn(distance_name)?;
                Ok(Self::Binary(BinaryQuantizer::new(
                    storage,
                    float_dist_fn,
                    params.clone(),
                    vector_len,
                )?))
            }
        }
    }

    /// Whether a point with `id` is known to memory or storage.
    #[must_use]
    pub fn exists(&self, id: u64) -> bool {
        match self {
            Self::Product(s) => s.exists(id),
            Self::Binary(s) => s.exists(id),
            Self::Plain(s) => s.exists(id),
        }
    }

    /// Get a single point.
    pub fn get(&self, id: u64) -> VectorResult<VectorStorePoint> {
        match self {
            Self::Product(s) => s.get(id),
            Self::Binary(s) => s.get(id),
            Self::Plain(s) => s.get(id),
        }
    }

    /// Get a batch of points; fails on the first missing id.
    pub fn get_many(&self, ids: &[u64]) -> VectorResult<Vec<VectorStorePoint>> {
        match self {
            Self::Product(s) => s.get_many(ids),
            Self::Binary(s) => s.get_many(ids),
            Self::Plain(s) => s.get_many(ids),
        }
    }

    /// Visit every stored point exactly once.
    pub fn for_each(
        &self,
        f: impl FnMut(&VectorStorePoint) -> VectorResult<()>,
    ) -> VectorResult<()> {
        match self {
            Self::Product(s) => s.for_each(f),
            Self::Binary(s) => s.for_each(f),
            Self::Plain(s) => s.for_each(f),
        }
    }

    /// Insert or replace the vector for `id`.
    pub fn set(&self, id: u64, vector: Vec<f32>) -> VectorResult<VectorStorePoint> {
        match self {
            Self::Product(s) => s.set(id, vector),
            Self::Binary(s) => s.set(id, vector),
            Self::Plain(s) => s.set(id, vector),
        }
    }

    /// Delete the given ids from memory and storage.
    pub fn delete(&self, ids: &[u64]) -> VectorResult<()> {
        match self {
            Self::Product(s) => s.delete(ids),
            Self::Binary(s) => s.delete(ids),
            Self::Plain(s) => s.delete(ids),
        }
    }

    /// Train the quantizer once enough points have accumulated. A no-op
    /// when already trained, below the trigger, or for the plain store.
    pub fn fit(&self) -> VectorResult<()> {
        match self {
            Self::Product(s) => s.fit(),
            Self::Binary(s) => s.fit(),
            Self::Plain(_) => Ok(()),
        }
    }

    /// Distance closure from a raw query vector to stored points.
    pub fn distance_from_float(&self, query: &[f32]) -> VectorResult<PointDistFn> {
        match self {
            Self::Product(s) => s.distance_from_float(query),
            Self::Binary(s) => s.distance_from_float(query),
            Self::Plain(s) => s.distance_from_float(query),
        }
    }

    /// Distance closure from a stored point to other stored points.
    pub fn distance_from_point(&self, point: &VectorStorePoint) -> VectorResult<PointDistFn> {
        match self {
            Self::Product(s) => s.distance_from_point(point),
            Self::Binary(s) => s.distance_from_point(point),
            Self::Plain(s) => s.distance_from_point(point),
        }
    }

    /// Persist dirty points and quantizer state.
    pub fn flush(&self) -> VectorResult<()> {
        match self {
            Self::Product(s) => s.flush(),
            Self::Binary(s) => s.flush(),
            Self::Plain(s) => s.flush(),
        }
    }

    /// Resident memory footprint in bytes.
    pub fn size_in_memory(&self) -> VectorResult<usize> {
        match self {
            Self::Product(s) => s.size_in_memory(),
            Self::Binary(s) => s.size_in_memory(),
            Self::Plain(s) => s.size_in_memory(),
        }
    }

    /// Swap the backing storage handle.
    pub fn update_storage(&self, storage: Arc<dyn Storage>) -> VectorResult<()> {
        match self {
            Self::Product(s) => s.update_storage(storage),
            Self::Binary(s) => s.update_storage(storage),
            Self::Plain(s) => s.update_storage(storage),
        }
    }
}
