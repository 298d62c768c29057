//! Passthrough vector store.
//!
//! No compression: points keep their full-precision vectors and every
//! distance is the configured float kernel. This is the store a
//! collection gets when quantization is disabled, and it completes the
//! closed point sum the search layer dispatches over.

use std::sync::{Arc, RwLock};

use tracing::warn;

use quiver_storage::Storage;

use super::{PointDistFn, VectorStorePoint};
use crate::cache::{CachePoint, ItemCache};
use crate::conversion::{self, VECTOR_TAG};
use crate::distance::{get_float_distance_fn, FloatDistFn};
use crate::error::{VectorError, VectorResult};

/// A full-precision point.
#[derive(Debug)]
pub struct RawPoint {
    id: u64,
    pub(crate) vector: Vec<f32>,
    dirty: bool,
}

impl RawPoint {
    pub(crate) fn new(id: u64, vector: Vec<f32>) -> Self {
        Self { id, vector, dirty: false }
    }

    /// The point's id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The stored vector.
    #[must_use]
    pub fn vector(&self) -> &[f32] {
        &self.vector
    }
}

impl CachePoint for RawPoint {
    fn id(&self) -> u64 {
        self.id
    }

    fn size_in_memory(&self) -> usize {
        8 + 4 * self.vector.len()
    }

    fn check_and_clear_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn read_from(id: u64, storage: &dyn Storage) -> VectorResult<Self> {
        let bytes = storage
            .get(&conversion::node_key(id, VECTOR_TAG))?
            .ok_or(VectorError::PointNotFound(id))?;
        Ok(Self::new(id, conversion::bytes_to_floats(&bytes)))
    }

    fn write_to(&self, storage: &dyn Storage) -> VectorResult<()> {
        storage.put(
            &conversion::node_key(self.id, VECTOR_TAG),
            &conversion::floats_to_bytes(&self.vector),
        )?;
        Ok(())
    }

    fn delete_from(id: u64, storage: &dyn Storage) -> VectorResult<()> {
        storage.delete(&conversion::node_key(id, VECTOR_TAG))?;
        Ok(())
    }

    fn storage_id_from_key(key: &[u8]) -> Option<u64> {
        conversion::node_id_from_key(key, VECTOR_TAG)
    }
}

/// Uncompressed vector store over a key-value backend.
pub struct PlainStore {
    items: ItemCache<RawPoint>,
    dist_fn: FloatDistFn,
}

impl PlainStore {
    /// Open a plain store over `storage`.
    ///
    /// # Errors
    ///
    /// - [`VectorError::UnsupportedDistance`] for an unknown kernel name
    /// - [`VectorError::InvalidGeometry`] for a zero vector length
    pub fn new(
        storage: Arc<dyn Storage>,
        distance_name: &str,
        vector_len: usize,
    ) -> VectorResult<Self> {
        let dist_fn = get_float_distance_fn(distance_name)?;
        if vector_len == 0 {
            return Err(VectorError::InvalidGeometry("vector length must be non-zero".into()));
        }
        Ok(Self { items: ItemCache::new(storage), dist_fn })
    }

    /// Whether a point with `id` is known to memory or storage.
    #[must_use]
    pub fn exists(&self, id: u64) -> bool {
        self.items.get(id).is_ok()
    }

    /// Get a single point.
    pub fn get(&self, id: u64) -> VectorResult<VectorStorePoint> {
        Ok(VectorStorePoint::Plain(self.items.get(id)?))
    }

    /// Get a batch of points; fails on the first missing id.
    pub fn get_many(&self, ids: &[u64]) -> VectorResult<Vec<VectorStorePoint>> {
        Ok(self.items.get_many(ids)?.into_iter().map(VectorStorePoint::Plain).collect())
    }

    /// Visit every stored point exactly once.
    pub fn for_each(
        &self,
        mut f: impl FnMut(&VectorStorePoint) -> VectorResult<()>,
    ) -> VectorResult<()> {
        self.items.for_each(|point| f(&VectorStorePoint::Plain(Arc::clone(point))))
    }

    /// Insert or replace the vector for `id`.
    pub fn set(&self, id: u64, vector: Vec<f32>) -> VectorResult<VectorStorePoint> {
        let shared = self.items.put(RawPoint::new(id, vector))?;
        Ok(VectorStorePoint::Plain(shared))
    }

    /// Delete the given ids from memory and storage.
    pub fn delete(&self, ids: &[u64]) -> VectorResult<()> {
        self.items.delete(ids)
    }

    /// Distance closure from a raw query vector to stored points.
    pub fn distance_from_float(&self, query: &[f32]) -> VectorResult<PointDistFn> {
        let dist_fn = self.dist_fn;
        let query = query.to_vec();
        Ok(Box::new(move |y| match y {
            VectorStorePoint::Plain(shared) => match shared.read() {
                Ok(point) => dist_fn(&query, &point.vector),
                Err(_) => f32::MAX,
            },
            other => {
                warn!(id = other.id(), "point of unexpected type for distance calculation");
                f32::MAX
            }
        }))
    }

    /// Distance closure from a stored point to other stored points.
    pub fn distance_from_point(&self, x: &VectorStorePoint) -> VectorResult<PointDistFn> {
        let dist_fn = self.dist_fn;
        let x_id = x.id();
        let x_vector = match x {
            VectorStorePoint::Plain(shared) => shared.read().ok().map(|point| point.vector.clone()),
            _ => None,
        };
        Ok(Box::new(move |y| {
            let Some(x_vector) = &x_vector else {
                warn!(id_x = x_id, id_y = y.id(), "point unusable for distance calculation");
                return f32::MAX;
            };
            match y {
                VectorStorePoint::Plain(shared) => match shared.read() {
                    Ok(point) => dist_fn(x_vector, &point.vector),
                    Err(_) => f32::MAX,
                },
                other => {
                    warn!(
                        id_x = x_id,
                        id_y = other.id(),
                        "point of unexpected type for distance calculation"
                    );
                    f32::MAX
                }
            }
        }))
    }

    /// Flush dirty points.
    pub fn flush(&self) -> VectorResult<()> {
        self.items.flush()
    }

    /// Resident size of the cache.
    pub fn size_in_memory(&self) -> VectorResult<usize> {
        self.items.size_in_memory()
    }

    /// Swap the backing storage handle.
    pub fn update_storage(&self, storage: Arc<dyn Storage>) -> VectorResult<()> {
        self.items.update_storage(storage)
    }
}
