//! Binary quantization store.
//!
//! Each dimension gets a real threshold; a vector becomes one bit per
//! dimension, set when the value exceeds its threshold, packed
//! little-endian into `u64` words. The threshold is either a fixed scalar
//! from the configuration or the per-dimension mean learned at fit time.
//! Distances over the packed bits use a bitwise kernel chosen by name.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::{debug, warn};

use quiver_storage::Storage;

use super::{PointDistFn, VectorStorePoint};
use crate::cache::{CachePoint, ItemCache};
use crate::config::BinaryQuantizerParams;
use crate::conversion::{self, CODE_TAG, VECTOR_TAG};
use crate::distance::bit::{get_bit_distance_fn, BitDistFn};
use crate::distance::FloatDistFn;
use crate::error::{VectorError, VectorResult};

const THRESHOLD_KEY: &[u8] = b"_binaryQuantizerThreshold";

/// A point stored by the binary quantizer.
#[derive(Debug)]
pub struct BqPoint {
    id: u64,
    pub(crate) vector: Vec<f32>,
    pub(crate) binary_vector: Vec<u64>,
    dirty: bool,
}

impl BqPoint {
    fn new(id: u64, vector: Vec<f32>, binary_vector: Vec<u64>) -> Self {
        Self { id, vector, binary_vector, dirty: false }
    }

    /// The point's id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The raw vector; empty once the point has been reloaded from its
    /// binary form.
    #[must_use]
    pub fn vector(&self) -> &[f32] {
        &self.vector
    }

    /// The packed bits; empty before a threshold exists.
    #[must_use]
    pub fn binary_vector(&self) -> &[u64] {
        &self.binary_vector
    }
}

impl CachePoint for BqPoint {
    fn id(&self) -> u64 {
        self.id
    }

    fn size_in_memory(&self) -> usize {
        4 * self.vector.len() + 8 * self.binary_vector.len()
    }

    fn check_and_clear_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn read_from(id: u64, storage: &dyn Storage) -> VectorResult<Self> {
        // The binary form answers every query once it exists; skip the
        // raw vector to save memory.
        if let Some(bits) = storage.get(&conversion::node_key(id, CODE_TAG))? {
            return Ok(Self::new(id, Vec::new(), conversion::bytes_to_words(&bits)));
        }
        let vector_bytes = storage
            .get(&conversion::node_key(id, VECTOR_TAG))?
            .ok_or(VectorError::PointNotFound(id))?;
        Ok(Self::new(id, conversion::bytes_to_floats(&vector_bytes), Vec::new()))
    }

    fn write_to(&self, storage: &dyn Storage) -> VectorResult<()> {
        if !self.binary_vector.is_empty() {
            storage.put(
                &conversion::node_key(self.id, CODE_TAG),
                &conversion::words_to_bytes(&self.binary_vector),
            )?;
            // The raw vector is deliberately not rewritten once the
            // binary form exists.
            return Ok(());
        }
        if !self.vector.is_empty() {
            storage.put(
                &conversion::node_key(self.id, VECTOR_TAG),
                &conversion::floats_to_bytes(&self.vector),
            )?;
        }
        Ok(())
    }

    fn delete_from(id: u64, storage: &dyn Storage) -> VectorResult<()> {
        storage.delete(&conversion::node_key(id, VECTOR_TAG))?;
        storage.delete(&conversion::node_key(id, CODE_TAG))?;
        Ok(())
    }

    fn storage_id_from_key(key: &[u8]) -> Option<u64> {
        conversion::node_id_from_key(key, VECTOR_TAG)
            .or_else(|| conversion::node_id_from_key(key, CODE_TAG))
    }
}

/// Binary quantization store over a key-value backend.
pub struct BinaryQuantizer {
    params: BinaryQuantizerParams,
    vector_len: usize,
    items: ItemCache<BqPoint>,
    threshold: RwLock<Option<Arc<Vec<f32>>>>,
    storage: RwLock<Arc<dyn Storage>>,
    float_dist_fn: FloatDistFn,
    bit_dist_fn: BitDistFn,
}

impl BinaryQuantizer {
    /// Open a binary quantizer over `storage`.
    ///
    /// A scalar threshold in the parameters is broadcast over every
    /// dimension and makes the quantizer live immediately; otherwise a
    /// previously learned threshold is loaded from storage if present.
    ///
    /// # Errors
    ///
    /// - [`VectorError::UnsupportedDistance`] for an unknown bit kernel
    /// - [`VectorError::InvalidGeometry`] for a zero vector length
    pub fn new(
        storage: Arc<dyn Storage>,
        float_dist_fn: FloatDistFn,
        params: BinaryQuantizerParams,
        vector_len: usize,
    ) -> VectorResult<Self> {
        let bit_dist_fn = get_bit_distance_fn(&params.distance_metric)?;
        if vector_len == 0 {
            return Err(VectorError::InvalidGeometry("vector length must be non-zero".into()));
        }

        let threshold = if let Some(value) = params.threshold {
            Some(Arc::new(vec![value; vector_len]))
        } else {
            storage
                .get(THRESHOLD_KEY)?
                .map(|bytes| Arc::new(conversion::bytes_to_floats(&bytes)))
        };

        Ok(Self {
            params,
            vector_len,
            items: ItemCache::new(Arc::clone(&storage)),
            threshold: RwLock::new(threshold),
            storage: RwLock::new(storage),
            float_dist_fn,
            bit_dist_fn,
        })
    }

    fn threshold_snapshot(&self) -> VectorResult<Option<Arc<Vec<f32>>>> {
        Ok(self.threshold.read().map_err(|_| VectorError::LockPoisoned)?.clone())
    }

    /// Pack `vector` against `threshold`: bit `i % 64` of word `i / 64`
    /// is set when `vector[i] > threshold[i]`.
    fn encode_with(threshold: &[f32], vector: &[f32]) -> Vec<u64> {
        let words = vector.len().div_ceil(64);
        let mut encoded = vec![0u64; words];
        for (i, (&value, &cutoff)) in vector.iter().zip(threshold.iter()).enumerate() {
            if value > cutoff {
                encoded[i / 64] |= 1 << (i % 64);
            }
        }
        encoded
    }

    /// Whether a point with `id` is known to memory or storage.
    #[must_use]
    pub fn exists(&self, id: u64) -> bool {
        self.items.get(id).is_ok()
    }

    /// Get a single point.
    pub fn get(&self, id: u64) -> VectorResult<VectorStorePoint> {
        Ok(VectorStorePoint::Binary(self.items.get(id)?))
    }

    /// Get a batch of points; fails on the first missing id.
    pub fn get_many(&self, ids: &[u64]) -> VectorResult<Vec<VectorStorePoint>> {
        Ok(self.items.get_many(ids)?.into_iter().map(VectorStorePoint::Binary).collect())
    }

    /// Visit every stored point exactly once.
    pub fn for_each(
        &self,
        mut f: impl FnMut(&VectorStorePoint) -> VectorResult<()>,
    ) -> VectorResult<()> {
        self.items.for_each(|point| f(&VectorStorePoint::Binary(Arc::clone(point))))
    }

    /// Insert or replace the vector for `id`, packing it immediately when
    /// a threshold exists.
    pub fn set(&self, id: u64, vector: Vec<f32>) -> VectorResult<VectorStorePoint> {
        let binary_vector = match self.threshold_snapshot()? {
            Some(threshold) => Self::encode_with(&threshold, &vector),
            None => Vec::new(),
        };
        let shared = self.items.put(BqPoint::new(id, vector, binary_vector))?;
        Ok(VectorStorePoint::Binary(shared))
    }

    /// Delete the given ids from memory and storage.
    pub fn delete(&self, ids: &[u64]) -> VectorResult<()> {
        self.items.delete(ids)
    }

    /// Learn the per-dimension mean threshold and pack every stored
    /// point.
    ///
    /// A no-op when a threshold already exists or the cache holds fewer
    /// than `trigger_threshold` points. Two passes: the first accumulates
    /// the mean, the second re-encodes and marks each point dirty for the
    /// next flush.
    pub fn fit(&self) -> VectorResult<()> {
        // Short-circuit before counting; counting scans storage.
        if self.threshold_snapshot()?.is_some() {
            return Ok(());
        }
        if self.items.count()? < self.params.trigger_threshold {
            return Ok(());
        }
        let start = Instant::now();

        let mut count = 0usize;
        let mut sum = vec![0.0f32; self.vector_len];
        self.items.for_each(|shared| {
            let point = shared.read().map_err(|_| VectorError::LockPoisoned)?;
            for (s, &v) in sum.iter_mut().zip(point.vector.iter()) {
                *s += v;
            }
            count += 1;
            Ok(())
        })?;
        if count == 0 {
            return Ok(());
        }
        for s in sum.iter_mut() {
            *s /= count as f32;
        }
        let threshold = Arc::new(sum);

        self.items.for_each(|shared| {
            let mut point = shared.write().map_err(|_| VectorError::LockPoisoned)?;
            point.binary_vector = Self::encode_with(&threshold, &point.vector);
            point.mark_dirty();
            Ok(())
        })?;

        *self.threshold.write().map_err(|_| VectorError::LockPoisoned)? =
            Some(Arc::clone(&threshold));

        debug!(
            num_points = count,
            threshold_len = threshold.len(),
            elapsed = ?start.elapsed(),
            "fitted binary quantizer"
        );
        Ok(())
    }

    /// Distance closure from a raw query vector to stored points.
    ///
    /// With a threshold the query is packed once and candidates cost one
    /// bit-kernel call; without one this falls back to the float kernel
    /// over raw vectors.
    pub fn distance_from_float(&self, query: &[f32]) -> VectorResult<PointDistFn> {
        if let Some(threshold) = self.threshold_snapshot()? {
            let encoded = Self::encode_with(&threshold, query);
            let bit_dist_fn = self.bit_dist_fn;
            return Ok(Box::new(move |y| match y {
                VectorStorePoint::Binary(shared) => match shared.read() {
                    Ok(point) if point.binary_vector.len() == encoded.len() => {
                        bit_dist_fn(&encoded, &point.binary_vector)
                    }
                    Ok(point) => {
                        warn!(id = point.id, "point has no binary code for distance calculation");
                        f32::MAX
                    }
                    Err(_) => f32::MAX,
                },
                other => {
                    warn!(id = other.id(), "point of unexpected type for distance calculation");
                    f32::MAX
                }
            }));
        }

        let float_dist_fn = self.float_dist_fn;
        let query = query.to_vec();
        Ok(Box::new(move |y| match y {
            VectorStorePoint::Binary(shared) => match shared.read() {
                Ok(point) if !point.vector.is_empty() => float_dist_fn(&query, &point.vector),
                Ok(point) => {
                    warn!(id = point.id, "missing raw vector for distance calculation");
                    f32::MAX
                }
                Err(_) => f32::MAX,
            },
            other => {
                warn!(id = other.id(), "point of unexpected type for distance calculation");
                f32::MAX
            }
        }))
    }

    /// Distance closure from a stored point to other stored points. The
    /// source point's state is snapshotted at construction time.
    pub fn distance_from_point(&self, x: &VectorStorePoint) -> VectorResult<PointDistFn> {
        let x_id = x.id();
        let x_point = match x {
            VectorStorePoint::Binary(shared) => shared.read().ok(),
            _ => None,
        };

        if self.threshold_snapshot()?.is_some() {
            let words = self.vector_len.div_ceil(64);
            let bit_dist_fn = self.bit_dist_fn;
            let x_bits = x_point.and_then(|point| {
                if point.binary_vector.len() == words {
                    Some(point.binary_vector.clone())
                } else {
                    None
                }
            });
            return Ok(Box::new(move |y| {
                let Some(x_bits) = &x_bits else {
                    warn!(id_x = x_id, id_y = y.id(), "point unusable for distance calculation");
                    return f32::MAX;
                };
                match y {
                    VectorStorePoint::Binary(shared) => match shared.read() {
                        Ok(point) if point.binary_vector.len() == x_bits.len() => {
                            bit_dist_fn(x_bits, &point.binary_vector)
                        }
                        Ok(point) => {
                            warn!(
                                id = point.id,
                                "point has no binary code for distance calculation"
                            );
                            f32::MAX
                        }
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
            }));
        }

        let float_dist_fn = self.float_dist_fn;
        let x_vector = x_point.and_then(|point| {
            if point.vector.is_empty() {
                None
            } else {
                Some(point.vector.clone())
            }
        });
        Ok(Box::new(move |y| {
            let Some(x_vector) = &x_vector else {
                warn!(id_x = x_id, id_y = y.id(), "point unusable for distance calculation");
                return f32::MAX;
            };
            match y {
                VectorStorePoint::Binary(shared) => match shared.read() {
                    Ok(point) if !point.vector.is_empty() => float_dist_fn(x_vector, &point.vector),
                    Ok(point) => {
                        warn!(id = point.id, "missing raw vector for distance calculation");
                        f32::MAX
                    }
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

    /// Flush dirty points, then persist the threshold if one exists.
    pub fn flush(&self) -> VectorResult<()> {
        self.items.flush()?;
        if let Some(threshold) = self.threshold_snapshot()? {
            let storage = Arc::clone(&*self.storage.read().map_err(|_| VectorError::LockPoisoned)?);
            storage.put(THRESHOLD_KEY, &conversion::floats_to_bytes(&threshold))?;
        }
        Ok(())
    }

    /// Resident size of the cache.
    pub fn size_in_memory(&self) -> VectorResult<usize> {
        self.items.size_in_memory()
    }

    /// Swap the backing storage handle.
    pub fn update_storage(&self, storage: Arc<dyn Storage>) -> VectorResult<()> {
        self.items.update_storage(Arc::clone(&storage))?;
        *self.storage.write().map_err(|_| VectorError::LockPoisoned)? = storage;
        Ok(())
    }
}
