//! Product quantization store.
//!
//! Vectors are split into `M` equal subvectors; a codebook of `K`
//! centroids is trained per subvector once enough points accumulate, and
//! every point is then stored as `M` byte-sized centroid ids. Queries run
//! against precomputed lookup tables: an `M x K` table of
//! query-to-centroid distances for asymmetric search, and an `M x K x K`
//! centroid-to-centroid table for symmetric search.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::{debug, warn};

use quiver_storage::Storage;

use super::{PointDistFn, VectorStorePoint};
use crate::cache::{CachePoint, ItemCache};
use crate::config::ProductQuantizerParams;
use crate::conversion::{self, CODE_TAG, VECTOR_TAG};
use crate::distance::{
    get_float_distance_fn, FloatDistFn, DISTANCE_COSINE, DISTANCE_DOT, DISTANCE_EUCLIDEAN,
};
use crate::error::{VectorError, VectorResult};
use crate::kmeans::{KMeans, MAX_ITERATIONS};

const FLAT_CENTROIDS_KEY: &[u8] = b"_productQuantizerFlatCentroids";
const CENTROID_DISTS_KEY: &[u8] = b"_productQuantizerCentroidDists";

/// A point stored by the product quantizer.
///
/// Before the quantizer is fitted a point carries only its raw vector;
/// afterwards it also carries its code, and a point reloaded from storage
/// carries the code alone. The code is all any distance query needs.
#[derive(Debug)]
pub struct PqPoint {
    id: u64,
    pub(crate) vector: Vec<f32>,
    pub(crate) centroid_ids: Vec<u8>,
    dirty: bool,
}

impl PqPoint {
    fn new(id: u64, vector: Vec<f32>, centroid_ids: Vec<u8>) -> Self {
        Self { id, vector, centroid_ids, dirty: false }
    }

    /// The point's id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The raw vector; empty when the point was reloaded from its
    /// quantized form.
    #[must_use]
    pub fn vector(&self) -> &[f32] {
        &self.vector
    }

    /// The quantized code; empty before the quantizer is fitted.
    #[must_use]
    pub fn centroid_ids(&self) -> &[u8] {
        &self.centroid_ids
    }
}

impl CachePoint for PqPoint {
    fn id(&self) -> u64 {
        self.id
    }

    fn size_in_memory(&self) -> usize {
        8 + 4 * self.vector.len() + self.centroid_ids.len()
    }

    fn check_and_clear_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn read_from(id: u64, storage: &dyn Storage) -> VectorResult<Self> {
        // The code alone answers every fitted query, so skip the raw
        // vector when a code exists. This is where the memory saving
        // comes from.
        if let Some(code_bytes) = storage.get(&conversion::node_key(id, CODE_TAG))? {
            return Ok(Self::new(id, Vec::new(), code_bytes));
        }
        let vector_bytes = storage
            .get(&conversion::node_key(id, VECTOR_TAG))?
            .ok_or(VectorError::PointNotFound(id))?;
        Ok(Self::new(id, conversion::bytes_to_floats(&vector_bytes), Vec::new()))
    }

    fn write_to(&self, storage: &dyn Storage) -> VectorResult<()> {
        if !self.vector.is_empty() {
            storage.put(
                &conversion::node_key(self.id, VECTOR_TAG),
                &conversion::floats_to_bytes(&self.vector),
            )?;
        }
        if !self.centroid_ids.is_empty() {
            storage.put(&conversion::node_key(self.id, CODE_TAG), &self.centroid_ids)?;
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

/// The trained codebook and derived tables, created once by `fit` and
/// immutable afterwards.
struct PqTables {
    num_subvectors: usize,
    num_centroids: usize,
    subvector_len: usize,
    /// Shape `(subvector, centroid, offset)`, row-major.
    flat_centroids: Vec<f32>,
    /// Shape `(subvector, centroid, centroid)`, row-major; symmetric in
    /// the last two axes.
    centroid_dists: Vec<f32>,
}

impl PqTables {
    fn centroid(&self, subvector: usize, centroid: usize) -> &[f32] {
        let start = (subvector * self.num_centroids + centroid) * self.subvector_len;
        &self.flat_centroids[start..start + self.subvector_len]
    }

    fn centroid_dist(&self, subvector: usize, a: usize, b: usize) -> f32 {
        self.centroid_dists[(subvector * self.num_centroids + a) * self.num_centroids + b]
    }

    /// Nearest-centroid code for a vector. Assignment is squared
    /// Euclidean regardless of the query kernel; ties go to the lowest
    /// centroid index.
    fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let mut codes = Vec::with_capacity(self.num_subvectors);
        for i in 0..self.num_subvectors {
            let window = &vector[i * self.subvector_len..(i + 1) * self.subvector_len];
            let mut best = 0usize;
            let mut best_dist = f32::MAX;
            for j in 0..self.num_centroids {
                let centroid = self.centroid(i, j);
                let dist: f32 =
                    window.iter().zip(centroid.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
                if dist < best_dist {
                    best_dist = dist;
                    best = j;
                }
            }
            codes.push(best as u8);
        }
        codes
    }
}

/// Product quantization store over a key-value backend.
pub struct ProductQuantizer {
    params: ProductQuantizerParams,
    dist_fn: FloatDistFn,
    vector_len: usize,
    subvector_len: usize,
    items: ItemCache<PqPoint>,
    tables: RwLock<Option<Arc<PqTables>>>,
    storage: RwLock<Arc<dyn Storage>>,
}

impl ProductQuantizer {
    /// Open a product quantizer over `storage`, loading previously
    /// trained tables if present.
    ///
    /// Cosine is served by the Euclidean kernel: for unit-normalized
    /// vectors the two orderings agree, and callers are expected to have
    /// normalized at ingest.
    ///
    /// # Errors
    ///
    /// - [`VectorError::InvalidGeometry`] if the dimension is zero or not
    ///   divisible by `num_subvectors`, or `num_centroids` is outside
    ///   `[1, 256]`
    /// - [`VectorError::UnsupportedDistance`] for a kernel other than
    ///   euclidean, cosine, or dot
    pub fn new(
        storage: Arc<dyn Storage>,
        distance_name: &str,
        params: ProductQuantizerParams,
        vector_len: usize,
    ) -> VectorResult<Self> {
        if vector_len == 0 {
            return Err(VectorError::InvalidGeometry("vector length must be non-zero".into()));
        }
        if params.num_subvectors == 0 || vector_len % params.num_subvectors != 0 {
            return Err(VectorError::InvalidGeometry(format!(
                "vector length {vector_len} must be divisible by num subvectors {}",
                params.num_subvectors
            )));
        }
        let distance_name = match distance_name {
            DISTANCE_COSINE => DISTANCE_EUCLIDEAN,
            DISTANCE_EUCLIDEAN | DISTANCE_DOT => distance_name,
            other => return Err(VectorError::UnsupportedDistance(other.to_string())),
        };
        // Codes are single bytes
        if params.num_centroids == 0 || params.num_centroids > 256 {
            return Err(VectorError::InvalidGeometry(format!(
                "number of centroids {} must be in [1, 256]",
                params.num_centroids
            )));
        }
        let dist_fn = get_float_distance_fn(distance_name)?;

        let subvector_len = vector_len / params.num_subvectors;
        let tables = Self::load_tables(storage.as_ref(), &params, subvector_len)?;

        Ok(Self {
            params,
            dist_fn,
            vector_len,
            subvector_len,
            items: ItemCache::new(Arc::clone(&storage)),
            tables: RwLock::new(tables),
            storage: RwLock::new(storage),
        })
    }

    fn load_tables(
        storage: &dyn Storage,
        params: &ProductQuantizerParams,
        subvector_len: usize,
    ) -> VectorResult<Option<Arc<PqTables>>> {
        let flat = storage.get(FLAT_CENTROIDS_KEY)?;
        let dists = storage.get(CENTROID_DISTS_KEY)?;
        match (flat, dists) {
            (Some(flat), Some(dists)) => Ok(Some(Arc::new(PqTables {
                num_subvectors: params.num_subvectors,
                num_centroids: params.num_centroids,
                subvector_len,
                flat_centroids: conversion::bytes_to_floats(&flat),
                centroid_dists: conversion::bytes_to_floats(&dists),
            }))),
            (None, None) => Ok(None),
            _ => {
                warn!("partial product quantizer tables in storage, ignoring");
                Ok(None)
            }
        }
    }

    fn tables_snapshot(&self) -> VectorResult<Option<Arc<PqTables>>> {
        Ok(self.tables.read().map_err(|_| VectorError::LockPoisoned)?.clone())
    }

    /// Whether a point with `id` is known to memory or storage.
    #[must_use]
    pub fn exists(&self, id: u64) -> bool {
        self.items.get(id).is_ok()
    }

    /// Get a single point.
    pub fn get(&self, id: u64) -> VectorResult<VectorStorePoint> {
        Ok(VectorStorePoint::Product(self.items.get(id)?))
    }

    /// Get a batch of points; fails on the first missing id.
    pub fn get_many(&self, ids: &[u64]) -> VectorResult<Vec<VectorStorePoint>> {
        Ok(self.items.get_many(ids)?.into_iter().map(VectorStorePoint::Product).collect())
    }

    /// Visit every stored point exactly once.
    pub fn for_each(
        &self,
        mut f: impl FnMut(&VectorStorePoint) -> VectorResult<()>,
    ) -> VectorResult<()> {
        self.items.for_each(|point| f(&VectorStorePoint::Product(Arc::clone(point))))
    }

    /// Insert or replace the vector for `id`, encoding it immediately
    /// when the quantizer is already fitted.
    pub fn set(&self, id: u64, vector: Vec<f32>) -> VectorResult<VectorStorePoint> {
        debug_assert_eq!(vector.len(), self.vector_len, "vector has wrong dimension");
        let centroid_ids = match self.tables_snapshot()? {
            Some(tables) => tables.encode(&vector),
            None => Vec::new(),
        };
        let shared = self.items.put(PqPoint::new(id, vector, centroid_ids))?;
        Ok(VectorStorePoint::Product(shared))
    }

    /// Delete the given ids from memory and storage.
    pub fn delete(&self, ids: &[u64]) -> VectorResult<()> {
        self.items.delete(ids)
    }

    /// Train the codebooks and re-encode every stored point.
    ///
    /// A no-op until the cache holds at least `trigger_threshold` points,
    /// and forever after the first successful run. Each subvector trains
    /// on its own thread against its own slice of the output tables; the
    /// join makes the results visible to subsequent readers. Nothing is
    /// persisted here; `flush` writes the tables and the re-encoded
    /// points.
    pub fn fit(&self) -> VectorResult<()> {
        if self.tables_snapshot()?.is_some() {
            return Ok(());
        }
        if self.items.count()? < self.params.trigger_threshold {
            return Ok(());
        }
        let start = Instant::now();

        let m = self.params.num_subvectors;
        let k = self.params.num_centroids;
        let sub = self.subvector_len;

        // Materialize every vector; fit is the first encoding, so the
        // raw vectors are all still present.
        let mut vectors: Vec<Vec<f32>> = Vec::new();
        let mut points = Vec::new();
        self.items.for_each(|shared| {
            let mut point = shared.write().map_err(|_| VectorError::LockPoisoned)?;
            vectors.push(point.vector.clone());
            point.centroid_ids = vec![0u8; m];
            point.mark_dirty();
            points.push(Arc::clone(shared));
            Ok(())
        })?;

        let mut flat_centroids = vec![0.0f32; m * k * sub];
        let mut centroid_dists = vec![0.0f32; m * k * k];
        let mut labels: Vec<Vec<u8>> = vec![Vec::new(); m];
        let dist_fn = self.dist_fn;

        std::thread::scope(|scope| {
            let subvector_jobs = flat_centroids
                .chunks_mut(k * sub)
                .zip(centroid_dists.chunks_mut(k * k))
                .zip(labels.iter_mut());
            for (i, ((flat_slice, dist_slice), label_slot)) in subvector_jobs.enumerate() {
                let vectors = &vectors;
                scope.spawn(move || {
                    let trainer =
                        KMeans { k, max_iter: MAX_ITERATIONS, offset: i * sub, width: sub };
                    let out = trainer.fit(vectors);
                    for (j, centroid) in out.centroids.iter().enumerate() {
                        flat_slice[j * sub..(j + 1) * sub].copy_from_slice(centroid);
                    }
                    for a in 0..k {
                        for b in 0..k {
                            dist_slice[a * k + b] = dist_fn(&out.centroids[a], &out.centroids[b]);
                        }
                    }
                    *label_slot = out.labels;
                });
            }
        });

        for (j, shared) in points.iter().enumerate() {
            let mut point = shared.write().map_err(|_| VectorError::LockPoisoned)?;
            for (i, subvector_labels) in labels.iter().enumerate() {
                point.centroid_ids[i] = subvector_labels[j];
            }
        }

        let tables = Arc::new(PqTables {
            num_subvectors: m,
            num_centroids: k,
            subvector_len: sub,
            flat_centroids,
            centroid_dists,
        });
        *self.tables.write().map_err(|_| VectorError::LockPoisoned)? = Some(tables);

        debug!(
            num_points = points.len(),
            num_subvectors = m,
            num_centroids = k,
            elapsed = ?start.elapsed(),
            "fitted product quantizer"
        );
        Ok(())
    }

    /// Distance closure from a raw query vector to stored points.
    ///
    /// Before fitting this is the plain float kernel against each point's
    /// raw vector. After fitting an `M x K` lookup table of
    /// query-to-centroid distances is computed once, and each candidate
    /// costs `M` table lookups.
    pub fn distance_from_float(&self, query: &[f32]) -> VectorResult<PointDistFn> {
        debug_assert_eq!(query.len(), self.vector_len, "query has wrong dimension");
        let dist_fn = self.dist_fn;

        let Some(tables) = self.tables_snapshot()? else {
            let query = query.to_vec();
            return Ok(Box::new(move |y| match y {
                VectorStorePoint::Product(shared) => match shared.read() {
                    Ok(point) if !point.vector.is_empty() => dist_fn(&query, &point.vector),
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
            }));
        };

        let m = tables.num_subvectors;
        let k = tables.num_centroids;
        let sub = tables.subvector_len;
        let mut lookup = vec![0.0f32; m * k];
        for i in 0..m {
            let window = &query[i * sub..(i + 1) * sub];
            for j in 0..k {
                lookup[i * k + j] = dist_fn(window, tables.centroid(i, j));
            }
        }

        Ok(Box::new(move |y| match y {
            VectorStorePoint::Product(shared) => match shared.read() {
                Ok(point) if point.centroid_ids.len() == m => point
                    .centroid_ids
                    .iter()
                    .enumerate()
                    .map(|(i, &code)| lookup[i * k + code as usize])
                    .sum(),
                Ok(point) => {
                    warn!(id = point.id, "point has no code for distance calculation");
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

    /// Distance closure from a stored point to other stored points.
    ///
    /// After fitting each candidate costs `M` lookups into the symmetric
    /// centroid-to-centroid table. The source point's state is
    /// snapshotted at construction time.
    pub fn distance_from_point(&self, x: &VectorStorePoint) -> VectorResult<PointDistFn> {
        let dist_fn = self.dist_fn;
        let x_id = x.id();
        let x_point = match x {
            VectorStorePoint::Product(shared) => shared.read().ok(),
            _ => None,
        };

        let Some(tables) = self.tables_snapshot()? else {
            let x_vector = x_point.and_then(|point| {
                if point.vector.is_empty() {
                    None
                } else {
                    Some(point.vector.clone())
                }
            });
            return Ok(Box::new(move |y| {
                let Some(x_vector) = &x_vector else {
                    warn!(id_x = x_id, id_y = y.id(), "point unusable for distance calculation");
                    return f32::MAX;
                };
                match y {
                    VectorStorePoint::Product(shared) => match shared.read() {
                        Ok(point) if !point.vector.is_empty() => dist_fn(x_vector, &point.vector),
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
            }));
        };

        let m = tables.num_subvectors;
        let x_codes = x_point.and_then(|point| {
            if point.centroid_ids.len() == m {
                Some(point.centroid_ids.clone())
            } else {
                None
            }
        });
        Ok(Box::new(move |y| {
            let Some(x_codes) = &x_codes else {
                warn!(id_x = x_id, id_y = y.id(), "point unusable for distance calculation");
                return f32::MAX;
            };
            match y {
                VectorStorePoint::Product(shared) => match shared.read() {
                    Ok(point) if point.centroid_ids.len() == m => x_codes
                        .iter()
                        .zip(point.centroid_ids.iter())
                        .enumerate()
                        .map(|(i, (&a, &b))| tables.centroid_dist(i, a as usize, b as usize))
                        .sum(),
                    Ok(point) => {
                        warn!(id = point.id, "point has no code for distance calculation");
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

    /// Flush dirty points, then persist the trained tables if present.
    pub fn flush(&self) -> VectorResult<()> {
        self.items.flush()?;
        if let Some(tables) = self.tables_snapshot()? {
            let storage = Arc::clone(&*self.storage.read().map_err(|_| VectorError::LockPoisoned)?);
            storage.put(CENTROID_DISTS_KEY, &conversion::floats_to_bytes(&tables.centroid_dists))?;
            storage.put(FLAT_CENTROIDS_KEY, &conversion::floats_to_bytes(&tables.flat_centroids))?;
        }
        Ok(())
    }

    /// Resident size of the cache plus the centroid tables.
    pub fn size_in_memory(&self) -> VectorResult<usize> {
        let mut total = self.items.size_in_memory()?;
        if let Some(tables) = self.tables_snapshot()? {
            total += 4 * (tables.flat_centroids.len() + tables.centroid_dists.len());
        }
        Ok(total)
    }

    /// Swap the backing storage handle for the cache and table writes.
    pub fn update_storage(&self, storage: Arc<dyn Storage>) -> VectorResult<()> {
        self.items.update_storage(Arc::clone(&storage))?;
        *self.storage.write().map_err(|_| VectorError::LockPoisoned)? = storage;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::plain::RawPoint;
    use quiver_storage::MemoryStorage;

    fn params(m: usize, k: usize, trigger: usize) -> ProductQuantizerParams {
        ProductQuantizerParams { num_subvectors: m, num_centroids: k, trigger_threshold: trigger }
    }

    fn new_pq(distance_name: &str, m: usize, k: usize, trigger: usize, d: usize) -> ProductQuantizer {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        ProductQuantizer::new(storage, distance_name, params(m, k, trigger), d).unwrap()
    }

    /// The four-point set from which two obvious clusters emerge per
    /// subvector.
    fn insert_clustered(pq: &ProductQuantizer) {
        pq.set(1, vec![0.0, 0.0, 10.0, 10.0]).unwrap();
        pq.set(2, vec![0.0, 0.0, 11.0, 11.0]).unwrap();
        pq.set(3, vec![5.0, 5.0, 0.0, 0.0]).unwrap();
        pq.set(4, vec![6.0, 6.0, 0.0, 0.0]).unwrap();
    }

    #[test]
    fn geometry_must_divide() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let result =
            ProductQuantizer::new(Arc::clone(&storage), DISTANCE_EUCLIDEAN, params(3, 256, 0), 10);
        assert!(matches!(result, Err(VectorError::InvalidGeometry(_))));

        // Failed construction must not touch the store
        let mut keys = 0;
        storage.for_each(&mut |_, _| {
            keys += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(keys, 0);
    }

    #[test]
    fn centroid_count_capped_at_byte_range() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let result = ProductQuantizer::new(storage, DISTANCE_EUCLIDEAN, params(2, 257, 0), 4);
        assert!(matches!(result, Err(VectorError::InvalidGeometry(_))));
    }

    #[test]
    fn unknown_distance_rejected() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let result = ProductQuantizer::new(storage, "manhattan", params(2, 2, 0), 4);
        assert!(matches!(result, Err(VectorError::UnsupportedDistance(_))));
    }

    #[test]
    fn cosine_is_served_by_euclidean() {
        // The silent substitution contract: under the cosine name,
        // pre-fit distances are squared L2, not 1 - dot.
        let pq = new_pq(DISTANCE_COSINE, 2, 2, 100, 4);
        pq.set(1, vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        let point = pq.get(1).unwrap();

        let dist = pq.distance_from_float(&[0.0, 1.0, 0.0, 0.0]).unwrap();
        assert_eq!(dist(&point), 2.0);
    }

    #[test]
    fn set_before_fit_leaves_code_empty() {
        let pq = new_pq(DISTANCE_EUCLIDEAN, 2, 2, 4, 4);
        let point = pq.set(1, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let VectorStorePoint::Product(shared) = point else { panic!("expected pq point") };
        assert!(shared.read().unwrap().centroid_ids().is_empty());
    }

    #[test]
    fn fit_below_trigger_is_a_noop() {
        let pq = new_pq(DISTANCE_EUCLIDEAN, 2, 2, 10, 4);
        insert_clustered(&pq);
        pq.fit().unwrap();
        assert!(pq.tables_snapshot().unwrap().is_none());
    }

    #[test]
    fn fit_clusters_and_encodes() {
        let pq = new_pq(DISTANCE_EUCLIDEAN, 2, 2, 4, 4);
        insert_clustered(&pq);
        pq.fit().unwrap();

        // Every point carries an M-byte code with entries below K
        for id in 1..=4u64 {
            let point = pq.items.get(id).unwrap();
            let point = point.read().unwrap();
            assert_eq!(point.centroid_ids().len(), 2);
            assert!(point.centroid_ids().iter().all(|&c| c < 2));
        }

        // Points 1 and 2 share a cluster per subvector, 3 is elsewhere
        let p1 = pq.get(1).unwrap();
        let p2 = pq.get(2).unwrap();
        let p3 = pq.get(3).unwrap();
        let from_p1 = pq.distance_from_point(&p1).unwrap();
        assert!(from_p1(&p2) < 1e-6);
        assert!(from_p1(&p3) > 1.0);
    }

    #[test]
    fn centroid_dists_symmetric_with_zero_diagonal() {
        let pq = new_pq(DISTANCE_EUCLIDEAN, 2, 2, 4, 4);
        insert_clustered(&pq);
        pq.fit().unwrap();

        let tables = pq.tables_snapshot().unwrap().unwrap();
        for i in 0..2 {
            for a in 0..2 {
                assert_eq!(tables.centroid_dist(i, a, a), 0.0);
                for b in 0..2 {
                    assert_eq!(tables.centroid_dist(i, a, b), tables.centroid_dist(i, b, a));
                    assert!(tables.centroid_dist(i, a, b) >= 0.0);
                }
            }
        }
    }

    #[test]
    fn asymmetric_distance_sums_table_lookups() {
        let pq = new_pq(DISTANCE_EUCLIDEAN, 2, 2, 4, 4);
        insert_clustered(&pq);
        pq.fit().unwrap();

        let query = vec![0.0, 0.0, 10.0, 10.0];
        let p3 = pq.get(3).unwrap();
        let dist = pq.distance_from_float(&query).unwrap();
        let got = dist(&p3);

        // Reconstruct the expected sum from the tables directly
        let tables = pq.tables_snapshot().unwrap().unwrap();
        let VectorStorePoint::Product(shared) = &p3 else { unreachable!() };
        let codes = shared.read().unwrap().centroid_ids().to_vec();
        let expected: f32 = (0..2)
            .map(|i| {
                let window = &query[i * 2..(i + 1) * 2];
                euclidean(window, tables.centroid(i, codes[i] as usize))
            })
            .sum();
        assert!((got - expected).abs() < 1e-5);

        // And it approximates the true squared distance
        let truth = euclidean(&query, &[5.0, 5.0, 0.0, 0.0]);
        assert!((got - truth).abs() / truth < 0.2, "got {got}, truth {truth}");
    }

    fn euclidean(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
    }

    #[test]
    fn fit_is_idempotent() {
        let pq = new_pq(DISTANCE_EUCLIDEAN, 2, 2, 4, 4);
        insert_clustered(&pq);
        pq.fit().unwrap();

        let before = pq.tables_snapshot().unwrap().unwrap();
        pq.set(5, vec![100.0, 100.0, 100.0, 100.0]).unwrap();
        pq.fit().unwrap();
        let after = pq.tables_snapshot().unwrap().unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn set_after_fit_encodes_immediately() {
        let pq = new_pq(DISTANCE_EUCLIDEAN, 2, 2, 4, 4);
        insert_clustered(&pq);
        pq.fit().unwrap();

        let point = pq.set(5, vec![0.0, 0.0, 10.5, 10.5]).unwrap();
        let VectorStorePoint::Product(shared) = &point else { unreachable!() };
        let codes = shared.read().unwrap().centroid_ids().to_vec();
        assert_eq!(codes.len(), 2);

        // It lands in the same clusters as point 1
        let p1 = pq.get(1).unwrap();
        let from_p1 = pq.distance_from_point(&p1).unwrap();
        assert!(from_p1(&point) < 1e-6);
    }

    #[test]
    fn unfitted_fallback_matches_float_kernel_exactly() {
        let pq = new_pq(DISTANCE_EUCLIDEAN, 2, 2, 100, 4);
        pq.set(1, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let point = pq.get(1).unwrap();

        let query = [0.5, 0.5, 0.5, 0.5];
        let dist = pq.distance_from_float(&query).unwrap();
        assert_eq!(dist(&point), euclidean(&query, &[1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn foreign_point_is_maximally_distant() {
        let pq = new_pq(DISTANCE_EUCLIDEAN, 2, 2, 4, 4);
        insert_clustered(&pq);
        pq.fit().unwrap();

        let foreign = VectorStorePoint::Plain(Arc::new(RwLock::new(RawPoint::new(
            99,
            vec![0.0, 0.0, 10.0, 10.0],
        ))));
        let dist = pq.distance_from_float(&[0.0; 4]).unwrap();
        assert_eq!(dist(&foreign), f32::MAX);

        let from_foreign = pq.distance_from_point(&foreign).unwrap();
        let p1 = pq.get(1).unwrap();
        assert_eq!(from_foreign(&p1), f32::MAX);
    }

    #[test]
    fn flush_persists_tables_and_reopen_loads_them() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let pq = ProductQuantizer::new(
            Arc::clone(&storage),
            DISTANCE_EUCLIDEAN,
            params(2, 2, 4),
            4,
        )
        .unwrap();
        pq.set(1, vec![0.0, 0.0, 10.0, 10.0]).unwrap();
        pq.set(2, vec![0.0, 0.0, 11.0, 11.0]).unwrap();
        pq.set(3, vec![5.0, 5.0, 0.0, 0.0]).unwrap();
        pq.set(4, vec![6.0, 6.0, 0.0, 0.0]).unwrap();
        pq.fit().unwrap();
        pq.flush().unwrap();
        let codes_before = {
            let point = pq.items.get(3).unwrap();
            let point = point.read().unwrap();
            point.centroid_ids().to_vec()
        };
        drop(pq);

        let reopened = ProductQuantizer::new(
            Arc::clone(&storage),
            DISTANCE_EUCLIDEAN,
            params(2, 2, 4),
            4,
        )
        .unwrap();
        assert!(reopened.tables_snapshot().unwrap().is_some());

        // The reloaded point carries its code but not its raw vector
        let point = reopened.items.get(3).unwrap();
        let point = point.read().unwrap();
        assert_eq!(point.centroid_ids(), codes_before.as_slice());
        assert!(point.vector().is_empty());

        // Fit stays a no-op after reopen
        reopened.fit().unwrap();
        let point = reopened.items.get(3).unwrap();
        assert_eq!(point.read().unwrap().centroid_ids(), codes_before.as_slice());
    }

    #[test]
    fn size_in_memory_grows_with_tables() {
        let pq = new_pq(DISTANCE_EUCLIDEAN, 2, 2, 4, 4);
        insert_clustered(&pq);
        let before = pq.size_in_memory().unwrap();
        pq.fit().unwrap();
        let after = pq.size_in_memory().unwrap();
        // Each of the four points gained a 2-byte code; the tables hold
        // 2*2*2 flat centroid floats and 2*2*2 centroid distance floats.
        assert_eq!(after, before + 4 * 2 + 4 * (8 + 8));
    }
}
