//! Write-through point cache over a key-value store.
//!
//! The cache is the single owner of the points a quantizer works with. It
//! admits points on demand from storage, tracks which resident points have
//! unpersisted changes, and writes those back on [`ItemCache::flush`]. An
//! optional byte budget bounds the resident set; eviction is least
//! recently used and a dirty point is always persisted before it is
//! dropped.
//!
//! Points live behind `Arc<RwLock<_>>` so lookups on distinct ids proceed
//! concurrently while operations on the same point serialize on its own
//! lock. The map lock is only held for bookkeeping, never across storage
//! I/O on the read path's fast case.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use quiver_storage::Storage;

use crate::error::{VectorError, VectorResult};

/// Fixed per-entry bookkeeping charged on top of each point's own size.
const ENTRY_OVERHEAD: usize = 64;

/// A point that knows how to persist itself against the KV store.
///
/// Implementations decide their own key layout; the cache only needs the
/// inverse mapping from storage keys back to ids so it can enumerate
/// points it has never loaded.
pub trait CachePoint: Send + Sync {
    /// The point's stable 64-bit id.
    fn id(&self) -> u64;

    /// Approximate resident size in bytes.
    fn size_in_memory(&self) -> usize;

    /// Take the dirty flag, clearing it.
    fn check_and_clear_dirty(&mut self) -> bool;

    /// Set the dirty flag.
    fn mark_dirty(&mut self);

    /// Load the point with `id` from storage.
    ///
    /// # Errors
    ///
    /// Returns [`VectorError::PointNotFound`] if no key for `id` exists.
    fn read_from(id: u64, storage: &dyn Storage) -> VectorResult<Self>
    where
        Self: Sized;

    /// Persist the point to storage.
    fn write_to(&self, storage: &dyn Storage) -> VectorResult<()>;

    /// Remove every key belonging to `id` from storage. Idempotent.
    fn delete_from(id: u64, storage: &dyn Storage) -> VectorResult<()>;

    /// Recover an id from a storage key owned by this point type, or
    /// `None` for foreign keys.
    fn storage_id_from_key(key: &[u8]) -> Option<u64>
    where
        Self: Sized;
}

/// A point handle shared between the cache and its callers.
pub type SharedPoint<P> = Arc<RwLock<P>>;

struct CacheEntry<P> {
    point: SharedPoint<P>,
    last_access: AtomicU64,
}

impl<P> CacheEntry<P> {
    fn new(point: P, stamp: u64) -> Self {
        Self { point: Arc::new(RwLock::new(point)), last_access: AtomicU64::new(stamp) }
    }

    fn touch(&self, stamp: u64) {
        self.last_access.store(stamp, Ordering::Relaxed);
    }
}

/// Keyed write-through cache of points over a [`Storage`] handle.
pub struct ItemCache<P: CachePoint> {
    entries: RwLock<HashMap<u64, CacheEntry<P>>>,
    storage: RwLock<Arc<dyn Storage>>,
    access_clock: AtomicU64,
    max_size_bytes: Option<usize>,
}

impl<P: CachePoint> ItemCache<P> {
    /// Create an unbounded cache over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            storage: RwLock::new(storage),
            access_clock: AtomicU64::new(0),
            max_size_bytes: None,
        }
    }

    /// Create a cache that evicts least recently used points once the
    /// resident set exceeds `max_size_bytes`.
    #[must_use]
    pub fn bounded(storage: Arc<dyn Storage>, max_size_bytes: usize) -> Self {
        Self { max_size_bytes: Some(max_size_bytes), ..Self::new(storage) }
    }

    fn next_stamp(&self) -> u64 {
        self.access_clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn storage_handle(&self) -> VectorResult<Arc<dyn Storage>> {
        Ok(Arc::clone(&*self.storage.read().map_err(|_| VectorError::LockPoisoned)?))
    }

    /// Atomically swap the backing storage handle.
    ///
    /// Used when the surrounding system moves between a write transaction
    /// and a read snapshot. Not synchronized against in-flight cache
    /// operations; callers quiesce the cache first.
    pub fn update_storage(&self, storage: Arc<dyn Storage>) -> VectorResult<()> {
        *self.storage.write().map_err(|_| VectorError::LockPoisoned)? = storage;
        Ok(())
    }

    /// Get the point with `id`, loading it from storage on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`VectorError::PointNotFound`] if `id` is absent from both
    /// memory and storage.
    pub fn get(&self, id: u64) -> VectorResult<SharedPoint<P>> {
        {
            let entries = self.entries.read().map_err(|_| VectorError::LockPoisoned)?;
            if let Some(entry) = entries.get(&id) {
                entry.touch(self.next_stamp());
                return Ok(Arc::clone(&entry.point));
            }
        }

        let storage = self.storage_handle()?;
        let point = P::read_from(id, storage.as_ref())?;

        let shared = {
            let mut entries = self.entries.write().map_err(|_| VectorError::LockPoisoned)?;
            // Another thread may have admitted the same id while we were
            // reading storage; keep the existing entry in that case.
            let entry = entries.entry(id).or_insert_with(|| CacheEntry::new(point, 0));
            entry.touch(self.next_stamp());
            Arc::clone(&entry.point)
        };
        self.enforce_budget()?;
        Ok(shared)
    }

    /// Batched [`ItemCache::get`] with the same miss semantics.
    pub fn get_many(&self, ids: &[u64]) -> VectorResult<Vec<SharedPoint<P>>> {
        ids.iter().map(|&id| self.get(id)).collect()
    }

    /// Insert or replace a point, marking it dirty.
    pub fn put(&self, mut point: P) -> VectorResult<SharedPoint<P>> {
        point.mark_dirty();
        let id = point.id();
        let shared = {
            let mut entries = self.entries.write().map_err(|_| VectorError::LockPoisoned)?;
            let entry = CacheEntry::new(point, self.next_stamp());
            let shared = Arc::clone(&entry.point);
            entries.insert(id, entry);
            shared
        };
        self.enforce_budget()?;
        Ok(shared)
    }

    /// Remove the given ids from memory and storage. Unknown ids are
    /// ignored.
    pub fn delete(&self, ids: &[u64]) -> VectorResult<()> {
        let storage = self.storage_handle()?;
        {
            let mut entries = self.entries.write().map_err(|_| VectorError::LockPoisoned)?;
            for id in ids {
                entries.remove(id);
            }
        }
        for &id in ids {
            P::delete_from(id, storage.as_ref())?;
        }
        Ok(())
    }

    /// Visit every point known to memory or storage exactly once per id.
    ///
    /// On-disk points are admitted into the cache as they are visited.
    /// Order is unspecified. The cache must not be mutated from inside
    /// the callback.
    pub fn for_each(
        &self,
        mut f: impl FnMut(&SharedPoint<P>) -> VectorResult<()>,
    ) -> VectorResult<()> {
        let resident: Vec<(u64, SharedPoint<P>)> = {
            let entries = self.entries.read().map_err(|_| VectorError::LockPoisoned)?;
            entries.iter().map(|(&id, e)| (id, Arc::clone(&e.point))).collect()
        };

        let mut seen: BTreeSet<u64> = resident.iter().map(|(id, _)| *id).collect();
        for (_, point) in &resident {
            f(point)?;
        }

        let storage = self.storage_handle()?;
        let mut stored: BTreeSet<u64> = BTreeSet::new();
        storage.for_each(&mut |key, _| {
            if let Some(id) = P::storage_id_from_key(key) {
                if !seen.contains(&id) {
                    stored.insert(id);
                }
            }
            Ok(())
        })?;

        for id in stored {
            seen.insert(id);
            let point = self.get(id)?;
            f(&point)?;
        }
        Ok(())
    }

    /// Number of distinct ids known to memory or storage.
    pub fn count(&self) -> VectorResult<usize> {
        let mut ids: BTreeSet<u64> = {
            let entries = self.entries.read().map_err(|_| VectorError::LockPoisoned)?;
            entries.keys().copied().collect()
        };
        let storage = self.storage_handle()?;
        storage.for_each(&mut |key, _| {
            if let Some(id) = P::storage_id_from_key(key) {
                ids.insert(id);
            }
            Ok(())
        })?;
        Ok(ids.len())
    }

    /// Resident size: the sum of each point's own size plus fixed
    /// per-entry overhead.
    pub fn size_in_memory(&self) -> VectorResult<usize> {
        let entries = self.entries.read().map_err(|_| VectorError::LockPoisoned)?;
        let mut total = 0;
        for entry in entries.values() {
            let point = entry.point.read().map_err(|_| VectorError::LockPoisoned)?;
            total += point.size_in_memory() + ENTRY_OVERHEAD;
        }
        Ok(total)
    }

    /// Write every dirty resident point back to storage.
    ///
    /// A failed write restores the point's dirty flag and aborts the
    /// flush, so a retry picks up where this one stopped.
    pub fn flush(&self) -> VectorResult<()> {
        let resident: Vec<SharedPoint<P>> = {
            let entries = self.entries.read().map_err(|_| VectorError::LockPoisoned)?;
            entries.values().map(|e| Arc::clone(&e.point)).collect()
        };
        let storage = self.storage_handle()?;

        for shared in resident {
            let mut point = shared.write().map_err(|_| VectorError::LockPoisoned)?;
            if point.check_and_clear_dirty() {
                if let Err(err) = point.write_to(storage.as_ref()) {
                    point.mark_dirty();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Evict least recently used points until the resident set fits the
    /// byte budget. Dirty points are persisted before eviction; when the
    /// backing storage is read-only they are kept resident instead.
    fn enforce_budget(&self) -> VectorResult<()> {
        let Some(budget) = self.max_size_bytes else { return Ok(()) };
        let storage = self.storage_handle()?;

        let mut entries = self.entries.write().map_err(|_| VectorError::LockPoisoned)?;

        let mut total = 0usize;
        let mut order: Vec<(u64, u64, usize)> = Vec::with_capacity(entries.len());
        for (&id, entry) in entries.iter() {
            let point = entry.point.read().map_err(|_| VectorError::LockPoisoned)?;
            let size = point.size_in_memory() + ENTRY_OVERHEAD;
            total += size;
            order.push((entry.last_access.load(Ordering::Relaxed), id, size));
        }
        if total <= budget {
            return Ok(());
        }
        order.sort_unstable();

        for (_, id, size) in order {
            if total <= budget {
                break;
            }
            let Some(entry) = entries.get(&id) else { continue };
            {
                let mut point = entry.point.write().map_err(|_| VectorError::LockPoisoned)?;
                if point.check_and_clear_dirty() {
                    if storage.is_read_only() {
                        point.mark_dirty();
                        continue;
                    }
                    if let Err(err) = point.write_to(storage.as_ref()) {
                        point.mark_dirty();
                        return Err(err);
                    }
                }
            }
            entries.remove(&id);
            total -= size;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::{self, VECTOR_TAG};
    use quiver_storage::MemoryStorage;

    /// Minimal point persisting a float payload under a `'v'` key.
    struct TestPoint {
        id: u64,
        payload: Vec<f32>,
        dirty: bool,
    }

    impl TestPoint {
        fn new(id: u64, payload: Vec<f32>) -> Self {
            Self { id, payload, dirty: false }
        }
    }

    impl CachePoint for TestPoint {
        fn id(&self) -> u64 {
            self.id
        }

        fn size_in_memory(&self) -> usize {
            8 + self.payload.len() * 4
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
            Ok(Self { id, payload: conversion::bytes_to_floats(&bytes), dirty: false })
        }

        fn write_to(&self, storage: &dyn Storage) -> VectorResult<()> {
            storage.put(
                &conversion::node_key(self.id, VECTOR_TAG),
                &conversion::floats_to_bytes(&self.payload),
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

    fn new_cache() -> (Arc<MemoryStorage>, ItemCache<TestPoint>) {
        let storage = Arc::new(MemoryStorage::new());
        let cache = ItemCache::new(storage.clone());
        (storage, cache)
    }

    #[test]
    fn get_miss_on_empty_cache() {
        let (_storage, cache) = new_cache();
        assert!(matches!(cache.get(1), Err(VectorError::PointNotFound(1))));
    }

    #[test]
    fn put_then_get_serves_from_memory() {
        let (_storage, cache) = new_cache();
        cache.put(TestPoint::new(1, vec![1.0, 2.0])).unwrap();

        let point = cache.get(1).unwrap();
        assert_eq!(point.read().unwrap().payload, vec![1.0, 2.0]);
    }

    #[test]
    fn flush_persists_and_clears_dirty() {
        let (storage, cache) = new_cache();
        cache.put(TestPoint::new(1, vec![1.0])).unwrap();
        assert_eq!(storage.get(&conversion::node_key(1, VECTOR_TAG)).unwrap(), None);

        cache.flush().unwrap();
        assert!(storage.get(&conversion::node_key(1, VECTOR_TAG)).unwrap().is_some());

        // Second flush writes nothing new: mutate storage out-of-band and
        // verify the clean point is not rewritten.
        storage.put(&conversion::node_key(1, VECTOR_TAG), b"sentinel").unwrap();
        cache.flush().unwrap();
        assert_eq!(
            storage.get(&conversion::node_key(1, VECTOR_TAG)).unwrap(),
            Some(b"sentinel".to_vec())
        );
    }

    #[test]
    fn flush_failure_keeps_point_dirty() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = ItemCache::new(storage.clone());
        cache.put(TestPoint::new(1, vec![1.0])).unwrap();

        // Swap in a read-only view; the write must fail and the dirty
        // flag must survive for a later retry.
        cache.update_storage(Arc::new(storage.read_only_view())).unwrap();
        assert!(cache.flush().is_err());

        cache.update_storage(storage.clone()).unwrap();
        cache.flush().unwrap();
        assert!(storage.get(&conversion::node_key(1, VECTOR_TAG)).unwrap().is_some());
    }

    #[test]
    fn get_loads_from_storage_after_restart() {
        let (storage, cache) = new_cache();
        cache.put(TestPoint::new(7, vec![3.0, 4.0])).unwrap();
        cache.flush().unwrap();

        // Fresh cache over the same storage simulates a reopen
        let cache = ItemCache::<TestPoint>::new(storage);
        let point = cache.get(7).unwrap();
        assert_eq!(point.read().unwrap().payload, vec![3.0, 4.0]);
    }

    #[test]
    fn delete_is_idempotent_and_hits_storage() {
        let (storage, cache) = new_cache();
        cache.put(TestPoint::new(1, vec![1.0])).unwrap();
        cache.flush().unwrap();

        cache.delete(&[1, 99]).unwrap();
        assert_eq!(storage.get(&conversion::node_key(1, VECTOR_TAG)).unwrap(), None);
        assert!(matches!(cache.get(1), Err(VectorError::PointNotFound(1))));

        cache.delete(&[1]).unwrap();
    }

    #[test]
    fn for_each_unions_memory_and_storage() {
        let (storage, cache) = new_cache();
        // One point only on disk
        TestPoint::new(1, vec![1.0]).write_to(storage.as_ref()).unwrap();
        // One point resident and on disk
        cache.put(TestPoint::new(2, vec![2.0])).unwrap();
        cache.flush().unwrap();
        // One point resident only
        cache.put(TestPoint::new(3, vec![3.0])).unwrap();

        let mut ids = Vec::new();
        cache
            .for_each(|p| {
                ids.push(p.read().unwrap().id);
                Ok(())
            })
            .unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);

        assert_eq!(cache.count().unwrap(), 3);
    }

    #[test]
    fn size_in_memory_counts_resident_points() {
        let (_storage, cache) = new_cache();
        assert_eq!(cache.size_in_memory().unwrap(), 0);

        cache.put(TestPoint::new(1, vec![0.0; 10])).unwrap();
        let size = cache.size_in_memory().unwrap();
        assert_eq!(size, 8 + 40 + ENTRY_OVERHEAD);
    }

    #[test]
    fn budget_evicts_least_recently_used() {
        let storage = Arc::new(MemoryStorage::new());
        // Room for roughly two resident points
        let per_point = 8 + 4 * 4 + ENTRY_OVERHEAD;
        let cache = ItemCache::bounded(storage.clone(), 2 * per_point);

        cache.put(TestPoint::new(1, vec![0.0; 4])).unwrap();
        cache.put(TestPoint::new(2, vec![0.0; 4])).unwrap();
        // Touch 1 so 2 becomes the eviction candidate
        cache.get(1).unwrap();
        cache.put(TestPoint::new(3, vec![0.0; 4])).unwrap();

        // The evicted point was dirty, so it must have been persisted
        assert!(storage.get(&conversion::node_key(2, VECTOR_TAG)).unwrap().is_some());
        assert!(cache.size_in_memory().unwrap() <= 2 * per_point);

        // And it is still reachable through the cache
        let point = cache.get(2).unwrap();
        assert_eq!(point.read().unwrap().id, 2);
    }

    #[test]
    fn budget_never_drops_dirty_points_on_read_only_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let per_point = 8 + 4 * 4 + ENTRY_OVERHEAD;
        let cache = ItemCache::bounded(Arc::new(storage.read_only_view()), per_point);

        cache.put(TestPoint::new(1, vec![0.0; 4])).unwrap();
        cache.put(TestPoint::new(2, vec![0.0; 4])).unwrap();

        // Over budget, but nothing could be persisted: both stay resident
        let mut ids = Vec::new();
        cache
            .for_each(|p| {
                ids.push(p.read().unwrap().id);
                Ok(())
            })
            .unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }
}
