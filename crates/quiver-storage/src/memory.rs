//! In-memory storage backend.
//!
//! Backed by an ordered map behind a read-write lock. Used as the test
//! double for the disk backend and as a scratch store for ephemeral
//! collections. Read-only views share the same underlying map, so data
//! written through a writable handle is visible through every view.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use crate::{ScanFn, Storage, StorageError, StorageResult};

/// An in-memory [`Storage`] implementation over a `BTreeMap`.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    read_only: bool,
}

impl MemoryStorage {
    /// Create an empty writable store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a read-only view over the same underlying data.
    #[must_use]
    pub fn read_only_view(&self) -> Self {
        Self { entries: Arc::clone(&self.entries), read_only: true }
    }

    /// Collect the pairs matching `filter` so callbacks run without the
    /// map lock held and may re-enter the store.
    fn snapshot(
        &self,
        filter: impl Fn(&[u8]) -> bool,
    ) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries
            .iter()
            .filter(|(k, _)| filter(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

impl Storage for MemoryStorage {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn for_each(&self, f: &mut ScanFn) -> StorageResult<()> {
        for (key, value) in self.snapshot(|_| true)? {
            f(&key, &value)?;
        }
        Ok(())
    }

    fn prefix_scan(&self, prefix: &[u8], f: &mut ScanFn) -> StorageResult<()> {
        for (key, value) in self.snapshot(|k| k.starts_with(prefix))? {
            f(&key, &value)?;
        }
        Ok(())
    }

    fn range_scan(
        &self,
        start: &[u8],
        end: &[u8],
        inclusive: bool,
        f: &mut ScanFn,
    ) -> StorageResult<()> {
        let upper =
            if inclusive { Bound::Included(end.to_vec()) } else { Bound::Excluded(end.to_vec()) };
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = {
            let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
            entries
                .range::<Vec<u8>, _>((Bound::Included(start.to_vec()), upper))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (key, value) in pairs {
            f(&key, &value)?;
        }
        Ok(())
    }
}
