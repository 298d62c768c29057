//! Disk storage backend.
//!
//! A single-table transactional B-tree file built on redb. Each operation
//! runs in its own transaction; the surrounding system batches work by
//! holding one handle per indexing pass and flushing at the end.
//!
//! Opening retries for up to 60 seconds while another process holds the
//! database lock, then gives up with [`StorageError::Open`].

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redb::{Database, DatabaseError, ReadableTable, TableDefinition};

use crate::{ScanFn, Storage, StorageError, StorageResult};

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("quiver");

/// How long to wait for another process to release the database lock.
const OPEN_TIMEOUT: Duration = Duration::from_secs(60);
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// A redb-backed [`Storage`] implementation.
///
/// Cloned and read-only views share the same database handle; redb
/// serializes write transactions internally.
#[derive(Clone)]
pub struct DiskStorage {
    db: Arc<Database>,
    read_only: bool,
}

impl DiskStorage {
    /// Open or create the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the file cannot be opened, or if
    /// another process still holds the lock after the 60-second
    /// acquisition timeout.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let deadline = Instant::now() + OPEN_TIMEOUT;
        let db = loop {
            match Database::create(path) {
                Ok(db) => break db,
                Err(DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                    std::thread::sleep(OPEN_RETRY_INTERVAL);
                }
                Err(err) => {
                    return Err(StorageError::Open(format!("{}: {err}", path.display())));
                }
            }
        };

        // Create the table up front so read transactions never observe a
        // missing table.
        let txn = db.begin_write().map_err(StorageError::backend)?;
        txn.open_table(TABLE).map_err(StorageError::backend)?;
        txn.commit().map_err(StorageError::backend)?;

        Ok(Self { db: Arc::new(db), read_only: false })
    }

    /// Create a read-only view over the same database.
    #[must_use]
    pub fn read_only_view(&self) -> Self {
        Self { db: Arc::clone(&self.db), read_only: true }
    }
}

impl Storage for DiskStorage {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(StorageError::backend)?;
        let table = txn.open_table(TABLE).map_err(StorageError::backend)?;
        let value = table.get(key).map_err(StorageError::backend)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let txn = self.db.begin_write().map_err(StorageError::backend)?;
        {
            let mut table = txn.open_table(TABLE).map_err(StorageError::backend)?;
            table.insert(key, value).map_err(StorageError::backend)?;
        }
        txn.commit().map_err(StorageError::backend)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let txn = self.db.begin_write().map_err(StorageError::backend)?;
        {
            let mut table = txn.open_table(TABLE).map_err(StorageError::backend)?;
            table.remove(key).map_err(StorageError::backend)?;
        }
        txn.commit().map_err(StorageError::backend)?;
        Ok(())
    }

    fn for_each(&self, f: &mut ScanFn) -> StorageResult<()> {
        let txn = self.db.begin_read().map_err(StorageError::backend)?;
        let table = txn.open_table(TABLE).map_err(StorageError::backend)?;
        for pair in table.iter().map_err(StorageError::backend)? {
            let (key, value) = pair.map_err(StorageError::backend)?;
            f(key.value(), value.value())?;
        }
        Ok(())
    }

    fn prefix_scan(&self, prefix: &[u8], f: &mut ScanFn) -> StorageResult<()> {
        let txn = self.db.begin_read().map_err(StorageError::backend)?;
        let table = txn.open_table(TABLE).map_err(StorageError::backend)?;
        let range = table.range::<&[u8]>(prefix..).map_err(StorageError::backend)?;
        for pair in range {
            let (key, value) = pair.map_err(StorageError::backend)?;
            if !key.value().starts_with(prefix) {
                break;
            }
            f(key.value(), value.value())?;
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
        let txn = self.db.begin_read().map_err(StorageError::backend)?;
        let table = txn.open_table(TABLE).map_err(StorageError::backend)?;
        let upper =
            if inclusive { std::ops::Bound::Included(end) } else { std::ops::Bound::Excluded(end) };
        let range = table
            .range::<&[u8]>((std::ops::Bound::Included(start), upper))
            .map_err(StorageError::backend)?;
        for pair in range {
            let (key, value) = pair.map_err(StorageError::backend)?;
            f(key.value(), value.value())?;
        }
        Ok(())
    }
}
