//! Quiver Storage
//!
//! This crate provides the key-value storage abstraction the quantization
//! core is written against, plus the concrete backend implementations.
//!
//! # Overview
//!
//! The core never opens transactions itself: it holds a [`Storage`] handle
//! that represents whatever view the surrounding system has given it (a
//! write transaction while indexing, a read snapshot while serving). The
//! handle is swapped wholesale when that view changes.
//!
//! Two backends are provided:
//!
//! - [`DiskStorage`] - a transactional B-tree file built on redb
//! - [`MemoryStorage`] - an in-memory ordered map, used by tests and as a
//!   scratch store
//!
//! Consumers must not depend on which backend is in use.
//!
//! # Example
//!
//! ```
//! use quiver_storage::{MemoryStorage, Storage};
//!
//! let storage = MemoryStorage::new();
//! storage.put(b"greeting", b"hello").unwrap();
//! assert_eq!(storage.get(b"greeting").unwrap(), Some(b"hello".to_vec()));
//! ```

mod disk;
mod memory;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;

use thiserror::Error;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The database could not be opened or created.
    #[error("failed to open database: {0}")]
    Open(String),

    /// Attempted a write operation through a read-only view.
    #[error("cannot write through a read-only storage view")]
    ReadOnly,

    /// The backing store reported an error.
    #[error("storage backend error: {0}")]
    Backend(#[from] redb::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A lock guarding backend state was poisoned by a prior panic.
    #[error("storage lock poisoned by a prior panic")]
    LockPoisoned,
}

impl StorageError {
    /// Wrap any redb error type in [`StorageError::Backend`].
    fn backend(err: impl Into<redb::Error>) -> Self {
        Self::Backend(err.into())
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Callback type for key-value scans.
///
/// The key and value slices are only valid for the duration of the call.
pub type ScanFn<'a> = dyn FnMut(&[u8], &[u8]) -> StorageResult<()> + 'a;

/// A key-value view the quantization core reads and writes through.
///
/// Implementations must be safe to share across threads; interior
/// mutability is the backend's concern. Write operations against a
/// read-only view fail with [`StorageError::ReadOnly`].
pub trait Storage: Send + Sync {
    /// Whether this view rejects writes.
    fn is_read_only(&self) -> bool;

    /// Look up a single key.
    ///
    /// Returns `Ok(None)` when the key is absent; errors are reserved for
    /// backend failures.
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Insert or replace a key.
    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Remove a key. Removing an absent key is not an error.
    fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Visit every key-value pair in unspecified order.
    fn for_each(&self, f: &mut ScanFn) -> StorageResult<()>;

    /// Visit every pair whose key starts with `prefix`, in key order.
    fn prefix_scan(&self, prefix: &[u8], f: &mut ScanFn) -> StorageResult<()>;

    /// Visit every pair with `start <= key < end` (or `<= end` when
    /// `inclusive`), in key order.
    fn range_scan(
        &self,
        start: &[u8],
        end: &[u8],
        inclusive: bool,
        f: &mut ScanFn,
    ) -> StorageResult<()>;
}
