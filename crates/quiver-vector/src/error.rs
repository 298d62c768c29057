//! Error types for the vector crate.

use thiserror::Error;

/// Errors that can occur in vector store operations.
#[derive(Debug, Error)]
pub enum VectorError {
    /// A point id is absent from both the cache and the backing storage.
    ///
    /// This is a normal signal during search: the ANN layer uses it to
    /// skip deleted points.
    #[error("point {0} not found")]
    PointNotFound(u64),

    /// The quantizer geometry is inconsistent (dimension not divisible by
    /// the number of subvectors, too many centroids, zero dimensions).
    #[error("invalid quantizer geometry: {0}")]
    InvalidGeometry(String),

    /// An unknown distance function name was requested.
    #[error("unsupported distance function: {0}")]
    UnsupportedDistance(String),

    /// Storage backend error, propagated unmodified.
    #[error("storage error: {0}")]
    Storage(#[from] quiver_storage::StorageError),

    /// A lock was poisoned by a panic in another thread.
    ///
    /// The store should be dropped and reopened; cached state can no
    /// longer be trusted.
    #[error("vector store corrupted: lock poisoned by a prior panic")]
    LockPoisoned,
}

/// Result type alias for vector store operations.
pub type VectorResult<T> = Result<T, VectorError>;
