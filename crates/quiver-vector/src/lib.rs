//! Quiver Vector
//!
//! Quantized vector storage for approximate nearest neighbour search.
//!
//! # Overview
//!
//! This crate is the storage substrate a search index sits on: a stream
//! of float vectors keyed by 64-bit ids is kept in a write-through cache
//! over a key-value store, compressed once enough vectors accumulate, and
//! served to the search loop through distance closures that work over the
//! compressed codes.
//!
//! Three stores share one contract (see [`store::VectorStore`]):
//!
//! - **Product quantization** splits each vector into `M` subvectors,
//!   trains `K` centroids per subvector with k-means, and stores `M`
//!   bytes per point.
//! - **Binary quantization** learns a per-dimension threshold and stores
//!   one bit per dimension.
//! - **Plain** stores full-precision vectors.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use quiver_storage::{MemoryStorage, Storage};
//! use quiver_vector::config::{ProductQuantizerParams, QuantizerKind};
//! use quiver_vector::store::VectorStore;
//!
//! let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
//! let kind = QuantizerKind::Product(ProductQuantizerParams {
//!     num_subvectors: 2,
//!     num_centroids: 2,
//!     trigger_threshold: 4,
//! });
//! let store = VectorStore::new(storage, "euclidean", &kind, 4).unwrap();
//!
//! store.set(1, vec![0.0, 0.0, 10.0, 10.0]).unwrap();
//! store.set(2, vec![0.0, 0.0, 11.0, 11.0]).unwrap();
//! store.set(3, vec![5.0, 5.0, 0.0, 0.0]).unwrap();
//! store.set(4, vec![6.0, 6.0, 0.0, 0.0]).unwrap();
//! store.fit().unwrap();
//!
//! let query = [0.0, 0.0, 10.0, 10.0];
//! let dist = store.distance_from_float(&query).unwrap();
//! let near = store.get(2).unwrap();
//! let far = store.get(3).unwrap();
//! assert!(dist(&near) < dist(&far));
//! store.flush().unwrap();
//! ```
//!
//! # Modules
//!
//! - [`store`] - the quantizer stores and the point sum type
//! - [`cache`] - the write-through point cache
//! - [`distance`] - float and bit distance kernels
//! - [`kmeans`] - the codebook trainer
//! - [`conversion`] - storage byte codecs and key scheme
//! - [`config`] - quantizer parameters
//! - [`error`] - error types

pub mod cache;
pub mod config;
pub mod conversion;
pub mod distance;
pub mod error;
pub mod kmeans;
pub mod store;

pub use config::{BinaryQuantizerParams, ProductQuantizerParams, QuantizerKind};
pub use error::{VectorError, VectorResult};
pub use store::{
    BinaryQuantizer, BqPoint, PlainStore, PointDistFn, PqPoint, ProductQuantizer, RawPoint,
    VectorStore, VectorStorePoint,
};
