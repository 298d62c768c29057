//! Cross-backend persistence scenarios.
//!
//! Every scenario runs against both the in-memory and the disk backend;
//! the store must not be able to tell them apart. "Reopen" means
//! dropping the store and constructing a fresh one over the same
//! underlying data, which is how the surrounding system recovers after a
//! restart.

use std::sync::Arc;

use quiver_storage::{DiskStorage, MemoryStorage, Storage};
use quiver_vector::config::{BinaryQuantizerParams, ProductQuantizerParams, QuantizerKind};
use quiver_vector::conversion::{node_key, CODE_TAG, VECTOR_TAG};
use quiver_vector::error::VectorError;
use quiver_vector::store::{VectorStore, VectorStorePoint};

/// Run `scenario` once per backend. The factory reopens the same
/// underlying data on every call.
fn with_backends(scenario: impl Fn(&dyn Fn() -> Arc<dyn Storage>)) {
    let memory = Arc::new(MemoryStorage::new());
    let factory = move || -> Arc<dyn Storage> { memory.clone() };
    scenario(&factory);

    // The disk handle is shared rather than reopened: redb holds the
    // file lock for the lifetime of the process-wide Database.
    let dir = tempfile::tempdir().unwrap();
    let disk = Arc::new(DiskStorage::open(dir.path().join("quiver.redb")).unwrap());
    let factory = move || -> Arc<dyn Storage> { disk.clone() };
    scenario(&factory);
}

fn product_kind(trigger: usize) -> QuantizerKind {
    QuantizerKind::Product(ProductQuantizerParams {
        num_subvectors: 2,
        num_centroids: 2,
        trigger_threshold: trigger,
    })
}

fn binary_kind(trigger: usize) -> QuantizerKind {
    QuantizerKind::Binary(BinaryQuantizerParams {
        threshold: None,
        trigger_threshold: trigger,
        distance_metric: "hamming".to_string(),
    })
}

fn raw_vector(point: &VectorStorePoint) -> Vec<f32> {
    match point {
        VectorStorePoint::Product(p) => p.read().unwrap().vector().to_vec(),
        VectorStorePoint::Binary(p) => p.read().unwrap().vector().to_vec(),
        VectorStorePoint::Plain(p) => p.read().unwrap().vector().to_vec(),
    }
}

#[test]
fn prefit_vector_survives_reopen() {
    with_backends(|factory| {
        {
            let store = VectorStore::new(factory(), "euclidean", &product_kind(100), 4).unwrap();
            store.set(1, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
            store.flush().unwrap();
        }

        let store = VectorStore::new(factory(), "euclidean", &product_kind(100), 4).unwrap();
        let point = store.get(1).unwrap();
        assert_eq!(raw_vector(&point), vec![1.0, 2.0, 3.0, 4.0]);
    });
}

#[test]
fn postfit_codes_survive_reopen() {
    with_backends(|factory| {
        let codes = {
            let store = VectorStore::new(factory(), "euclidean", &product_kind(4), 4).unwrap();
            store.set(1, vec![0.0, 0.0, 10.0, 10.0]).unwrap();
            store.set(2, vec![0.0, 0.0, 11.0, 11.0]).unwrap();
            store.set(3, vec![5.0, 5.0, 0.0, 0.0]).unwrap();
            store.set(4, vec![6.0, 6.0, 0.0, 0.0]).unwrap();
            store.fit().unwrap();
            store.flush().unwrap();

            let VectorStorePoint::Product(p) = store.get(3).unwrap() else { unreachable!() };
            let codes = p.read().unwrap().centroid_ids().to_vec();
            assert_eq!(codes.len(), 2);
            codes
        };

        let store = VectorStore::new(factory(), "euclidean", &product_kind(4), 4).unwrap();
        let VectorStorePoint::Product(p) = store.get(3).unwrap() else { unreachable!() };
        {
            let point = p.read().unwrap();
            assert_eq!(point.centroid_ids(), codes.as_slice());
            // The raw vector is not loaded once the code exists
            assert!(point.vector().is_empty());
        }

        // Distance queries keep working against reloaded codes
        let dist = store.distance_from_float(&[5.0, 5.0, 0.0, 0.0]).unwrap();
        let near = store.get(3).unwrap();
        let far = store.get(1).unwrap();
        assert!(dist(&near) < dist(&far));
    });
}

#[test]
fn binary_threshold_survives_reopen() {
    with_backends(|factory| {
        {
            let store = VectorStore::new(factory(), "euclidean", &binary_kind(2), 4).unwrap();
            store.set(1, vec![0.0, 0.0, 0.0, 0.0]).unwrap();
            store.set(2, vec![2.0, 2.0, 2.0, 2.0]).unwrap();
            store.fit().unwrap();
            store.flush().unwrap();
        }

        let store = VectorStore::new(factory(), "euclidean", &binary_kind(2), 4).unwrap();
        let p1 = store.get(1).unwrap();
        let p2 = store.get(2).unwrap();
        let from_p1 = store.distance_from_point(&p1).unwrap();
        assert_eq!(from_p1(&p2), 4.0);
        assert_eq!(from_p1(&p1), 0.0);
    });
}

#[test]
fn delete_leaves_no_keys_behind() {
    with_backends(|factory| {
        {
            let store = VectorStore::new(factory(), "euclidean", &product_kind(4), 4).unwrap();
            store.set(1, vec![0.0, 0.0, 10.0, 10.0]).unwrap();
            store.set(2, vec![0.0, 0.0, 11.0, 11.0]).unwrap();
            store.set(3, vec![5.0, 5.0, 0.0, 0.0]).unwrap();
            store.set(4, vec![6.0, 6.0, 0.0, 0.0]).unwrap();
            store.fit().unwrap();
            store.flush().unwrap();
            store.delete(&[3]).unwrap();
        }

        let storage = factory();
        assert_eq!(storage.get(&node_key(3, VECTOR_TAG)).unwrap(), None);
        assert_eq!(storage.get(&node_key(3, CODE_TAG)).unwrap(), None);

        let store = VectorStore::new(factory(), "euclidean", &product_kind(4), 4).unwrap();
        assert!(matches!(store.get(3), Err(VectorError::PointNotFound(3))));
        assert!(!store.exists(3));
        assert!(store.exists(1));
    });
}

#[test]
fn plain_store_round_trip() {
    with_backends(|factory| {
        {
            let store = VectorStore::new(factory(), "dot", &QuantizerKind::None, 3).unwrap();
            store.set(5, vec![1.0, 0.0, 2.0]).unwrap();
            store.flush().unwrap();
        }

        let store = VectorStore::new(factory(), "dot", &QuantizerKind::None, 3).unwrap();
        let point = store.get(5).unwrap();
        assert_eq!(raw_vector(&point), vec![1.0, 0.0, 2.0]);

        let dist = store.distance_from_float(&[1.0, 1.0, 1.0]).unwrap();
        assert_eq!(dist(&point), -3.0);
    });
}

#[test]
fn for_each_sees_disk_only_points() {
    with_backends(|factory| {
        {
            let store = VectorStore::new(factory(), "euclidean", &product_kind(100), 4).unwrap();
            for id in 1..=5u64 {
                store.set(id, vec![id as f32; 4]).unwrap();
            }
            store.flush().unwrap();
        }

        // Fresh store: nothing resident, everything on disk
        let store = VectorStore::new(factory(), "euclidean", &product_kind(100), 4).unwrap();
        let mut ids = Vec::new();
        store
            .for_each(|point| {
                ids.push(point.id());
                Ok(())
            })
            .unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    });
}

#[test]
fn update_storage_switches_to_read_snapshot() {
    // The indexing flow: write through a writable handle, flush, then
    // swap in a read-only view for serving.
    let storage = Arc::new(MemoryStorage::new());
    let store = VectorStore::new(storage.clone(), "euclidean", &product_kind(100), 4).unwrap();
    store.set(1, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    store.flush().unwrap();

    store.update_storage(Arc::new(storage.read_only_view())).unwrap();

    // Reads keep working
    let point = store.get(1).unwrap();
    assert_eq!(raw_vector(&point), vec![1.0, 2.0, 3.0, 4.0]);

    // A flush with dirty points now fails and the error carries through
    store.set(2, vec![4.0, 3.0, 2.0, 1.0]).unwrap();
    assert!(matches!(store.flush(), Err(VectorError::Storage(_))));

    // Swapping the writable handle back lets the retry succeed
    store.update_storage(storage.clone()).unwrap();
    store.flush().unwrap();
    assert!(storage.get(&node_key(2, VECTOR_TAG)).unwrap().is_some());
}
