//! Property tests for AttributesStorage
//!
//! Random sequences of puts and deletes are applied to the storage and to a
//! `BTreeMap` model. After every step:
//! - `has_attribute` agrees with the model for every (file, attribute)
//! - every stored value reads back byte-for-byte
//! - the scan visits exactly the attributes the model holds

use std::collections::{BTreeMap, HashMap};

use attrstore::{AttributesStorage, Backend, RecordId, StoreConfig, NON_EXISTENT};
use proptest::prelude::*;
use tempfile::TempDir;

const FILES: i32 = 4;
const ATTRIBUTES: i32 = 6;

#[derive(Debug, Clone)]
enum Op {
    Put { file_id: i32, attribute_id: i32, value: Vec<u8> },
    DeleteOne { file_id: i32, attribute_id: i32 },
    DeleteAll { file_id: i32 },
}

// =============================================================================
// Helper Functions
// =============================================================================

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (1..=FILES, 0..ATTRIBUTES, prop::collection::vec(any::<u8>(), 0..200)).prop_map(
            |(file_id, attribute_id, value)| Op::Put { file_id, attribute_id, value }
        ),
        2 => (1..=FILES, 0..ATTRIBUTES)
            .prop_map(|(file_id, attribute_id)| Op::DeleteOne { file_id, attribute_id }),
        1 => (1..=FILES).prop_map(|file_id| Op::DeleteAll { file_id }),
    ]
}

fn open(temp_dir: &TempDir, backend: Backend) -> AttributesStorage {
    let config = StoreConfig::builder()
        .path(temp_dir.path().join("attributes.dat"))
        .backend(backend)
        .page_size(4096)
        .build();
    AttributesStorage::open(&config).unwrap()
}

#[derive(Default)]
struct Model {
    values: BTreeMap<(i32, i32), Vec<u8>>,
    directories: HashMap<i32, RecordId>,
}

impl Model {
    fn directory(&self, file_id: i32) -> RecordId {
        self.directories.get(&file_id).copied().unwrap_or(NON_EXISTENT)
    }
}

/// Apply `op` to both sides
fn apply(storage: &AttributesStorage, model: &mut Model, op: &Op) {
    match op {
        Op::Put {
            file_id,
            attribute_id,
            value,
        } => {
            let directory = model.directory(*file_id);
            let new_id = storage
                .update_attribute(directory, *file_id, *attribute_id, value)
                .unwrap();
            model.directories.insert(*file_id, new_id);
            model.values.insert((*file_id, *attribute_id), value.clone());
        }
        Op::DeleteOne {
            file_id,
            attribute_id,
        } => {
            let directory = model.directory(*file_id);
            let removed = storage
                .delete_attribute(directory, *file_id, *attribute_id)
                .unwrap();
            let expected = model.values.remove(&(*file_id, *attribute_id)).is_some();
            assert_eq!(removed, expected, "{:?}", op);
        }
        Op::DeleteAll { file_id } => {
            let directory = model.directory(*file_id);
            let deleted = storage.delete_attributes(directory, *file_id).unwrap();
            assert_eq!(deleted, directory != NON_EXISTENT, "{:?}", op);
            model.directories.remove(file_id);
            model.values.retain(|(owner, _), _| owner != file_id);
        }
    }
}

fn check(storage: &AttributesStorage, model: &Model) {
    for file_id in 1..=FILES {
        let directory = model.directory(file_id);
        for attribute_id in 0..ATTRIBUTES {
            let expected = model.values.get(&(file_id, attribute_id));
            assert_eq!(
                storage.has_attribute(directory, file_id, attribute_id).unwrap(),
                expected.is_some(),
                "file {} attribute {}",
                file_id,
                attribute_id
            );
            assert_eq!(
                storage
                    .read_attribute_value(directory, file_id, attribute_id)
                    .unwrap()
                    .as_ref(),
                expected,
                "file {} attribute {}",
                file_id,
                attribute_id
            );
        }
    }

    let mut scanned = BTreeMap::new();
    storage
        .for_each_attribute(|_, file_id, attribute_id, value| {
            scanned.insert((file_id, attribute_id), value.to_vec());
            Ok(())
        })
        .unwrap();
    assert_eq!(scanned, model.values);
}

fn run_ops(backend: Backend, ops: &[Op]) {
    let temp_dir = TempDir::new().unwrap();
    let storage = open(&temp_dir, backend);
    let mut model = Model::default();

    for op in ops {
        apply(&storage, &mut model, op);
        check(&storage, &model);
    }
}

// =============================================================================
// Property Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn test_in_memory_matches_model(ops in prop::collection::vec(op(), 1..60)) {
        run_ops(Backend::InMemory, &ops);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_file_backend_matches_model(ops in prop::collection::vec(op(), 1..40)) {
        run_ops(Backend::Synchronized, &ops);
    }

    #[test]
    fn test_mmap_backend_matches_model(ops in prop::collection::vec(op(), 1..40)) {
        run_ops(Backend::MemoryMapped, &ops);
    }

    #[test]
    fn test_model_survives_reopen(ops in prop::collection::vec(op(), 1..30)) {
        let temp_dir = TempDir::new().unwrap();
        let mut model = Model::default();
        {
            let storage = open(&temp_dir, Backend::Synchronized);
            for op in &ops {
                apply(&storage, &mut model, op);
            }
            storage.close().unwrap();
        }

        let storage = open(&temp_dir, Backend::MemoryMapped);
        check(&storage, &model);
    }
}
