//! Tests for the blob store backends
//!
//! These tests verify, for every backend:
//! - Allocate/read/update/delete of variable-length records
//! - Relocation when a record outgrows its capacity
//! - Repeated deletes under both error policies
//! - Storage-order scans that skip freed records
//! - User header fields
//! - Page-boundary padding and persistence (file-backed backends)
//! - Readers and writers blocked behind a slow writer wait instead of failing

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use attrstore::blob::{layout, BlobStore};
use attrstore::{
    open_store, Backend, ExactFitStrategy, StoreConfig, StoreError, NON_EXISTENT,
};
use tempfile::TempDir;

const BACKENDS: [Backend; 3] = [
    Backend::Synchronized,
    Backend::MemoryMapped,
    Backend::InMemory,
];

const FILE_BACKENDS: [Backend; 2] = [Backend::Synchronized, Backend::MemoryMapped];

const PAGE_SIZE: usize = 4096;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_store() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("blobs.dat");
    (temp_dir, path)
}

fn config(path: &PathBuf, backend: Backend) -> StoreConfig {
    StoreConfig::builder()
        .path(path)
        .backend(backend)
        .page_size(PAGE_SIZE)
        .build()
}

fn exact_fit_config(path: &PathBuf, backend: Backend) -> StoreConfig {
    StoreConfig::builder()
        .path(path)
        .backend(backend)
        .page_size(PAGE_SIZE)
        .allocation_strategy(ExactFitStrategy)
        .build()
}

fn open(path: &PathBuf, backend: Backend) -> Box<dyn BlobStore> {
    open_store(&config(path, backend)).unwrap()
}

// =============================================================================
// Allocate/Read Tests
// =============================================================================

#[test]
fn test_allocate_and_read() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);

        let a = store.allocate(b"first").unwrap();
        let b = store.allocate(b"second record").unwrap();

        assert_ne!(a, NON_EXISTENT, "{:?}", backend);
        assert_ne!(a, b, "{:?}", backend);
        assert_eq!(store.read(a).unwrap(), b"first", "{:?}", backend);
        assert_eq!(store.read(b).unwrap(), b"second record", "{:?}", backend);
    }
}

#[test]
fn test_allocate_empty_payload() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);

        let id = store.allocate(&[]).unwrap();
        assert!(store.read(id).unwrap().is_empty(), "{:?}", backend);
    }
}

#[test]
fn test_read_with_lends_payload() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);
        let id = store.allocate(b"borrowed").unwrap();

        let mut seen = 0;
        store
            .read_with(id, &mut |payload| {
                seen = payload.len();
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 8, "{:?}", backend);
    }
}

#[test]
fn test_read_non_existent() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);

        let result = store.read(NON_EXISTENT);
        assert!(
            matches!(result, Err(StoreError::NotFound(_))),
            "{:?}",
            backend
        );
    }
}

#[test]
fn test_read_out_of_range() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);
        store.allocate(b"only").unwrap();

        assert!(
            matches!(
                store.read(100_000),
                Err(StoreError::IndexOutOfBounds { .. })
            ),
            "{:?}",
            backend
        );
        assert!(
            matches!(store.read(-5), Err(StoreError::IndexOutOfBounds { .. })),
            "{:?}",
            backend
        );
    }
}

#[test]
fn test_allocate_too_large() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);
        let max = store.max_payload_size();
        assert_eq!(max, PAGE_SIZE - layout::RECORD_HEADER_SIZE);

        let id = store.allocate(&vec![3u8; max]).unwrap();
        assert_eq!(store.read(id).unwrap().len(), max, "{:?}", backend);

        let result = store.allocate(&vec![0u8; max + 1]);
        assert!(
            matches!(result, Err(StoreError::RecordTooLarge { .. })),
            "{:?}",
            backend
        );
    }
}

// =============================================================================
// Update/Relocation Tests
// =============================================================================

#[test]
fn test_update_in_place_keeps_id() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);

        let id = store.allocate(b"short").unwrap();
        let capacity = store.record_capacity(id).unwrap();
        let payload = vec![9u8; capacity];

        let new_id = store.update(id, &payload).unwrap();
        assert_eq!(new_id, id, "{:?}", backend);
        assert_eq!(store.read(id).unwrap(), payload, "{:?}", backend);
        assert_eq!(store.stats().records_relocated, 0, "{:?}", backend);
    }
}

#[test]
fn test_update_shrink_truncates_length() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);

        let id = store.allocate(b"a longer value").unwrap();
        assert_eq!(store.update(id, b"tiny").unwrap(), id);
        assert_eq!(store.read(id).unwrap(), b"tiny", "{:?}", backend);
    }
}

#[test]
fn test_update_relocates_when_outgrown() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open_store(&exact_fit_config(&path, backend)).unwrap();

        let id = store.allocate(&[1u8; 10]).unwrap();
        assert_eq!(store.record_capacity(id).unwrap(), 16);

        let grown = vec![2u8; 40];
        let new_id = store.update(id, &grown).unwrap();

        assert_ne!(new_id, id, "{:?}", backend);
        assert_eq!(store.read(new_id).unwrap(), grown, "{:?}", backend);
        assert!(
            matches!(store.read(id), Err(StoreError::RecordAlreadyDeleted(_))),
            "{:?}",
            backend
        );
        assert_eq!(store.stats().records_relocated, 1, "{:?}", backend);
    }
}

#[test]
fn test_write_with_sees_current_payload() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);
        let id = store.allocate(b"abc").unwrap();

        let new_id = store
            .write_with(id, &mut |payload| {
                assert_eq!(payload.as_slice(), b"abc");
                payload.extend_from_slice(b"def");
                Ok(true)
            })
            .unwrap();

        assert_eq!(store.read(new_id).unwrap(), b"abcdef", "{:?}", backend);
    }
}

#[test]
fn test_write_with_unchanged_skips_write() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);
        let id = store.allocate(b"abc").unwrap();

        let new_id = store
            .write_with(id, &mut |payload| {
                payload.clear();
                Ok(false)
            })
            .unwrap();

        assert_eq!(new_id, id);
        assert_eq!(store.read(id).unwrap(), b"abc", "{:?}", backend);
    }
}

#[test]
fn test_write_with_error_leaves_record() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);
        let id = store.allocate(b"abc").unwrap();

        let result = store.write_with(id, &mut |payload| {
            payload.push(1);
            Err(StoreError::InvalidArgument("rejected".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(store.read(id).unwrap(), b"abc", "{:?}", backend);
    }
}

#[test]
fn test_rewrite_in_place() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open_store(&exact_fit_config(&path, backend)).unwrap();
        let id = store.allocate(&[1u8; 16]).unwrap();

        assert!(store.rewrite_in_place(id, &[2u8; 12]).unwrap());
        assert_eq!(store.read(id).unwrap(), vec![2u8; 12], "{:?}", backend);

        assert!(!store.rewrite_in_place(id, &[3u8; 17]).unwrap());
        assert_eq!(store.read(id).unwrap(), vec![2u8; 12], "{:?}", backend);
    }
}

// =============================================================================
// Contention Tests
// =============================================================================

#[test]
fn test_read_waits_for_slow_writer() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store: Arc<dyn BlobStore> = Arc::from(open(&path, backend));
        let id = store.allocate(b"before").unwrap();
        let writing = Arc::new(AtomicBool::new(false));

        let writer = {
            let store = Arc::clone(&store);
            let writing = Arc::clone(&writing);
            thread::spawn(move || {
                store
                    .write_with(id, &mut |payload: &mut Vec<u8>| {
                        writing.store(true, Ordering::Release);
                        thread::sleep(Duration::from_millis(300));
                        payload.clear();
                        payload.extend_from_slice(b"after");
                        Ok(true)
                    })
                    .unwrap()
            })
        };

        while !writing.load(Ordering::Acquire) {
            thread::yield_now();
        }
        let started = Instant::now();
        let seen = store.read(id);
        let waited = started.elapsed();

        assert_eq!(writer.join().unwrap(), id);
        let seen = seen
            .unwrap_or_else(|e| panic!("{:?}: read failed after {:?}: {}", backend, waited, e));
        assert!(
            seen == b"before" || seen == b"after",
            "{:?} saw {:?}",
            backend,
            seen
        );
        assert_eq!(store.read(id).unwrap(), b"after");
    }
}

#[test]
fn test_writer_waits_for_slow_writer() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store: Arc<dyn BlobStore> = Arc::from(open(&path, backend));
        let id = store.allocate(b"0").unwrap();
        let writing = Arc::new(AtomicBool::new(false));

        let slow = {
            let store = Arc::clone(&store);
            let writing = Arc::clone(&writing);
            thread::spawn(move || {
                store
                    .write_with(id, &mut |payload: &mut Vec<u8>| {
                        writing.store(true, Ordering::Release);
                        thread::sleep(Duration::from_millis(300));
                        payload.push(b'1');
                        Ok(true)
                    })
                    .unwrap()
            })
        };

        while !writing.load(Ordering::Acquire) {
            thread::yield_now();
        }
        let id = store
            .write_with(id, &mut |payload: &mut Vec<u8>| {
                payload.push(b'2');
                Ok(true)
            })
            .unwrap();

        assert_eq!(slow.join().unwrap(), id, "{:?}", backend);
        assert_eq!(store.read(id).unwrap(), b"012", "{:?}", backend);
    }
}

// =============================================================================
// Delete Tests
// =============================================================================

#[test]
fn test_delete_then_read() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);
        let id = store.allocate(b"doomed").unwrap();

        assert!(store.delete(id).unwrap());
        assert!(
            matches!(store.read(id), Err(StoreError::RecordAlreadyDeleted(_))),
            "{:?}",
            backend
        );
        assert_eq!(store.stats().records_deleted, 1, "{:?}", backend);
        assert_eq!(store.stats().live_records(), 0, "{:?}", backend);
    }
}

#[test]
fn test_double_delete_fails_by_default() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);
        let id = store.allocate(b"doomed").unwrap();

        store.delete(id).unwrap();
        let err = store.delete(id).unwrap_err();
        assert!(err.is_already_deleted(), "{:?}", backend);
    }
}

#[test]
fn test_double_delete_ignored_when_configured() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let config = StoreConfig::builder()
            .path(&path)
            .backend(backend)
            .page_size(PAGE_SIZE)
            .ignore_already_deleted_errors(true)
            .build();
        let store = open_store(&config).unwrap();
        let id = store.allocate(b"doomed").unwrap();

        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap(), "{:?}", backend);
        assert_eq!(store.stats().records_deleted, 1, "{:?}", backend);
    }
}

// =============================================================================
// Scan Tests
// =============================================================================

#[test]
fn test_for_each_skips_deleted_in_storage_order() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);

        let ids: Vec<_> = (0..5u8).map(|i| store.allocate(&[i; 8]).unwrap()).collect();
        store.delete(ids[1]).unwrap();
        store.delete(ids[3]).unwrap();

        let mut seen = Vec::new();
        let count = store
            .for_each(&mut |id, payload| {
                seen.push((id, payload[0]));
                Ok(())
            })
            .unwrap();

        assert_eq!(count, 3, "{:?}", backend);
        assert_eq!(
            seen,
            vec![(ids[0], 0), (ids[2], 2), (ids[4], 4)],
            "{:?}",
            backend
        );
    }
}

#[test]
fn test_for_each_stops_on_visitor_error() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);
        store.allocate(b"one").unwrap();
        store.allocate(b"two").unwrap();

        let mut calls = 0;
        let result = store.for_each(&mut |_, _| {
            calls += 1;
            Err(StoreError::InvalidArgument("stop".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(calls, 1, "{:?}", backend);
    }
}

// =============================================================================
// Header Field Tests
// =============================================================================

#[test]
fn test_header_fields() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);

        for i in 0..layout::USER_HEADER_FIELDS {
            assert_eq!(store.header_field(i).unwrap(), 0);
        }
        store.set_header_field(0, 47).unwrap();
        store.set_header_field(5, -1).unwrap();

        assert_eq!(store.header_field(0).unwrap(), 47, "{:?}", backend);
        assert_eq!(store.header_field(5).unwrap(), -1, "{:?}", backend);
        assert!(matches!(
            store.header_field(layout::USER_HEADER_FIELDS),
            Err(StoreError::InvalidArgument(_))
        ));
    }
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_dirty_until_forced() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);

        store.allocate(b"data").unwrap();
        assert!(store.is_dirty(), "{:?}", backend);

        store.force().unwrap();
        assert!(!store.is_dirty(), "{:?}", backend);
    }
}

#[test]
fn test_closed_store_rejects_calls() {
    for backend in BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open(&path, backend);
        let id = store.allocate(b"data").unwrap();

        store.close().unwrap();

        assert!(matches!(store.read(id), Err(StoreError::Closed)), "{:?}", backend);
        assert!(matches!(store.allocate(b"x"), Err(StoreError::Closed)));
        // closing twice is harmless
        store.close().unwrap();
    }
}

#[test]
fn test_invalid_page_size_rejected() {
    let (_temp, path) = setup_temp_store();
    let config = StoreConfig::builder()
        .path(&path)
        .backend(Backend::Synchronized)
        .page_size(5000)
        .build();

    assert!(matches!(open_store(&config), Err(StoreError::Config(_))));
}

// =============================================================================
// Paged Layout Tests (file-backed backends)
// =============================================================================

#[test]
fn test_record_never_crosses_page_boundary() {
    for backend in FILE_BACKENDS {
        let (_temp, path) = setup_temp_store();
        let store = open_store(&exact_fit_config(&path, backend)).unwrap();

        // each record occupies 16 + 1008 = 1024 bytes
        let ids: Vec<_> = (0..4u8)
            .map(|i| store.allocate(&vec![i; 1008]).unwrap())
            .collect();

        // three fit after the 64-byte header, the fourth starts page 1
        assert_eq!(ids[0], 4, "{:?}", backend);
        assert_eq!(ids[2], 4 + 2 * 64, "{:?}", backend);
        assert_eq!(
            layout::id_to_offset(ids[3]),
            PAGE_SIZE as u64,
            "{:?}",
            backend
        );

        for (i, id) in ids.iter().enumerate() {
            assert_eq!(store.read(*id).unwrap(), vec![i as u8; 1008]);
        }
        assert_eq!(store.for_each(&mut |_, _| Ok(())).unwrap(), 4);
    }
}

#[test]
fn test_persists_across_reopen() {
    for backend in FILE_BACKENDS {
        let (_temp, path) = setup_temp_store();
        let (a, b) = {
            let store = open(&path, backend);
            let a = store.allocate(b"kept").unwrap();
            let b = store.allocate(b"removed").unwrap();
            store.delete(b).unwrap();
            store.set_header_field(2, 1234).unwrap();
            store.close().unwrap();
            (a, b)
        };

        let store = open(&path, backend);
        assert!(store.was_closed_properly(), "{:?}", backend);
        assert_eq!(store.read(a).unwrap(), b"kept", "{:?}", backend);
        assert!(store.read(b).unwrap_err().is_already_deleted());
        assert_eq!(store.header_field(2).unwrap(), 1234, "{:?}", backend);
        assert_eq!(store.stats().records_allocated, 2, "{:?}", backend);
        assert_eq!(store.stats().records_deleted, 1, "{:?}", backend);

        // new records land after the old ones
        let c = store.allocate(b"new").unwrap();
        assert!(c > b, "{:?}", backend);
    }
}

#[test]
fn test_backends_share_file_format() {
    let (_temp, path) = setup_temp_store();

    let first = {
        let store = open(&path, Backend::Synchronized);
        let id = store.allocate(b"written by file backend").unwrap();
        store.set_header_field(0, 7).unwrap();
        store.close().unwrap();
        id
    };

    let second = {
        let store = open(&path, Backend::MemoryMapped);
        assert_eq!(store.read(first).unwrap(), b"written by file backend");
        assert_eq!(store.header_field(0).unwrap(), 7);
        let id = store.allocate(b"written by mmap backend").unwrap();
        store.close().unwrap();
        id
    };

    let store = open(&path, Backend::Synchronized);
    assert_eq!(store.read(first).unwrap(), b"written by file backend");
    assert_eq!(store.read(second).unwrap(), b"written by mmap backend");
}

#[test]
fn test_page_size_mismatch_on_reopen() {
    for backend in FILE_BACKENDS {
        let (_temp, path) = setup_temp_store();
        open(&path, backend).close().unwrap();

        let config = StoreConfig::builder()
            .path(&path)
            .backend(backend)
            .page_size(PAGE_SIZE * 2)
            .build();
        assert!(
            matches!(open_store(&config), Err(StoreError::Config(_))),
            "{:?}",
            backend
        );
    }
}

#[test]
fn test_path_reported() {
    let (_temp, path) = setup_temp_store();
    for backend in FILE_BACKENDS {
        let store = open(&path, backend);
        assert_eq!(store.path(), Some(path.as_path()));
        store.close().unwrap();
    }

    let store = open(&path, Backend::InMemory);
    assert!(store.path().is_none());
}
