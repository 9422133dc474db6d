//! Blob Store Module
//!
//! Variable-length record allocator over a paged file.
//!
//! ## Responsibilities
//! - Allocate, read, update and delete byte records by integer id
//! - Relocate a record that outgrows its capacity (the id changes)
//! - Keep a small header region for store-wide metadata
//! - Detect an unclean shutdown on reopen
//!
//! ## Backends
//! All three implement [`BlobStore`] and are picked at construction:
//! - [`FileBlobStore`]: positioned file I/O, every operation under one mutex
//! - [`MmapBlobStore`]: memory-mapped pages, CAS allocation, per-record seqlocks
//! - [`InMemoryBlobStore`]: heap only
//!
//! The file and mmap backends share the on-disk format in [`layout`], so a
//! file written by one can be opened by the other.

pub mod layout;

mod file;
mod memory;
mod mmap;

use std::path::Path;

use crate::config::{Backend, StoreConfig};
use crate::error::{Result, StoreError};

pub use file::FileBlobStore;
pub use memory::InMemoryBlobStore;
pub use mmap::MmapBlobStore;

/// Identifier of a blob record
pub type RecordId = i32;

/// Id that never names a record ("no record yet")
pub const NON_EXISTENT: RecordId = 0;

/// Counters kept in the store header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Slots ever allocated, relocation targets included
    pub records_allocated: u32,
    /// Slots abandoned because their record moved
    pub records_relocated: u32,
    /// Slots freed by `delete`
    pub records_deleted: u32,
    /// Bytes of record space handed out so far
    pub storage_size: u64,
}

impl StoreStats {
    pub fn live_records(&self) -> u32 {
        self.records_allocated
            .saturating_sub(self.records_relocated)
            .saturating_sub(self.records_deleted)
    }
}

/// Variable-length record storage addressed by [`RecordId`]
///
/// Every mutating call may hand back a different id than it was given; callers
/// must keep the returned one. Closures passed to `read_with`, `write_with` and
/// `for_each` run while the backend holds its record (or store) lock and must
/// not call back into the same store.
pub trait BlobStore: Send + Sync {
    /// Store `payload` in a fresh record
    fn allocate(&self, payload: &[u8]) -> Result<RecordId>;

    /// Lend the payload of record `id` to `reader`
    fn read_with(&self, id: RecordId, reader: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()>;

    /// Owned copy of the payload of record `id`
    fn read(&self, id: RecordId) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_with(id, &mut |payload| {
            out.extend_from_slice(payload);
            Ok(())
        })?;
        Ok(out)
    }

    /// Atomically read-modify-write record `id`
    ///
    /// `writer` gets the current payload and returns whether it changed it. A
    /// payload that no longer fits is moved to a new record and the old one is
    /// freed; the returned id is the record's current one.
    fn write_with(
        &self,
        id: RecordId,
        writer: &mut dyn FnMut(&mut Vec<u8>) -> Result<bool>,
    ) -> Result<RecordId>;

    /// Replace the payload of record `id`, relocating if needed
    fn update(&self, id: RecordId, payload: &[u8]) -> Result<RecordId> {
        self.write_with(id, &mut |buf| {
            buf.clear();
            buf.extend_from_slice(payload);
            Ok(true)
        })
    }

    /// Replace the payload only if it fits the current capacity
    fn rewrite_in_place(&self, id: RecordId, payload: &[u8]) -> Result<bool>;

    /// Free record `id`
    ///
    /// Deleting an already-deleted record returns `Ok(false)` or
    /// `Err(RecordAlreadyDeleted)`, depending on configuration.
    fn delete(&self, id: RecordId) -> Result<bool>;

    /// Capacity of a live record
    fn record_capacity(&self, id: RecordId) -> Result<usize>;

    /// Visit every live record in storage order; returns how many were visited
    ///
    /// Not a snapshot: records written or moved during the scan may or may not
    /// be seen.
    fn for_each(&self, visitor: &mut dyn FnMut(RecordId, &[u8]) -> Result<()>) -> Result<usize>;

    /// Raw user header field `index` (`0..USER_HEADER_FIELDS`)
    fn header_field(&self, index: usize) -> Result<i32>;

    fn set_header_field(&self, index: usize, value: i32) -> Result<()>;

    /// Largest payload a single record can hold
    fn max_payload_size(&self) -> usize;

    fn stats(&self) -> StoreStats;

    /// True when there are writes not yet flushed by `force`
    fn is_dirty(&self) -> bool;

    /// Flush everything to stable storage
    fn force(&self) -> Result<()>;

    /// Whether the previous session ended with `close`
    fn was_closed_properly(&self) -> bool;

    /// Flush, mark the header as cleanly closed, and reject further calls
    fn close(&self) -> Result<()>;

    /// Backing file, if any
    fn path(&self) -> Option<&Path>;
}

/// Open the backend named in `config`
pub fn open_store(config: &StoreConfig) -> Result<Box<dyn BlobStore>> {
    let store: Box<dyn BlobStore> = match config.backend {
        Backend::Synchronized => Box::new(FileBlobStore::open(config)?),
        Backend::MemoryMapped => Box::new(MmapBlobStore::open(config)?),
        Backend::InMemory => Box::new(InMemoryBlobStore::new(config)?),
    };
    Ok(store)
}

// =============================================================================
// Helpers shared by the backends
// =============================================================================

fn check_header_index(index: usize) -> Result<()> {
    if index >= layout::USER_HEADER_FIELDS {
        return Err(StoreError::InvalidArgument(format!(
            "header field {} outside [0, {})",
            index,
            layout::USER_HEADER_FIELDS
        )));
    }
    Ok(())
}

/// Outcome of deleting a record that is already gone
fn already_deleted(ignore: bool, id: RecordId) -> Result<bool> {
    if ignore {
        Ok(false)
    } else {
        Err(StoreError::RecordAlreadyDeleted(id))
    }
}
