//! Memory-mapped backend
//!
//! ## Concurrency
//! - Allocation: CAS loop on the cursor stored in the mapped file header
//! - Records: the header `seq` word is a seqlock. Writers CAS it from even to
//!   odd, write, then publish the next even value. Readers copy the payload and
//!   retry if `seq` was odd or moved in the meantime, so a reader sees a record
//!   either entirely before or entirely after a write.
//! - A new record is invisible until its state word is stored as `Live`.
//!   Right after the cursor moves, the claimed slot is stamped `Reserved` with
//!   its capacity so the chain stays walkable if the writer dies before
//!   publishing.
//! - Waiting on a seqlock never gives up; a seq left odd by a dead process is
//!   released by recovery
//! - Pages: mapped one by one and kept in a `RwLock<Vec<_>>`; the write lock is
//!   only taken to grow the file
//!
//! Writers on different records never wait on each other.

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::utils::Backoff;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::alloc::SpaceAllocationStrategy;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};

use super::layout::{
    self, offsets, FileHeader, RecordState, FILE_HEADER_SIZE, RECORD_ALIGNMENT,
    RECORD_HEADER_SIZE, STATUS_CLOSED, STATUS_OPENED,
};
use super::{already_deleted, check_header_index, BlobStore, RecordId, StoreStats};

/// Sleep between seq checks once spinning and yielding are exhausted
const PARKED_WAIT: Duration = Duration::from_micros(50);

fn wait(backoff: &Backoff) {
    if backoff.is_completed() {
        thread::sleep(PARKED_WAIT);
    } else {
        backoff.snooze();
    }
}

// =============================================================================
// Mapped Page
// =============================================================================

/// One page of the file, mapped read-write
struct MappedPage {
    map: MmapMut,
    base: *mut u8,
    len: usize,
}

// SAFETY: the mapping is only touched through atomics, or through plain copies
// whose consistency is checked against the owning record's seqlock.
unsafe impl Send for MappedPage {}
unsafe impl Sync for MappedPage {}

impl MappedPage {
    fn map(file: &File, index: usize, page_size: usize) -> Result<Self> {
        // SAFETY: the store owns the file and never shrinks it below a mapped page.
        let mut map = unsafe {
            MmapOptions::new()
                .offset((index * page_size) as u64)
                .len(page_size)
                .map_mut(file)?
        };
        let base = map.as_mut_ptr();
        Ok(Self {
            map,
            base,
            len: page_size,
        })
    }

    fn u32_at(&self, at: usize) -> &AtomicU32 {
        assert!(at % 4 == 0 && at + 4 <= self.len);
        // SAFETY: in bounds and aligned (pages are OS-page aligned); the
        // reference cannot outlive the mapping because it borrows `self`.
        unsafe { &*(self.base.add(at) as *const AtomicU32) }
    }

    fn u64_at(&self, at: usize) -> &AtomicU64 {
        assert!(at % 8 == 0 && at + 8 <= self.len);
        // SAFETY: as in `u32_at`
        unsafe { &*(self.base.add(at) as *const AtomicU64) }
    }

    /// # Safety
    /// Caller holds the record's seqlock, or validates the copy against it.
    unsafe fn copy_out(&self, at: usize, dst: &mut [u8]) {
        assert!(at + dst.len() <= self.len);
        ptr::copy_nonoverlapping(self.base.add(at), dst.as_mut_ptr(), dst.len());
    }

    /// # Safety
    /// Caller holds the record's seqlock, or the bytes are not yet published.
    unsafe fn copy_in(&self, at: usize, src: &[u8]) {
        assert!(at + src.len() <= self.len);
        ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(at), src.len());
    }

    fn is_zeroed(&self, at: usize, len: usize) -> bool {
        (at..at + len)
            .step_by(4)
            .all(|word| self.u32_at(word).load(Ordering::Acquire) == 0)
    }

    fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

// =============================================================================
// Record Slot
// =============================================================================

/// View of one record header inside a mapped page
struct Slot {
    page: Arc<MappedPage>,
    at: usize,
}

impl Slot {
    fn state(&self) -> &AtomicU32 {
        self.page.u32_at(self.at + offsets::RECORD_STATE)
    }

    fn capacity(&self) -> &AtomicU32 {
        self.page.u32_at(self.at + offsets::RECORD_CAPACITY)
    }

    fn length(&self) -> &AtomicU32 {
        self.page.u32_at(self.at + offsets::RECORD_LENGTH)
    }

    fn seq(&self) -> &AtomicU32 {
        self.page.u32_at(self.at + offsets::RECORD_SEQ)
    }

    fn payload_at(&self) -> usize {
        self.at + RECORD_HEADER_SIZE
    }

    /// Take the record's write lock (seq goes odd), waiting as long as it takes
    fn lock(&self) -> SlotGuard<'_> {
        let backoff = Backoff::new();
        loop {
            let seq = self.seq().load(Ordering::Relaxed);
            if seq & 1 == 0
                && self
                    .seq()
                    .compare_exchange_weak(seq, seq.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                fence(Ordering::Release);
                return SlotGuard {
                    slot: self,
                    seq: seq.wrapping_add(1),
                };
            }
            wait(&backoff);
        }
    }

    /// Copy the payload of a live record without tearing; returns the state seen
    fn read_consistent(&self, id: RecordId, buf: &mut Vec<u8>) -> Result<RecordState> {
        let backoff = Backoff::new();
        loop {
            let before = self.seq().load(Ordering::Acquire);
            if before & 1 == 0 {
                let state = self.state().load(Ordering::Relaxed);
                let capacity = self.capacity().load(Ordering::Relaxed) as usize;
                let length = (self.length().load(Ordering::Relaxed) as usize).min(capacity);

                buf.clear();
                if state == RecordState::Live as u32 {
                    buf.resize(length, 0);
                    // SAFETY: validated against seq below; capacity never changes
                    // after publication so the copy stays inside the record.
                    unsafe { self.page.copy_out(self.payload_at(), buf) };
                }

                fence(Ordering::Acquire);
                if self.seq().load(Ordering::Relaxed) == before {
                    return RecordState::from_raw(state).ok_or_else(|| {
                        StoreError::Corrupted(format!("record {} has unknown state {:#x}", id, state))
                    });
                }
            }
            wait(&backoff);
        }
    }

    /// Claim a slot of `capacity` bytes before its payload is published
    fn reserve(&self, capacity: u32) {
        self.capacity().store(capacity, Ordering::Relaxed);
        self.length().store(0, Ordering::Relaxed);
        self.state()
            .store(RecordState::Reserved as u32, Ordering::Release);
    }

    fn pad(&self, capacity: u32) {
        self.capacity().store(capacity, Ordering::Relaxed);
        self.length().store(0, Ordering::Relaxed);
        self.state()
            .store(RecordState::Padding as u32, Ordering::Release);
    }

    /// Fill a freshly allocated slot and make it visible
    fn publish(&self, capacity: u32, payload: &[u8]) {
        self.capacity().store(capacity, Ordering::Relaxed);
        self.length().store(payload.len() as u32, Ordering::Relaxed);
        self.seq().store(0, Ordering::Relaxed);
        // SAFETY: nobody can observe the slot before the state store below
        unsafe { self.page.copy_in(self.payload_at(), payload) };
        self.state().store(RecordState::Live as u32, Ordering::Release);
    }

    fn locked_state(&self, id: RecordId) -> Result<()> {
        match RecordState::from_raw(self.state().load(Ordering::Relaxed)) {
            Some(RecordState::Live) => Ok(()),
            Some(RecordState::Deleted) => Err(StoreError::RecordAlreadyDeleted(id)),
            _ => Err(StoreError::NotFound(id)),
        }
    }
}

struct SlotGuard<'a> {
    slot: &'a Slot,
    seq: u32,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot
            .seq()
            .store(self.seq.wrapping_add(1), Ordering::Release);
    }
}

fn expect_live(id: RecordId, state: RecordState) -> Result<()> {
    match state {
        RecordState::Live => Ok(()),
        RecordState::Deleted => Err(StoreError::RecordAlreadyDeleted(id)),
        RecordState::Padding | RecordState::Reserved | RecordState::Uninitialized => {
            Err(StoreError::NotFound(id))
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Blob store over memory-mapped pages
pub struct MmapBlobStore {
    path: PathBuf,
    page_size: usize,
    strategy: Arc<dyn SpaceAllocationStrategy>,
    ignore_already_deleted: bool,
    closed_properly: bool,
    /// Only locked to grow the file
    file: Mutex<File>,
    pages: RwLock<Vec<Arc<MappedPage>>>,
    /// Page 0, which holds the file header
    header: Arc<MappedPage>,
    dirty: AtomicBool,
    closed: AtomicBool,
}

impl MmapBlobStore {
    /// Open or create the store at `config.path`
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let page_size = config.page_size;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.path)?;
        let file_len = file.metadata()?.len();
        let fresh = file_len == 0;

        if !fresh {
            if file_len < FILE_HEADER_SIZE as u64 {
                return Err(StoreError::Corrupted(format!(
                    "file header truncated ({} bytes)",
                    file_len
                )));
            }
            let mut bytes = [0u8; FILE_HEADER_SIZE];
            (&file).read_exact(&mut bytes)?;
            let header = FileHeader::decode(&bytes)?;
            if header.page_size as usize != page_size {
                return Err(StoreError::Config(format!(
                    "store was created with page size {}, opened with {}",
                    header.page_size, page_size
                )));
            }
        }

        let page_count = ((file_len as usize + page_size - 1) / page_size).max(1);
        let mapped_len = (page_count * page_size) as u64;
        if mapped_len != file_len {
            file.set_len(mapped_len)?;
        }

        let pages = (0..page_count)
            .map(|index| MappedPage::map(&file, index, page_size).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let header = Arc::clone(&pages[0]);

        if fresh {
            // SAFETY: not shared with anyone yet
            unsafe { header.copy_in(0, &FileHeader::new(page_size).encode()) };
        }

        let closed_properly =
            fresh || header.u32_at(offsets::STATUS).load(Ordering::Acquire) == STATUS_CLOSED;

        let store = Self {
            path: config.path.clone(),
            page_size,
            strategy: Arc::clone(&config.allocation_strategy),
            ignore_already_deleted: config.ignore_already_deleted_errors,
            closed_properly,
            file: Mutex::new(file),
            pages: RwLock::new(pages),
            header,
            dirty: AtomicBool::new(fresh),
            closed: AtomicBool::new(false),
        };

        if !closed_properly {
            warn!(path = %config.path.display(), "blob store was not closed properly, rescanning records");
            store.recover()?;
        }
        store.status().store(STATUS_OPENED, Ordering::Release);

        info!(
            path = %config.path.display(),
            pages = page_count,
            records = store.counter(offsets::ALLOCATED).load(Ordering::Relaxed),
            "opened mmap blob store"
        );
        Ok(store)
    }

    // =========================================================================
    // Header Fields
    // =========================================================================

    fn cursor(&self) -> &AtomicU64 {
        self.header.u64_at(offsets::NEXT_RECORD)
    }

    fn status(&self) -> &AtomicU32 {
        self.header.u32_at(offsets::STATUS)
    }

    fn counter(&self, at: usize) -> &AtomicU32 {
        self.header.u32_at(at)
    }

    fn user_field(&self, index: usize) -> &AtomicU32 {
        self.header.u32_at(offsets::USER_FIELDS + index * 4)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn max_payload(&self) -> usize {
        layout::max_payload(self.page_size)
    }

    fn slot_at(&self, offset: u64) -> Result<Slot> {
        let index = (offset / self.page_size as u64) as usize;
        let pages = self.pages.read();
        let page = pages.get(index).cloned().ok_or(StoreError::IndexOutOfBounds {
            index: (offset / layout::RECORD_ALIGNMENT as u64) as i64,
            limit: (pages.len() * self.page_size / layout::RECORD_ALIGNMENT) as i64,
        })?;
        Ok(Slot {
            page,
            at: (offset % self.page_size as u64) as usize,
        })
    }

    /// Slot of record `id` after bounds and header sanity checks
    fn locate(&self, id: RecordId) -> Result<Slot> {
        self.check_open()?;
        let offset = layout::check_id(id, self.cursor().load(Ordering::Acquire))?;
        let slot = self.slot_at(offset)?;
        let state = slot.state().load(Ordering::Acquire);
        let capacity = slot.capacity().load(Ordering::Relaxed);
        let header = layout::validate_record(state, capacity, 0, offset, self.page_size)?;
        if header.state == RecordState::Uninitialized {
            return Err(StoreError::NotFound(id));
        }
        Ok(slot)
    }

    /// Map pages until `end` is covered
    fn ensure_mapped(&self, end: u64) -> Result<()> {
        let needed = (end as usize + self.page_size - 1) / self.page_size;
        if self.pages.read().len() >= needed {
            return Ok(());
        }

        let mut pages = self.pages.write();
        if pages.len() >= needed {
            return Ok(());
        }
        let file = self.file.lock();
        file.set_len((needed * self.page_size) as u64)?;
        while pages.len() < needed {
            let page = MappedPage::map(&file, pages.len(), self.page_size)?;
            pages.push(Arc::new(page));
        }
        debug!(pages = needed, "grew mapped storage");
        Ok(())
    }

    /// Reserve space for a record of `capacity` bytes; the slot is not yet live
    fn allocate_slot(&self, capacity: u32) -> Result<(RecordId, Slot)> {
        let total = RECORD_HEADER_SIZE + capacity as usize;
        let cursor = self.cursor();
        let mut current = cursor.load(Ordering::Acquire);
        let placement = loop {
            let placement = layout::place(current, self.page_size, total);
            layout::offset_to_id(placement.offset)?;
            match cursor.compare_exchange_weak(
                current,
                placement.next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break placement,
                Err(actual) => current = actual,
            }
        };

        self.ensure_mapped(placement.next)?;

        if let Some((pad_offset, pad_capacity)) = placement.padding {
            self.slot_at(pad_offset)?.pad(pad_capacity);
        }
        let slot = self.slot_at(placement.offset)?;
        slot.reserve(capacity);

        self.counter(offsets::ALLOCATED).fetch_add(1, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        let id = layout::offset_to_id(placement.offset)?;
        Ok((id, slot))
    }

    /// Rebuild cursor and counters after an unclean shutdown, and release
    /// seqlocks left odd by writers that died mid-write
    ///
    /// The persisted cursor bounds the walk. Slots still `Reserved` were never
    /// published and become deleted. A slot with no header is only skipped when
    /// nothing was written behind it in its page; otherwise the records after it
    /// cannot be reached and the store is reported corrupted.
    fn recover(&self) -> Result<()> {
        let limit = (self.pages.read().len() * self.page_size) as u64;
        let persisted = self.cursor().load(Ordering::Acquire);
        if persisted < FILE_HEADER_SIZE as u64 || persisted % RECORD_ALIGNMENT as u64 != 0 {
            return Err(StoreError::Corrupted(format!(
                "allocation cursor {} is not a record boundary",
                persisted
            )));
        }
        // space claimed past the mapped end never got a header
        let end = persisted.min(limit);

        let mut offset = FILE_HEADER_SIZE as u64;
        let mut live = 0u32;
        let mut deleted = 0u32;
        let mut torn = 0u32;
        let mut abandoned = 0u32;

        while offset < end {
            let slot = self.slot_at(offset)?;
            let header = layout::validate_record(
                slot.state().load(Ordering::Acquire),
                slot.capacity().load(Ordering::Relaxed),
                slot.length().load(Ordering::Relaxed),
                offset,
                self.page_size,
            )?;
            match header.state {
                RecordState::Uninitialized => {
                    let bound = layout::hole_bound(offset, end, self.page_size);
                    if !slot.page.is_zeroed(slot.at, (bound - offset) as usize) {
                        return Err(StoreError::Corrupted(format!(
                            "record chain has a hole at offset {} before cursor {}",
                            offset, persisted
                        )));
                    }
                    if bound == end {
                        break;
                    }
                    slot.pad((bound - offset) as u32 - RECORD_HEADER_SIZE as u32);
                    abandoned += 1;
                    offset = bound;
                    continue;
                }
                RecordState::Live => live += 1,
                RecordState::Deleted => deleted += 1,
                RecordState::Reserved => {
                    slot.state()
                        .store(RecordState::Deleted as u32, Ordering::Release);
                    deleted += 1;
                    abandoned += 1;
                }
                RecordState::Padding => {}
            }
            let seq = slot.seq().load(Ordering::Relaxed);
            if seq & 1 == 1 {
                slot.seq().store(seq.wrapping_add(1), Ordering::Release);
                torn += 1;
            }
            offset += header.total_size();
        }

        if offset > end {
            return Err(StoreError::Corrupted(format!(
                "record chain runs past cursor {} to offset {}",
                end, offset
            )));
        }
        if torn > 0 {
            warn!(torn, "records were mid-write at shutdown");
        }
        if abandoned > 0 {
            warn!(abandoned, "unpublished allocations dropped");
        }
        info!(live, deleted, cursor = offset, "recovered record chain");

        self.cursor().store(offset, Ordering::Release);
        self.counter(offsets::ALLOCATED).store(live + deleted, Ordering::Relaxed);
        self.counter(offsets::RELOCATED).store(0, Ordering::Relaxed);
        self.counter(offsets::DELETED).store(deleted, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn flush_pages(&self) -> Result<()> {
        let pages: Vec<Arc<MappedPage>> = self.pages.read().clone();
        for page in &pages {
            page.flush()?;
        }
        Ok(())
    }
}

impl BlobStore for MmapBlobStore {
    fn allocate(&self, payload: &[u8]) -> Result<RecordId> {
        self.check_open()?;
        let capacity = layout::plan_capacity(
            self.strategy.as_ref(),
            payload.len(),
            self.max_payload(),
            false,
        )?;
        let (id, slot) = self.allocate_slot(capacity)?;
        slot.publish(capacity, payload);
        trace!(id, len = payload.len(), capacity, "allocated record");
        Ok(id)
    }

    fn read_with(&self, id: RecordId, reader: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        let slot = self.locate(id)?;
        let mut payload = Vec::new();
        let state = slot.read_consistent(id, &mut payload)?;
        expect_live(id, state)?;
        reader(&payload)
    }

    fn write_with(
        &self,
        id: RecordId,
        writer: &mut dyn FnMut(&mut Vec<u8>) -> Result<bool>,
    ) -> Result<RecordId> {
        let slot = self.locate(id)?;
        let guard = slot.lock();
        slot.locked_state(id)?;

        let capacity = slot.capacity().load(Ordering::Relaxed);
        let length = slot.length().load(Ordering::Relaxed) as usize;
        let mut payload = vec![0u8; length];
        // SAFETY: record lock held
        unsafe { slot.page.copy_out(slot.payload_at(), &mut payload) };

        if !writer(&mut payload)? {
            return Ok(id);
        }

        if payload.len() <= capacity as usize {
            // SAFETY: record lock held, payload fits the capacity
            unsafe { slot.page.copy_in(slot.payload_at(), &payload) };
            slot.length().store(payload.len() as u32, Ordering::Relaxed);
            self.dirty.store(true, Ordering::Release);
            return Ok(id);
        }

        let new_capacity = layout::plan_capacity(
            self.strategy.as_ref(),
            payload.len(),
            self.max_payload(),
            true,
        )?;
        let (new_id, new_slot) = self.allocate_slot(new_capacity)?;
        new_slot.publish(new_capacity, &payload);
        slot.state().store(RecordState::Deleted as u32, Ordering::Relaxed);
        self.counter(offsets::RELOCATED).fetch_add(1, Ordering::Relaxed);
        drop(guard);

        debug!(from = id, to = new_id, len = payload.len(), "relocated record");
        Ok(new_id)
    }

    fn rewrite_in_place(&self, id: RecordId, payload: &[u8]) -> Result<bool> {
        let slot = self.locate(id)?;
        let _guard = slot.lock();
        slot.locked_state(id)?;

        if payload.len() > slot.capacity().load(Ordering::Relaxed) as usize {
            return Ok(false);
        }
        // SAFETY: record lock held, payload fits the capacity
        unsafe { slot.page.copy_in(slot.payload_at(), payload) };
        slot.length().store(payload.len() as u32, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        Ok(true)
    }

    fn delete(&self, id: RecordId) -> Result<bool> {
        let slot = self.locate(id)?;
        let _guard = slot.lock();
        match slot.locked_state(id) {
            Ok(()) => {}
            Err(StoreError::RecordAlreadyDeleted(id)) => {
                return already_deleted(self.ignore_already_deleted, id)
            }
            Err(e) => return Err(e),
        }
        slot.state().store(RecordState::Deleted as u32, Ordering::Relaxed);
        self.counter(offsets::DELETED).fetch_add(1, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        trace!(id, "deleted record");
        Ok(true)
    }

    fn record_capacity(&self, id: RecordId) -> Result<usize> {
        let slot = self.locate(id)?;
        let mut scratch = Vec::new();
        expect_live(id, slot.read_consistent(id, &mut scratch)?)?;
        Ok(slot.capacity().load(Ordering::Relaxed) as usize)
    }

    fn for_each(&self, visitor: &mut dyn FnMut(RecordId, &[u8]) -> Result<()>) -> Result<usize> {
        self.check_open()?;
        let end = self.cursor().load(Ordering::Acquire);
        let mut offset = FILE_HEADER_SIZE as u64;
        let mut visited = 0;
        let mut payload = Vec::new();

        while offset < end {
            let slot = self.slot_at(offset)?;
            let header = layout::validate_record(
                slot.state().load(Ordering::Acquire),
                slot.capacity().load(Ordering::Relaxed),
                0,
                offset,
                self.page_size,
            )?;
            if header.state == RecordState::Uninitialized {
                break;
            }
            if header.state == RecordState::Live {
                let id = layout::offset_to_id(offset)?;
                if slot.read_consistent(id, &mut payload)? == RecordState::Live {
                    visitor(id, &payload)?;
                    visited += 1;
                }
            }
            offset += header.total_size();
        }
        Ok(visited)
    }

    fn header_field(&self, index: usize) -> Result<i32> {
        check_header_index(index)?;
        self.check_open()?;
        Ok(self.user_field(index).load(Ordering::Acquire) as i32)
    }

    fn set_header_field(&self, index: usize, value: i32) -> Result<()> {
        check_header_index(index)?;
        self.check_open()?;
        self.user_field(index).store(value as u32, Ordering::Release);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload()
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            records_allocated: self.counter(offsets::ALLOCATED).load(Ordering::Relaxed),
            records_relocated: self.counter(offsets::RELOCATED).load(Ordering::Relaxed),
            records_deleted: self.counter(offsets::DELETED).load(Ordering::Relaxed),
            storage_size: self.cursor().load(Ordering::Acquire) - FILE_HEADER_SIZE as u64,
        }
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn force(&self) -> Result<()> {
        self.check_open()?;
        self.dirty.store(false, Ordering::Release);
        self.flush_pages()
    }

    fn was_closed_properly(&self) -> bool {
        self.closed_properly
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.status().store(STATUS_CLOSED, Ordering::Release);

        let mut bytes = [0u8; FILE_HEADER_SIZE];
        // SAFETY: the store is closed, no writer touches the header any more
        unsafe { self.header.copy_out(0, &mut bytes) };
        let crc = layout::header_checksum(&bytes);
        self.header.u32_at(offsets::CRC).store(crc, Ordering::Release);

        self.flush_pages()?;
        self.dirty.store(false, Ordering::Release);
        info!(path = %self.path.display(), "closed mmap blob store");
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
