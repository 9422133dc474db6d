//! Synchronized file backend
//!
//! Positioned reads and writes on a plain file. One mutex guards the file
//! handle and the in-memory copy of the header, so every operation runs alone.
//! The header reaches disk on `force` and `close`, except for the allocation
//! cursor which is written after every append. After a crash the record chain
//! is walked to rebuild the cursor and counters.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::alloc::SpaceAllocationStrategy;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};

use super::layout::{
    self, offsets, FileHeader, RecordHeader, RecordState, FILE_HEADER_SIZE, RECORD_HEADER_SIZE,
    STATUS_CLOSED, STATUS_OPENED,
};
use super::{already_deleted, check_header_index, BlobStore, RecordId, StoreStats};

/// Blob store over a file, serialized by a single lock
pub struct FileBlobStore {
    path: PathBuf,
    page_size: usize,
    strategy: Arc<dyn SpaceAllocationStrategy>,
    ignore_already_deleted: bool,
    closed_properly: bool,
    inner: Mutex<Inner>,
}

/// State only touched with the lock held
struct Inner {
    file: File,
    header: FileHeader,
    dirty: bool,
    closed: bool,
}

impl FileBlobStore {
    /// Open or create the store at `config.path`
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.path)?;
        let file_len = file.metadata()?.len();

        let (header, closed_properly) = if file_len == 0 {
            (FileHeader::new(config.page_size), true)
        } else {
            let mut bytes = [0u8; FILE_HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut bytes).map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => {
                    StoreError::Corrupted(format!("file header truncated ({} bytes)", file_len))
                }
                _ => StoreError::Io(e),
            })?;
            let header = FileHeader::decode(&bytes)?;
            if header.page_size as usize != config.page_size {
                return Err(StoreError::Config(format!(
                    "store was created with page size {}, opened with {}",
                    header.page_size, config.page_size
                )));
            }
            let clean = header.status == STATUS_CLOSED;
            (header, clean)
        };

        let mut inner = Inner {
            file,
            header,
            dirty: false,
            closed: false,
        };

        if !closed_properly {
            warn!(path = %config.path.display(), "blob store was not closed properly, rescanning records");
            inner.recover(config.page_size)?;
        }

        inner.header.status = STATUS_OPENED;
        inner.write_header()?;
        inner.dirty = false;

        info!(
            path = %config.path.display(),
            records = inner.header.records_allocated,
            "opened file blob store"
        );

        Ok(Self {
            path: config.path.clone(),
            page_size: config.page_size,
            strategy: Arc::clone(&config.allocation_strategy),
            ignore_already_deleted: config.ignore_already_deleted_errors,
            closed_properly,
            inner: Mutex::new(inner),
        })
    }

    fn lock_open(&self) -> Result<parking_lot::MutexGuard<'_, Inner>> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner)
    }

    fn max_payload(&self) -> usize {
        layout::max_payload(self.page_size)
    }
}

impl Inner {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        self.dirty = true;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let bytes = self.header.encode();
        self.write_at(0, &bytes)
    }

    fn record_header(&mut self, offset: u64, page_size: usize) -> Result<RecordHeader> {
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        self.read_at(offset, &mut bytes)?;
        RecordHeader::decode(&bytes, offset, page_size)
    }

    /// Header of live record `id`, or the error describing why it is not live
    fn locate(&mut self, id: RecordId, page_size: usize) -> Result<(u64, RecordHeader)> {
        let offset = layout::check_id(id, self.header.next_record_offset)?;
        let header = self.record_header(offset, page_size)?;
        match header.state {
            RecordState::Live => Ok((offset, header)),
            RecordState::Deleted => Err(StoreError::RecordAlreadyDeleted(id)),
            RecordState::Padding | RecordState::Reserved | RecordState::Uninitialized => {
                Err(StoreError::NotFound(id))
            }
        }
    }

    fn read_payload(&mut self, offset: u64, length: u32) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; length as usize];
        self.read_at(offset + RECORD_HEADER_SIZE as u64, &mut payload)?;
        Ok(payload)
    }

    fn write_record(&mut self, offset: u64, capacity: u32, payload: &[u8]) -> Result<()> {
        let header = RecordHeader::live(capacity, payload.len() as u32);
        let mut bytes = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&header.encode());
        bytes.extend_from_slice(payload);
        self.write_at(offset, &bytes)
    }

    fn set_state(&mut self, offset: u64, state: RecordState) -> Result<()> {
        self.write_at(offset, &(state as u32).to_le_bytes())
    }

    /// Append a new live record at the cursor
    fn append(&mut self, payload: &[u8], capacity: u32, page_size: usize) -> Result<RecordId> {
        let placement = layout::place(
            self.header.next_record_offset,
            page_size,
            RECORD_HEADER_SIZE + capacity as usize,
        );
        let id = layout::offset_to_id(placement.offset)?;

        if let Some((pad_offset, pad_capacity)) = placement.padding {
            let padding = RecordHeader::padding(pad_capacity);
            self.write_at(pad_offset, &padding.encode())?;
        }
        self.write_record(placement.offset, capacity, payload)?;
        self.write_at(offsets::NEXT_RECORD as u64, &placement.next.to_le_bytes())?;

        self.header.next_record_offset = placement.next;
        self.header.records_allocated += 1;
        trace!(id, len = payload.len(), capacity, "allocated record");
        Ok(id)
    }

    fn is_zeroed(&mut self, offset: u64, len: usize) -> Result<bool> {
        let mut bytes = vec![0u8; len];
        self.read_at(offset, &mut bytes)?;
        Ok(bytes.iter().all(|b| *b == 0))
    }

    /// Rebuild cursor and counters by walking the record chain
    ///
    /// Same rules as the mmap backend: unpublished `Reserved` slots become
    /// deleted, and a headerless slot is skipped only if the rest of its page
    /// is empty.
    fn recover(&mut self, page_size: usize) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        let end = file_len - file_len % layout::RECORD_ALIGNMENT as u64;
        let mut offset = FILE_HEADER_SIZE as u64;
        let mut live = 0u32;
        let mut deleted = 0u32;

        while offset + RECORD_HEADER_SIZE as u64 <= end {
            let header = self.record_header(offset, page_size)?;
            match header.state {
                RecordState::Uninitialized => {
                    let bound = layout::hole_bound(offset, end, page_size);
                    if !self.is_zeroed(offset, (bound - offset) as usize)? {
                        return Err(StoreError::Corrupted(format!(
                            "record chain has a hole at offset {}",
                            offset
                        )));
                    }
                    if bound == end {
                        break;
                    }
                    let capacity = (bound - offset) as u32 - RECORD_HEADER_SIZE as u32;
                    let padding = RecordHeader::padding(capacity);
                    self.write_at(offset, &padding.encode())?;
                    offset = bound;
                    continue;
                }
                RecordState::Live => live += 1,
                RecordState::Deleted => deleted += 1,
                RecordState::Reserved => {
                    self.set_state(offset, RecordState::Deleted)?;
                    deleted += 1;
                }
                RecordState::Padding => {}
            }
            offset += header.total_size();
        }

        info!(live, deleted, cursor = offset, "recovered record chain");
        self.header.next_record_offset = offset;
        self.header.records_allocated = live + deleted;
        self.header.records_relocated = 0;
        self.header.records_deleted = deleted;
        self.dirty = true;
        Ok(())
    }
}

impl BlobStore for FileBlobStore {
    fn allocate(&self, payload: &[u8]) -> Result<RecordId> {
        let capacity = layout::plan_capacity(
            self.strategy.as_ref(),
            payload.len(),
            self.max_payload(),
            false,
        )?;
        let mut inner = self.lock_open()?;
        inner.append(payload, capacity, self.page_size)
    }

    fn read_with(&self, id: RecordId, reader: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        let mut inner = self.lock_open()?;
        let (offset, header) = inner.locate(id, self.page_size)?;
        let payload = inner.read_payload(offset, header.length)?;
        reader(&payload)
    }

    fn write_with(
        &self,
        id: RecordId,
        writer: &mut dyn FnMut(&mut Vec<u8>) -> Result<bool>,
    ) -> Result<RecordId> {
        let mut inner = self.lock_open()?;
        let (offset, header) = inner.locate(id, self.page_size)?;
        let mut payload = inner.read_payload(offset, header.length)?;

        if !writer(&mut payload)? {
            return Ok(id);
        }

        if payload.len() <= header.capacity as usize {
            inner.write_record(offset, header.capacity, &payload)?;
            return Ok(id);
        }

        let capacity = layout::plan_capacity(
            self.strategy.as_ref(),
            payload.len(),
            self.max_payload(),
            true,
        )?;
        let new_id = inner.append(&payload, capacity, self.page_size)?;
        inner.set_state(offset, RecordState::Deleted)?;
        inner.header.records_relocated += 1;
        debug!(from = id, to = new_id, len = payload.len(), "relocated record");
        Ok(new_id)
    }

    fn rewrite_in_place(&self, id: RecordId, payload: &[u8]) -> Result<bool> {
        let mut inner = self.lock_open()?;
        let (offset, header) = inner.locate(id, self.page_size)?;
        if payload.len() > header.capacity as usize {
            return Ok(false);
        }
        inner.write_record(offset, header.capacity, payload)?;
        Ok(true)
    }

    fn delete(&self, id: RecordId) -> Result<bool> {
        let mut inner = self.lock_open()?;
        let offset = match inner.locate(id, self.page_size) {
            Ok((offset, _)) => offset,
            Err(StoreError::RecordAlreadyDeleted(id)) => {
                return already_deleted(self.ignore_already_deleted, id)
            }
            Err(e) => return Err(e),
        };
        inner.set_state(offset, RecordState::Deleted)?;
        inner.header.records_deleted += 1;
        trace!(id, "deleted record");
        Ok(true)
    }

    fn record_capacity(&self, id: RecordId) -> Result<usize> {
        let mut inner = self.lock_open()?;
        let (_, header) = inner.locate(id, self.page_size)?;
        Ok(header.capacity as usize)
    }

    fn for_each(&self, visitor: &mut dyn FnMut(RecordId, &[u8]) -> Result<()>) -> Result<usize> {
        let mut inner = self.lock_open()?;
        let end = inner.header.next_record_offset;
        let mut offset = FILE_HEADER_SIZE as u64;
        let mut visited = 0;

        while offset < end {
            let header = inner.record_header(offset, self.page_size)?;
            match header.state {
                RecordState::Uninitialized => break,
                RecordState::Live => {
                    let payload = inner.read_payload(offset, header.length)?;
                    visitor(layout::offset_to_id(offset)?, &payload)?;
                    visited += 1;
                }
                RecordState::Deleted | RecordState::Padding | RecordState::Reserved => {}
            }
            offset += header.total_size();
        }
        Ok(visited)
    }

    fn header_field(&self, index: usize) -> Result<i32> {
        check_header_index(index)?;
        let inner = self.lock_open()?;
        Ok(inner.header.user_fields[index])
    }

    fn set_header_field(&self, index: usize, value: i32) -> Result<()> {
        check_header_index(index)?;
        let mut inner = self.lock_open()?;
        inner.header.user_fields[index] = value;
        inner.dirty = true;
        Ok(())
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload()
    }

    fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            records_allocated: inner.header.records_allocated,
            records_relocated: inner.header.records_relocated,
            records_deleted: inner.header.records_deleted,
            storage_size: inner.header.next_record_offset - FILE_HEADER_SIZE as u64,
        }
    }

    fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    fn force(&self) -> Result<()> {
        let mut inner = self.lock_open()?;
        inner.write_header()?;
        inner.file.sync_data()?;
        inner.dirty = false;
        Ok(())
    }

    fn was_closed_properly(&self) -> bool {
        self.closed_properly
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.header.status = STATUS_CLOSED;
        inner.write_header()?;
        inner.file.sync_all()?;
        inner.dirty = false;
        inner.closed = true;
        info!(path = %self.path.display(), "closed file blob store");
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
