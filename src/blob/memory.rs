//! In-memory backend
//!
//! Records live in a vector behind a `RwLock`; ids are vector positions plus
//! one. Nothing survives the process, and `was_closed_properly` is always true.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::alloc::SpaceAllocationStrategy;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};

use super::layout::{self, USER_HEADER_FIELDS};
use super::{already_deleted, check_header_index, BlobStore, RecordId, StoreStats, NON_EXISTENT};

/// Heap-only blob store
pub struct InMemoryBlobStore {
    max_payload: usize,
    strategy: Arc<dyn SpaceAllocationStrategy>,
    ignore_already_deleted: bool,
    inner: RwLock<Inner>,
    dirty: AtomicBool,
    closed: AtomicBool,
}

#[derive(Default)]
struct Inner {
    records: Vec<MemRecord>,
    user_fields: [i32; USER_HEADER_FIELDS],
    relocated: u32,
    deleted: u32,
    storage_size: u64,
}

struct MemRecord {
    payload: Vec<u8>,
    capacity: usize,
    deleted: bool,
}

impl Inner {
    fn index(&self, id: RecordId) -> Result<usize> {
        if id == NON_EXISTENT {
            return Err(StoreError::NotFound(id));
        }
        if id < 0 || id as usize > self.records.len() {
            return Err(StoreError::IndexOutOfBounds {
                index: id as i64,
                limit: self.records.len() as i64 + 1,
            });
        }
        Ok(id as usize - 1)
    }

    fn live(&self, id: RecordId) -> Result<&MemRecord> {
        let record = &self.records[self.index(id)?];
        if record.deleted {
            return Err(StoreError::RecordAlreadyDeleted(id));
        }
        Ok(record)
    }

    fn live_mut(&mut self, id: RecordId) -> Result<&mut MemRecord> {
        let index = self.index(id)?;
        let record = &mut self.records[index];
        if record.deleted {
            return Err(StoreError::RecordAlreadyDeleted(id));
        }
        Ok(record)
    }

    fn push(&mut self, payload: Vec<u8>, capacity: usize) -> Result<RecordId> {
        let id = RecordId::try_from(self.records.len() + 1).map_err(|_| {
            StoreError::IndexOutOfBounds {
                index: self.records.len() as i64 + 1,
                limit: RecordId::MAX as i64,
            }
        })?;
        self.storage_size += capacity as u64;
        self.records.push(MemRecord {
            payload,
            capacity,
            deleted: false,
        });
        Ok(id)
    }
}

impl InMemoryBlobStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            max_payload: layout::max_payload(config.page_size),
            strategy: Arc::clone(&config.allocation_strategy),
            ignore_already_deleted: config.ignore_already_deleted_errors,
            inner: RwLock::new(Inner::default()),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

impl BlobStore for InMemoryBlobStore {
    fn allocate(&self, payload: &[u8]) -> Result<RecordId> {
        self.check_open()?;
        let capacity =
            layout::plan_capacity(self.strategy.as_ref(), payload.len(), self.max_payload, false)?;
        let id = self.inner.write().push(payload.to_vec(), capacity as usize)?;
        self.touch();
        Ok(id)
    }

    fn read_with(&self, id: RecordId, reader: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        self.check_open()?;
        let inner = self.inner.read();
        reader(&inner.live(id)?.payload)
    }

    fn write_with(
        &self,
        id: RecordId,
        writer: &mut dyn FnMut(&mut Vec<u8>) -> Result<bool>,
    ) -> Result<RecordId> {
        self.check_open()?;
        let mut inner = self.inner.write();
        let record = inner.live_mut(id)?;
        let capacity = record.capacity;
        let mut payload = record.payload.clone();

        if !writer(&mut payload)? {
            return Ok(id);
        }
        self.touch();

        if payload.len() <= capacity {
            record.payload = payload;
            return Ok(id);
        }

        let new_capacity =
            layout::plan_capacity(self.strategy.as_ref(), payload.len(), self.max_payload, true)?;
        record.deleted = true;
        record.payload = Vec::new();
        inner.relocated += 1;
        inner.push(payload, new_capacity as usize)
    }

    fn rewrite_in_place(&self, id: RecordId, payload: &[u8]) -> Result<bool> {
        self.check_open()?;
        let mut inner = self.inner.write();
        let record = inner.live_mut(id)?;
        if payload.len() > record.capacity {
            return Ok(false);
        }
        record.payload.clear();
        record.payload.extend_from_slice(payload);
        self.touch();
        Ok(true)
    }

    fn delete(&self, id: RecordId) -> Result<bool> {
        self.check_open()?;
        let mut inner = self.inner.write();
        let record = match inner.live_mut(id) {
            Ok(record) => record,
            Err(StoreError::RecordAlreadyDeleted(id)) => {
                return already_deleted(self.ignore_already_deleted, id)
            }
            Err(e) => return Err(e),
        };
        record.deleted = true;
        record.payload = Vec::new();
        inner.deleted += 1;
        self.touch();
        Ok(true)
    }

    fn record_capacity(&self, id: RecordId) -> Result<usize> {
        self.check_open()?;
        Ok(self.inner.read().live(id)?.capacity)
    }

    fn for_each(&self, visitor: &mut dyn FnMut(RecordId, &[u8]) -> Result<()>) -> Result<usize> {
        self.check_open()?;
        let inner = self.inner.read();
        let mut visited = 0;
        for (index, record) in inner.records.iter().enumerate() {
            if record.deleted {
                continue;
            }
            visitor(index as RecordId + 1, &record.payload)?;
            visited += 1;
        }
        Ok(visited)
    }

    fn header_field(&self, index: usize) -> Result<i32> {
        check_header_index(index)?;
        self.check_open()?;
        Ok(self.inner.read().user_fields[index])
    }

    fn set_header_field(&self, index: usize, value: i32) -> Result<()> {
        check_header_index(index)?;
        self.check_open()?;
        self.inner.write().user_fields[index] = value;
        self.touch();
        Ok(())
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            records_allocated: inner.records.len() as u32,
            records_relocated: inner.relocated,
            records_deleted: inner.deleted,
            storage_size: inner.storage_size,
        }
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn force(&self) -> Result<()> {
        self.check_open()?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    fn was_closed_properly(&self) -> bool {
        true
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}
