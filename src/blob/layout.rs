//! On-disk layout shared by the file and mmap backends
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ File Header (64 bytes)                                       │
//! │   Magic (4) | FormatVersion (4) | PageSize (4) | Status (4)  │
//! │   NextRecordOffset (8)                                       │
//! │   Allocated (4) | Relocated (4) | Deleted (4) | CRC32 (4)    │
//! │   UserFields: 6 x i32 (24)                                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Record                                                       │
//! │   State (4) | Capacity (4) | Length (4) | Seq (4)            │
//! │   Payload (Capacity bytes, Length of them meaningful)        │
//! │ ... repeated, 16-byte aligned, never crossing a page ...     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A record id is its byte offset divided by [`RECORD_ALIGNMENT`]. The header
//! occupies the first ids, so id 0 never names a record.

use crate::alloc::SpaceAllocationStrategy;
use crate::error::{Result, StoreError};

use super::{RecordId, NON_EXISTENT};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes identifying a blob store file
pub const MAGIC: u32 = u32::from_le_bytes(*b"ABLB");

/// Current file format version
pub const FORMAT_VERSION: u32 = 1;

/// File header size
pub const FILE_HEADER_SIZE: usize = 64;

/// Record header size: State (4) + Capacity (4) + Length (4) + Seq (4)
pub const RECORD_HEADER_SIZE: usize = 16;

/// Every record starts at a multiple of this, and capacities are multiples of it
pub const RECORD_ALIGNMENT: usize = 16;

/// Number of i32 slots in the user header region
pub const USER_HEADER_FIELDS: usize = 6;

/// Connection status written while the store is open
pub const STATUS_OPENED: u32 = 0x4E45_504F;

/// Connection status written by a clean close
pub const STATUS_CLOSED: u32 = 0x4445_534C;

/// Byte offsets of the file header fields
pub mod offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 4;
    pub const PAGE_SIZE: usize = 8;
    pub const STATUS: usize = 12;
    pub const NEXT_RECORD: usize = 16;
    pub const ALLOCATED: usize = 24;
    pub const RELOCATED: usize = 28;
    pub const DELETED: usize = 32;
    pub const CRC: usize = 36;
    pub const USER_FIELDS: usize = 40;

    pub const RECORD_STATE: usize = 0;
    pub const RECORD_CAPACITY: usize = 4;
    pub const RECORD_LENGTH: usize = 8;
    pub const RECORD_SEQ: usize = 12;
}

// =============================================================================
// Record Header
// =============================================================================

/// Lifecycle of a record slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RecordState {
    /// Never written: marks the end of the record chain
    Uninitialized = 0,
    Live = 1,
    Deleted = 2,
    /// Filler covering the tail of a page
    Padding = 3,
    /// Space claimed by an allocation whose payload is not published yet
    Reserved = 4,
}

impl RecordState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(RecordState::Uninitialized),
            1 => Some(RecordState::Live),
            2 => Some(RecordState::Deleted),
            3 => Some(RecordState::Padding),
            4 => Some(RecordState::Reserved),
            _ => None,
        }
    }
}

/// Decoded record header (the seq word is only meaningful to the mmap backend)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub state: RecordState,
    pub capacity: u32,
    pub length: u32,
}

impl RecordHeader {
    pub fn live(capacity: u32, length: u32) -> Self {
        Self {
            state: RecordState::Live,
            capacity,
            length,
        }
    }

    pub fn padding(capacity: u32) -> Self {
        Self {
            state: RecordState::Padding,
            capacity,
            length: 0,
        }
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&(self.state as u32).to_le_bytes());
        bytes[4..8].copy_from_slice(&self.capacity.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    /// Decode and sanity-check a header read at `offset`
    pub fn decode(bytes: &[u8; RECORD_HEADER_SIZE], offset: u64, page_size: usize) -> Result<Self> {
        let state = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let capacity = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let length = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        validate_record(state, capacity, length, offset, page_size)
    }

    /// Total bytes the record occupies, header included
    pub fn total_size(&self) -> u64 {
        (RECORD_HEADER_SIZE + self.capacity as usize) as u64
    }
}

/// Reject headers that cannot describe a real record at `offset`
pub fn validate_record(
    state: u32,
    capacity: u32,
    length: u32,
    offset: u64,
    page_size: usize,
) -> Result<RecordHeader> {
    let state = RecordState::from_raw(state).ok_or_else(|| {
        StoreError::Corrupted(format!("unknown record state {:#x} at offset {}", state, offset))
    })?;

    if state == RecordState::Uninitialized {
        return Ok(RecordHeader {
            state,
            capacity: 0,
            length: 0,
        });
    }

    if capacity as usize % RECORD_ALIGNMENT != 0 {
        return Err(StoreError::Corrupted(format!(
            "misaligned capacity {} at offset {}",
            capacity, offset
        )));
    }

    let page_end = (offset / page_size as u64 + 1) * page_size as u64;
    if offset + RECORD_HEADER_SIZE as u64 + capacity as u64 > page_end {
        return Err(StoreError::Corrupted(format!(
            "record at offset {} with capacity {} crosses a page boundary",
            offset, capacity
        )));
    }

    if length > capacity {
        return Err(StoreError::Corrupted(format!(
            "record at offset {} has length {} beyond capacity {}",
            offset, length, capacity
        )));
    }

    Ok(RecordHeader {
        state,
        capacity,
        length,
    })
}

// =============================================================================
// Ids, Placement, Capacity
// =============================================================================

pub fn id_to_offset(id: RecordId) -> u64 {
    id as u64 * RECORD_ALIGNMENT as u64
}

pub fn offset_to_id(offset: u64) -> Result<RecordId> {
    let id = offset / RECORD_ALIGNMENT as u64;
    RecordId::try_from(id).map_err(|_| StoreError::IndexOutOfBounds {
        index: id as i64,
        limit: RecordId::MAX as i64,
    })
}

/// Map an id to the offset of its header, checking it lies inside `[header, cursor)`
pub fn check_id(id: RecordId, cursor: u64) -> Result<u64> {
    if id == NON_EXISTENT {
        return Err(StoreError::NotFound(id));
    }
    let limit = (cursor / RECORD_ALIGNMENT as u64) as i64;
    if id < 0 {
        return Err(StoreError::IndexOutOfBounds {
            index: id as i64,
            limit,
        });
    }
    let offset = id_to_offset(id);
    if offset < FILE_HEADER_SIZE as u64 || offset + RECORD_HEADER_SIZE as u64 > cursor {
        return Err(StoreError::IndexOutOfBounds {
            index: id as i64,
            limit,
        });
    }
    Ok(offset)
}

/// Where a new record lands relative to the allocation cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Offset of the new record header
    pub offset: u64,
    /// Padding record to write first: (offset, capacity)
    pub padding: Option<(u64, u32)>,
    /// Cursor value after this allocation
    pub next: u64,
}

/// Place a record of `total_size` bytes at `cursor`, skipping to the next page
/// when the current one cannot hold it
pub fn place(cursor: u64, page_size: usize, total_size: usize) -> Placement {
    let page_size = page_size as u64;
    let total_size = total_size as u64;
    let page_end = (cursor / page_size + 1) * page_size;

    if cursor + total_size <= page_end {
        return Placement {
            offset: cursor,
            padding: None,
            next: cursor + total_size,
        };
    }

    let padding_capacity = (page_end - cursor) as usize - RECORD_HEADER_SIZE;
    Placement {
        offset: page_end,
        padding: Some((cursor, padding_capacity as u32)),
        next: page_end + total_size,
    }
}

/// End of the span a headerless slot at `offset` may cover
///
/// Records never cross a page, so a slot with no header either ends the chain
/// (when `end` falls inside the page) or is the unwritten padding of a page
/// whose next record starts on the following page.
pub fn hole_bound(offset: u64, end: u64, page_size: usize) -> u64 {
    let page_end = (offset / page_size as u64 + 1) * page_size as u64;
    page_end.min(end)
}

pub fn max_payload(page_size: usize) -> usize {
    page_size - RECORD_HEADER_SIZE
}

fn align_up(n: usize) -> usize {
    (n + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

/// Ask the strategy for a capacity and clamp it into `[len, max_payload]`
pub fn plan_capacity(
    strategy: &dyn SpaceAllocationStrategy,
    len: usize,
    max_payload: usize,
    growth: bool,
) -> Result<u32> {
    if len > max_payload {
        return Err(StoreError::RecordTooLarge {
            size: len,
            max: max_payload,
        });
    }
    let wanted = if growth {
        strategy.capacity_on_growth(len)
    } else {
        strategy.capacity_for(len)
    };
    let capacity = align_up(wanted.max(len)).min(max_payload);
    Ok(capacity as u32)
}

// =============================================================================
// File Header
// =============================================================================

/// In-memory copy of the 64-byte file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub page_size: u32,
    pub status: u32,
    pub next_record_offset: u64,
    pub records_allocated: u32,
    pub records_relocated: u32,
    pub records_deleted: u32,
    pub user_fields: [i32; USER_HEADER_FIELDS],
}

impl FileHeader {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size as u32,
            status: STATUS_OPENED,
            next_record_offset: FILE_HEADER_SIZE as u64,
            records_allocated: 0,
            records_relocated: 0,
            records_deleted: 0,
            user_fields: [0; USER_HEADER_FIELDS],
        }
    }

    /// Serialize, including a checksum over every other byte
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut bytes = [0u8; FILE_HEADER_SIZE];
        put_u32(&mut bytes, offsets::MAGIC, MAGIC);
        put_u32(&mut bytes, offsets::FORMAT_VERSION, FORMAT_VERSION);
        put_u32(&mut bytes, offsets::PAGE_SIZE, self.page_size);
        put_u32(&mut bytes, offsets::STATUS, self.status);
        bytes[offsets::NEXT_RECORD..offsets::NEXT_RECORD + 8]
            .copy_from_slice(&self.next_record_offset.to_le_bytes());
        put_u32(&mut bytes, offsets::ALLOCATED, self.records_allocated);
        put_u32(&mut bytes, offsets::RELOCATED, self.records_relocated);
        put_u32(&mut bytes, offsets::DELETED, self.records_deleted);
        for (i, field) in self.user_fields.iter().enumerate() {
            put_u32(&mut bytes, offsets::USER_FIELDS + i * 4, *field as u32);
        }
        let crc = header_checksum(&bytes);
        put_u32(&mut bytes, offsets::CRC, crc);
        bytes
    }

    /// Parse a header; the checksum is only enforced for cleanly closed files
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(StoreError::Corrupted(format!(
                "file header truncated: {} bytes",
                bytes.len()
            )));
        }

        let magic = get_u32(bytes, offsets::MAGIC);
        if magic != MAGIC {
            return Err(StoreError::Corrupted(format!(
                "invalid magic: expected {:#x}, got {:#x}",
                MAGIC, magic
            )));
        }

        let version = get_u32(bytes, offsets::FORMAT_VERSION);
        if version != FORMAT_VERSION {
            return Err(StoreError::Corrupted(format!(
                "unsupported storage format version {}",
                version
            )));
        }

        let status = get_u32(bytes, offsets::STATUS);
        if status == STATUS_CLOSED {
            let stored = get_u32(bytes, offsets::CRC);
            let actual = header_checksum(bytes);
            if stored != actual {
                return Err(StoreError::Corrupted(format!(
                    "header checksum mismatch: stored {:#010x}, computed {:#010x}",
                    stored, actual
                )));
            }
        }

        let mut user_fields = [0i32; USER_HEADER_FIELDS];
        for (i, field) in user_fields.iter_mut().enumerate() {
            *field = get_u32(bytes, offsets::USER_FIELDS + i * 4) as i32;
        }

        let mut next = [0u8; 8];
        next.copy_from_slice(&bytes[offsets::NEXT_RECORD..offsets::NEXT_RECORD + 8]);

        Ok(Self {
            page_size: get_u32(bytes, offsets::PAGE_SIZE),
            status,
            next_record_offset: u64::from_le_bytes(next),
            records_allocated: get_u32(bytes, offsets::ALLOCATED),
            records_relocated: get_u32(bytes, offsets::RELOCATED),
            records_deleted: get_u32(bytes, offsets::DELETED),
            user_fields,
        })
    }
}

/// CRC32 of the header bytes, skipping the CRC field itself
pub fn header_checksum(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..offsets::CRC]);
    hasher.update(&bytes[offsets::CRC + 4..FILE_HEADER_SIZE]);
    hasher.finalize()
}

fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
