//! Directory iteration
//!
//! A cursor walks the entries of one directory payload in storage order. The
//! entry under the cursor is decoded eagerly, so a malformed entry surfaces as
//! an error from `new` or `advance` rather than from `current_entry`.

use std::ops::Range;

use bytes::Buf;

use crate::error::{Result, StoreError};

use super::{AttributeEntry, DIRECTORY_HEADER_SIZE, INLINE_ENTRY_HEADER_SIZE, REF_ENTRY_SIZE};
use super::{TAG_INLINE, TAG_REF};

/// Entry together with its byte offset in the directory payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatedEntry<'a> {
    pub offset: usize,
    pub entry: AttributeEntry<'a>,
}

impl<'a> LocatedEntry<'a> {
    /// Bytes the entry occupies
    pub fn span(&self) -> Range<usize> {
        self.offset..self.offset + self.entry.encoded_len()
    }
}

/// Forward cursor over a directory payload
#[derive(Debug, Clone)]
pub struct DirectoryCursor<'a> {
    payload: &'a [u8],
    file_id: i32,
    current: Option<LocatedEntry<'a>>,
}

impl<'a> DirectoryCursor<'a> {
    /// Position a cursor on the first entry of `payload`
    ///
    /// An empty payload and a dedicated record (non-positive fileId) give a
    /// cursor without a directory.
    pub fn new(payload: &'a [u8]) -> Result<Self> {
        let mut cursor = Self {
            payload,
            file_id: 0,
            current: None,
        };
        if payload.is_empty() {
            return Ok(cursor);
        }
        if payload.len() < DIRECTORY_HEADER_SIZE {
            return Err(StoreError::Corrupted(format!(
                "record of {} bytes is too short for a directory header",
                payload.len()
            )));
        }

        cursor.file_id = (&payload[..DIRECTORY_HEADER_SIZE]).get_i32_le();
        if cursor.has_directory() {
            cursor.current = decode_at(payload, DIRECTORY_HEADER_SIZE)?;
        }
        Ok(cursor)
    }

    pub fn has_directory(&self) -> bool {
        self.file_id > 0
    }

    /// Owning fileId, 0 when there is no directory
    pub fn file_id(&self) -> i32 {
        if self.has_directory() {
            self.file_id
        } else {
            0
        }
    }

    pub fn current_entry(&self) -> Option<&LocatedEntry<'a>> {
        self.current.as_ref()
    }

    /// False once the cursor has moved past the last entry
    pub fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    /// Move to the next entry
    pub fn advance(&mut self) -> Result<()> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };
        self.current = decode_at(self.payload, current.span().end)?;
        Ok(())
    }

    /// Consume the cursor as an iterator of entries
    pub fn entries(self) -> Entries<'a> {
        Entries {
            cursor: self,
            pending: None,
        }
    }
}

impl<'a> IntoIterator for DirectoryCursor<'a> {
    type Item = Result<LocatedEntry<'a>>;
    type IntoIter = Entries<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries()
    }
}

/// Iterator adapter over a [`DirectoryCursor`]
///
/// A decoding error is yielded once, after the last good entry, and ends the
/// iteration.
pub struct Entries<'a> {
    cursor: DirectoryCursor<'a>,
    pending: Option<StoreError>,
}

impl<'a> Iterator for Entries<'a> {
    type Item = Result<LocatedEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending.take() {
            return Some(Err(err));
        }
        let current = *self.cursor.current_entry()?;
        if let Err(err) = self.cursor.advance() {
            self.pending = Some(err);
        }
        Some(Ok(current))
    }
}

/// Locate the entry for `attribute_id` in a directory payload
pub fn find_entry(payload: &[u8], attribute_id: i32) -> Result<Option<LocatedEntry<'_>>> {
    let cursor = DirectoryCursor::new(payload)?;
    if !cursor.has_directory() {
        return Err(StoreError::Corrupted(
            "record is not an attribute directory".to_string(),
        ));
    }
    for located in cursor {
        let located = located?;
        if located.entry.attribute_id() == attribute_id {
            return Ok(Some(located));
        }
    }
    Ok(None)
}

/// Decode the entry starting at `offset`, `None` at the end of the payload
fn decode_at(payload: &[u8], offset: usize) -> Result<Option<LocatedEntry<'_>>> {
    if offset == payload.len() {
        return Ok(None);
    }
    let mut buf = &payload[offset..];

    let entry = match buf.get_u8() {
        TAG_INLINE => {
            if payload.len() < offset + INLINE_ENTRY_HEADER_SIZE {
                return Err(truncated(offset, "inline entry header"));
            }
            let attribute_id = buf.get_i32_le();
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return Err(truncated(offset, "inline value"));
            }
            let start = offset + INLINE_ENTRY_HEADER_SIZE;
            AttributeEntry::Inline {
                attribute_id,
                value: &payload[start..start + len],
            }
        }
        TAG_REF => {
            if payload.len() < offset + REF_ENTRY_SIZE {
                return Err(truncated(offset, "ref entry"));
            }
            AttributeEntry::Ref {
                attribute_id: buf.get_i32_le(),
                record_id: buf.get_i32_le(),
            }
        }
        tag => {
            return Err(StoreError::Corrupted(format!(
                "unknown entry tag 0x{:02x} at offset {}",
                tag, offset
            )))
        }
    };

    Ok(Some(LocatedEntry { offset, entry }))
}

fn truncated(offset: usize, what: &str) -> StoreError {
    StoreError::Corrupted(format!("truncated {} at offset {}", what, offset))
}
