//! In-place gap resizing
//!
//! Grows or shrinks a span inside a buffer while keeping the bytes on both
//! sides of it. This is how a directory entry changes size without the rest of
//! the directory being re-encoded.

use crate::error::{Result, StoreError};

/// Resize the gap `[offset, offset + old_gap)` of `buf` to `new_gap` bytes
///
/// Bytes before `offset` stay where they are. Bytes after the old gap move so
/// that they start at `offset + new_gap`, and `buf.len()` changes by
/// `new_gap - old_gap`. The contents of the resized gap are unspecified and
/// meant to be overwritten by the caller.
pub fn resize_gap(buf: &mut Vec<u8>, offset: usize, old_gap: usize, new_gap: usize) -> Result<()> {
    let len = buf.len();
    if offset > len {
        return Err(StoreError::IndexOutOfBounds {
            index: offset as i64,
            limit: len as i64,
        });
    }
    let tail = offset
        .checked_add(old_gap)
        .filter(|&end| end <= len)
        .ok_or_else(|| StoreError::IndexOutOfBounds {
            index: (offset as i64).saturating_add(old_gap as i64),
            limit: len as i64,
        })?;

    if new_gap > old_gap {
        buf.resize(len + (new_gap - old_gap), 0);
        buf.copy_within(tail..len, offset + new_gap);
    } else if new_gap < old_gap {
        buf.copy_within(tail..len, offset + new_gap);
        buf.truncate(len - (old_gap - new_gap));
    }
    Ok(())
}
