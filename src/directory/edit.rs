//! Building and editing directory and dedicated payloads

use std::ops::Range;

use bytes::{Buf, BufMut};

use crate::error::{Result, StoreError};

use super::{resize_gap, AttributeEntry, DEDICATED_HEADER_SIZE, DIRECTORY_HEADER_SIZE};

/// What a record payload holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind<'a> {
    /// Attribute directory of `file_id`
    Directory { file_id: i32 },
    /// Out-of-line value of one attribute
    Dedicated {
        file_id: i32,
        attribute_id: i32,
        value: &'a [u8],
    },
    /// Zero-length payload, owned by nobody
    Empty,
}

/// Payload of a directory without entries
pub fn new_directory(file_id: i32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(DIRECTORY_HEADER_SIZE);
    payload.put_i32_le(file_id);
    payload
}

pub fn append_entry(payload: &mut Vec<u8>, entry: &AttributeEntry<'_>) {
    payload.reserve(entry.encoded_len());
    entry.encode_into(payload);
}

/// Overwrite the entry occupying `span` with `entry`
///
/// The gap is resized first, so the entries after `span` keep their bytes.
pub fn replace_entry(
    payload: &mut Vec<u8>,
    span: Range<usize>,
    entry: &AttributeEntry<'_>,
) -> Result<()> {
    if span.start < DIRECTORY_HEADER_SIZE || span.end < span.start {
        return Err(StoreError::IndexOutOfBounds {
            index: span.start as i64,
            limit: payload.len() as i64,
        });
    }
    let len = entry.encoded_len();
    resize_gap(payload, span.start, span.len(), len)?;

    let mut dst = &mut payload[span.start..span.start + len];
    entry.encode_into(&mut dst);
    Ok(())
}

/// Payload of a dedicated record
pub fn encode_dedicated(file_id: i32, attribute_id: i32, value: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(DEDICATED_HEADER_SIZE + value.len());
    payload.put_i32_le(file_id.wrapping_neg());
    payload.put_i32_le(attribute_id);
    payload.put_slice(value);
    payload
}

/// Split a dedicated payload into `(file_id, attribute_id, value)`
pub fn decode_dedicated(payload: &[u8]) -> Result<(i32, i32, &[u8])> {
    if payload.len() < DEDICATED_HEADER_SIZE {
        return Err(StoreError::Corrupted(format!(
            "dedicated record of {} bytes has no header",
            payload.len()
        )));
    }
    let mut header = &payload[..DEDICATED_HEADER_SIZE];
    let marker = header.get_i32_le();
    let attribute_id = header.get_i32_le();
    if marker >= 0 {
        return Err(StoreError::Corrupted(format!(
            "record owned by fileId {} is not a dedicated value",
            marker
        )));
    }
    Ok((
        marker.wrapping_neg(),
        attribute_id,
        &payload[DEDICATED_HEADER_SIZE..],
    ))
}

/// Tell directories and dedicated records apart by the sign of the owner field
pub fn classify(payload: &[u8]) -> Result<RecordKind<'_>> {
    if payload.is_empty() {
        return Ok(RecordKind::Empty);
    }
    if payload.len() < DIRECTORY_HEADER_SIZE {
        return Err(StoreError::Corrupted(format!(
            "record of {} bytes has no owner field",
            payload.len()
        )));
    }
    let owner = (&payload[..DIRECTORY_HEADER_SIZE]).get_i32_le();
    match owner {
        0 => Err(StoreError::Corrupted("record owned by fileId 0".to_string())),
        id if id > 0 => Ok(RecordKind::Directory { file_id: id }),
        _ => {
            let (file_id, attribute_id, value) = decode_dedicated(payload)?;
            Ok(RecordKind::Dedicated {
                file_id,
                attribute_id,
                value,
            })
        }
    }
}
