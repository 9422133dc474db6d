//! Attribute Directory Codec
//!
//! Binary format of the records the attributes layer keeps in the blob store.
//!
//! ## Directory Record
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬─────
//! │ fileId (4)   │   entry 0    │   entry 1    │ ...
//! └──────────────┴──────────────┴──────────────┴─────
//! ```
//!
//! ### Entries
//! - Inline: tag `0x01` (1) + attributeId (4) + length (1) + value
//! - Ref:    tag `0x02` (1) + attributeId (4) + dedicated record id (4)
//!
//! ## Dedicated Record
//! ```text
//! ┌──────────────┬──────────────────┬──────────────────────┐
//! │ -fileId (4)  │ attributeId (4)  │        value         │
//! └──────────────┴──────────────────┴──────────────────────┘
//! ```
//! The negated fileId tells a dedicated record apart from a directory when the
//! record space is scanned without an index.
//!
//! All integers are little endian.

mod cursor;
mod edit;
mod gap;

use bytes::BufMut;

use crate::blob::RecordId;

pub use cursor::{find_entry, DirectoryCursor, Entries, LocatedEntry};
pub use edit::{
    append_entry, classify, decode_dedicated, encode_dedicated, new_directory, replace_entry,
    RecordKind,
};
pub use gap::resize_gap;

/// Values shorter than this are kept inside the directory record
pub const INLINE_ATTRIBUTE_SMALLER_THAN: usize = 64;

/// Tag byte of an inline entry
pub const TAG_INLINE: u8 = 0x01;

/// Tag byte of a ref entry
pub const TAG_REF: u8 = 0x02;

/// Size of the fileId that opens every directory
pub const DIRECTORY_HEADER_SIZE: usize = 4;

/// Tag + attributeId + length byte
pub const INLINE_ENTRY_HEADER_SIZE: usize = 1 + 4 + 1;

/// Tag + attributeId + record id
pub const REF_ENTRY_SIZE: usize = 1 + 4 + 4;

/// -fileId + attributeId in front of a dedicated value
pub const DEDICATED_HEADER_SIZE: usize = 4 + 4;

/// Whether a value of `len` bytes is stored inline
pub fn is_inline(len: usize) -> bool {
    len < INLINE_ATTRIBUTE_SMALLER_THAN
}

/// One entry of a directory record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeEntry<'a> {
    /// Value embedded in the directory
    Inline { attribute_id: i32, value: &'a [u8] },
    /// Value kept in a dedicated record
    Ref { attribute_id: i32, record_id: RecordId },
}

impl<'a> AttributeEntry<'a> {
    pub fn attribute_id(&self) -> i32 {
        match self {
            AttributeEntry::Inline { attribute_id, .. } => *attribute_id,
            AttributeEntry::Ref { attribute_id, .. } => *attribute_id,
        }
    }

    /// Dedicated record id of a ref entry
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            AttributeEntry::Inline { .. } => None,
            AttributeEntry::Ref { record_id, .. } => Some(*record_id),
        }
    }

    /// Bytes this entry occupies in a directory
    pub fn encoded_len(&self) -> usize {
        match self {
            AttributeEntry::Inline { value, .. } => INLINE_ENTRY_HEADER_SIZE + value.len(),
            AttributeEntry::Ref { .. } => REF_ENTRY_SIZE,
        }
    }

    /// Write the entry to `buf`
    ///
    /// Inline values must be shorter than [`INLINE_ATTRIBUTE_SMALLER_THAN`];
    /// callers classify with [`is_inline`] first.
    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        match self {
            AttributeEntry::Inline {
                attribute_id,
                value,
            } => {
                debug_assert!(is_inline(value.len()));
                buf.put_u8(TAG_INLINE);
                buf.put_i32_le(*attribute_id);
                buf.put_u8(value.len() as u8);
                buf.put_slice(value);
            }
            AttributeEntry::Ref {
                attribute_id,
                record_id,
            } => {
                buf.put_u8(TAG_REF);
                buf.put_i32_le(*attribute_id);
                buf.put_i32_le(*record_id);
            }
        }
    }
}
