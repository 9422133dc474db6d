//! Attributes Storage
//!
//! CRUD over `(fileId, attributeId) -> bytes` on top of a [`BlobStore`].
//!
//! ## Responsibilities
//! - Keep one directory record per fileId that has attributes
//! - Store small values inline, large ones in dedicated records
//! - Move a value between the two forms when it crosses the threshold
//! - Expose the store header as version and creation tag
//!
//! ## Relocation
//! There is no fileId index here. Every call takes the directory id the caller
//! knows about, and every mutating call returns the id the directory has
//! afterwards. A directory that outgrows its record moves, and the old id
//! stops resolving; the caller must keep the new one.
//!
//! ## Ordering
//! A new dedicated record is written before the directory points at it, and a
//! replaced one is freed only after the directory stops pointing at it. Closures
//! handed to the blob store never call back into it.

use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::blob::{self, BlobStore, RecordId, StoreStats, NON_EXISTENT};
use crate::config::StoreConfig;
use crate::directory::{
    append_entry, classify, decode_dedicated, encode_dedicated, find_entry, is_inline,
    new_directory, replace_entry, resize_gap, AttributeEntry, DirectoryCursor, RecordKind,
};
use crate::error::{Result, StoreError};

/// Header field holding the caller's format version
const VERSION_FIELD: usize = 0;

/// Header fields holding the low and high halves of the creation tag
const TAG_LOW_FIELD: usize = 1;
const TAG_HIGH_FIELD: usize = 2;

/// Reads retried when a dedicated value moves underneath them
const MAX_READ_ATTEMPTS: usize = 8;

/// Where a lookup in a directory ended
enum Lookup {
    Absent,
    Read,
    Dedicated(RecordId),
}

/// Attribute storage over one blob store
pub struct AttributesStorage {
    store: Box<dyn BlobStore>,
    /// The creation tag spans two header fields; both halves move together
    tag_lock: Mutex<()>,
}

impl AttributesStorage {
    /// Open the backend described by `config`
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let store = blob::open_store(config)?;
        info!(
            path = %config.path.display(),
            backend = ?config.backend,
            "opened attributes storage"
        );
        Ok(Self::with_store(store))
    }

    /// Wrap an already opened blob store
    pub fn with_store(store: Box<dyn BlobStore>) -> Self {
        Self {
            store,
            tag_lock: Mutex::new(()),
        }
    }

    /// Underlying blob store
    pub fn store(&self) -> &dyn BlobStore {
        self.store.as_ref()
    }

    // =========================================================================
    // Attribute Operations
    // =========================================================================

    /// Insert or replace the value of `attribute_id` for `file_id`
    ///
    /// `directory_id` is the directory the caller last got back for this file,
    /// or [`NON_EXISTENT`] if it has none. Returns the directory's id after the
    /// write, which may differ from the one passed in.
    pub fn update_attribute(
        &self,
        directory_id: RecordId,
        file_id: i32,
        attribute_id: i32,
        value: &[u8],
    ) -> Result<RecordId> {
        check_ids(file_id, attribute_id)?;

        if directory_id == NON_EXISTENT {
            return self.create_directory(file_id, attribute_id, value);
        }
        if is_inline(value.len()) {
            self.put_inline(directory_id, file_id, attribute_id, value)
        } else {
            self.put_dedicated(directory_id, file_id, attribute_id, value)
        }
    }

    /// Whether `file_id` has a value for `attribute_id`
    ///
    /// False for [`NON_EXISTENT`], a deleted directory, or a directory that
    /// belongs to another file.
    pub fn has_attribute(
        &self,
        directory_id: RecordId,
        file_id: i32,
        attribute_id: i32,
    ) -> Result<bool> {
        check_ids(file_id, attribute_id)?;
        if directory_id == NON_EXISTENT {
            return Ok(false);
        }

        let mut found = false;
        let result = self.store.read_with(directory_id, &mut |payload| {
            let cursor = DirectoryCursor::new(payload)?;
            if cursor.file_id() != file_id {
                return Ok(());
            }
            found = find_entry(payload, attribute_id)?.is_some();
            Ok(())
        });

        match result {
            Ok(()) => Ok(found),
            Err(e) if e.is_already_deleted() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Owned copy of a value, `None` if the attribute is not set
    pub fn read_attribute_value(
        &self,
        directory_id: RecordId,
        file_id: i32,
        attribute_id: i32,
    ) -> Result<Option<Vec<u8>>> {
        self.read_attribute_raw(directory_id, file_id, attribute_id, |value| value.to_vec())
    }

    /// Hand a value to `reader` without copying it at this layer
    ///
    /// `reader` runs while the record is locked by the backend, so it must not
    /// call back into this storage.
    pub fn read_attribute_raw<R>(
        &self,
        directory_id: RecordId,
        file_id: i32,
        attribute_id: i32,
        reader: impl FnOnce(&[u8]) -> R,
    ) -> Result<Option<R>> {
        check_ids(file_id, attribute_id)?;
        if directory_id == NON_EXISTENT {
            return Ok(None);
        }

        let mut reader = Some(reader);
        let mut out = None;
        let mut last_error = None;

        for _ in 0..MAX_READ_ATTEMPTS {
            let mut lookup = Lookup::Absent;
            self.store.read_with(directory_id, &mut |payload| {
                check_owner(directory_id, payload, file_id)?;
                lookup = match find_entry(payload, attribute_id)?.map(|l| l.entry) {
                    None => Lookup::Absent,
                    Some(AttributeEntry::Inline { value, .. }) => {
                        out = reader.take().map(|f| f(value));
                        Lookup::Read
                    }
                    Some(AttributeEntry::Ref { record_id, .. }) => Lookup::Dedicated(record_id),
                };
                Ok(())
            })?;

            let record_id = match lookup {
                Lookup::Absent => return Ok(None),
                Lookup::Read => return Ok(out),
                Lookup::Dedicated(record_id) => record_id,
            };

            let result = self.store.read_with(record_id, &mut |payload| {
                let value = dedicated_value(record_id, payload, file_id, attribute_id)?;
                out = reader.take().map(|f| f(value));
                Ok(())
            });
            match result {
                Ok(()) => return Ok(out),
                // a concurrent writer moved the value, look it up again
                Err(e) if e.is_already_deleted() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            StoreError::Corrupted(format!(
                "attribute {} of file {} could not be read",
                attribute_id, file_id
            ))
        }))
    }

    /// Remove every attribute of `file_id` along with its directory
    ///
    /// Returns `false` for [`NON_EXISTENT`]. A directory that is already gone
    /// gives `Ok(false)` or `Err(RecordAlreadyDeleted)` depending on the
    /// store's `ignore_already_deleted_errors`.
    pub fn delete_attributes(&self, directory_id: RecordId, file_id: i32) -> Result<bool> {
        check_ids(file_id, 0)?;
        if directory_id == NON_EXISTENT {
            return Ok(false);
        }

        let mut dedicated = Vec::new();
        let result = self.store.read_with(directory_id, &mut |payload| {
            check_owner(directory_id, payload, file_id)?;
            dedicated.clear();
            for located in DirectoryCursor::new(payload)? {
                if let Some(record_id) = located?.entry.record_id() {
                    dedicated.push(record_id);
                }
            }
            Ok(())
        });
        match result {
            Ok(()) => {}
            // let the store apply its configured answer to a repeated delete
            Err(e) if e.is_already_deleted() => return self.store.delete(directory_id),
            Err(e) => return Err(e),
        }

        for record_id in &dedicated {
            self.free_dedicated(*record_id)?;
        }
        let deleted = self.store.delete(directory_id)?;
        debug!(
            directory_id,
            file_id,
            dedicated = dedicated.len(),
            "deleted attributes"
        );
        Ok(deleted)
    }

    /// Remove one attribute of `file_id`; returns whether it was set
    ///
    /// The directory only shrinks, so it keeps its id. An emptied directory
    /// stays allocated until [`delete_attributes`](Self::delete_attributes).
    pub fn delete_attribute(
        &self,
        directory_id: RecordId,
        file_id: i32,
        attribute_id: i32,
    ) -> Result<bool> {
        check_ids(file_id, attribute_id)?;
        if directory_id == NON_EXISTENT {
            return Ok(false);
        }

        let mut removed = None;
        let new_id = self.store.write_with(directory_id, &mut |payload| {
            removed = None;
            check_owner(directory_id, payload, file_id)?;
            let Some((span, record_id)) = find_entry(payload, attribute_id)?
                .map(|located| (located.span(), located.entry.record_id()))
            else {
                return Ok(false);
            };
            resize_gap(payload, span.start, span.len(), 0)?;
            removed = Some(record_id);
            Ok(true)
        })?;
        debug_assert_eq!(new_id, directory_id);

        match removed {
            Some(Some(record_id)) => self.free_dedicated(record_id)?,
            Some(None) => {}
            None => return Ok(false),
        }
        Ok(true)
    }

    /// Visit every stored attribute; returns how many were visited
    ///
    /// Inline values are reported with their directory's id. Values kept in a
    /// dedicated record are reported with that record's own id, not the
    /// directory's, so callers should key results by `(file_id, attribute_id)`.
    /// The scan is not a snapshot, and `visitor` must not call back into this
    /// storage.
    pub fn for_each_attribute<F>(&self, mut visitor: F) -> Result<usize>
    where
        F: FnMut(RecordId, i32, i32, &[u8]) -> Result<()>,
    {
        let mut visited = 0;
        self.store.for_each(&mut |record_id, payload| {
            match classify(payload)? {
                RecordKind::Directory { file_id } => {
                    for located in DirectoryCursor::new(payload)? {
                        if let AttributeEntry::Inline {
                            attribute_id,
                            value,
                        } = located?.entry
                        {
                            visitor(record_id, file_id, attribute_id, value)?;
                            visited += 1;
                        }
                    }
                }
                RecordKind::Dedicated {
                    file_id,
                    attribute_id,
                    value,
                } => {
                    visitor(record_id, file_id, attribute_id, value)?;
                    visited += 1;
                }
                RecordKind::Empty => {}
            }
            Ok(())
        })?;
        Ok(visited)
    }

    // =========================================================================
    // Header
    // =========================================================================

    pub fn version(&self) -> Result<i32> {
        self.store.header_field(VERSION_FIELD)
    }

    pub fn set_version(&self, version: i32) -> Result<()> {
        self.store.set_header_field(VERSION_FIELD, version)
    }

    /// Stamp identifying the session that created the store
    pub fn vfs_creation_tag(&self) -> Result<i64> {
        let _halves = self.tag_lock.lock();
        let low = self.store.header_field(TAG_LOW_FIELD)? as u32 as i64;
        let high = self.store.header_field(TAG_HIGH_FIELD)? as i64;
        Ok((high << 32) | low)
    }

    /// Readers in this process never see one half of an old tag with the
    /// other half of a new one
    pub fn set_vfs_creation_tag(&self, tag: i64) -> Result<()> {
        let _halves = self.tag_lock.lock();
        self.store.set_header_field(TAG_LOW_FIELD, tag as i32)?;
        self.store.set_header_field(TAG_HIGH_FIELD, (tag >> 32) as i32)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    pub fn is_dirty(&self) -> bool {
        self.store.is_dirty()
    }

    /// Flush pending writes
    pub fn force(&self) -> Result<()> {
        self.store.force()
    }

    /// Whether the previous session closed the store cleanly
    pub fn was_closed_properly(&self) -> bool {
        self.store.was_closed_properly()
    }

    pub fn close(&self) -> Result<()> {
        self.store.close()
    }

    /// Close and remove the backing file
    pub fn close_and_clean(self) -> Result<()> {
        let path: Option<PathBuf> = self.store.path().map(|p| p.to_path_buf());
        self.store.close()?;
        if let Some(path) = path {
            match fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "removed attributes storage"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn create_directory(&self, file_id: i32, attribute_id: i32, value: &[u8]) -> Result<RecordId> {
        let mut directory = new_directory(file_id);
        if is_inline(value.len()) {
            append_entry(
                &mut directory,
                &AttributeEntry::Inline {
                    attribute_id,
                    value,
                },
            );
            return self.store.allocate(&directory);
        }

        let record_id = self
            .store
            .allocate(&encode_dedicated(file_id, attribute_id, value))?;
        append_entry(
            &mut directory,
            &AttributeEntry::Ref {
                attribute_id,
                record_id,
            },
        );
        match self.store.allocate(&directory) {
            Ok(directory_id) => Ok(directory_id),
            Err(e) => {
                self.discard(record_id);
                Err(e)
            }
        }
    }

    fn put_inline(
        &self,
        directory_id: RecordId,
        file_id: i32,
        attribute_id: i32,
        value: &[u8],
    ) -> Result<RecordId> {
        let entry = AttributeEntry::Inline {
            attribute_id,
            value,
        };
        let mut replaced = NON_EXISTENT;

        let new_id = self.store.write_with(directory_id, &mut |payload| {
            replaced = NON_EXISTENT;
            check_owner(directory_id, payload, file_id)?;
            let found = find_entry(payload, attribute_id)?
                .map(|located| {
                    let unchanged = located.entry == entry;
                    (located.span(), unchanged, located.entry.record_id())
                });

            match found {
                Some((_, true, _)) => return Ok(false),
                Some((span, false, previous)) => {
                    replaced = previous.unwrap_or(NON_EXISTENT);
                    replace_entry(payload, span, &entry)?;
                }
                None => append_entry(payload, &entry),
            }
            Ok(true)
        })?;

        if replaced != NON_EXISTENT {
            self.free_dedicated(replaced)?;
        }
        Ok(new_id)
    }

    fn put_dedicated(
        &self,
        directory_id: RecordId,
        file_id: i32,
        attribute_id: i32,
        value: &[u8],
    ) -> Result<RecordId> {
        let dedicated = encode_dedicated(file_id, attribute_id, value);

        let mut existing = None;
        self.store.read_with(directory_id, &mut |payload| {
            check_owner(directory_id, payload, file_id)?;
            existing = find_entry(payload, attribute_id)?.and_then(|l| l.entry.record_id());
            Ok(())
        })?;

        if let Some(record_id) = existing {
            match self.store.rewrite_in_place(record_id, &dedicated) {
                Ok(true) => return Ok(directory_id),
                Ok(false) => {}
                Err(e) if e.is_already_deleted() => {}
                Err(e) => return Err(e),
            }
        }

        let record_id = self.store.allocate(&dedicated)?;
        let entry = AttributeEntry::Ref {
            attribute_id,
            record_id,
        };
        let mut replaced = NON_EXISTENT;

        let result = self.store.write_with(directory_id, &mut |payload| {
            replaced = NON_EXISTENT;
            check_owner(directory_id, payload, file_id)?;
            let found = find_entry(payload, attribute_id)?
                .map(|located| (located.span(), located.entry.record_id()));

            match found {
                Some((span, previous)) => {
                    replaced = previous.unwrap_or(NON_EXISTENT);
                    replace_entry(payload, span, &entry)?;
                }
                None => append_entry(payload, &entry),
            }
            Ok(true)
        });

        let new_id = match result {
            Ok(new_id) => new_id,
            Err(e) => {
                self.discard(record_id);
                return Err(e);
            }
        };
        if replaced != NON_EXISTENT {
            self.free_dedicated(replaced)?;
        }
        Ok(new_id)
    }

    /// Free a dedicated record nobody points at any more
    ///
    /// A concurrent writer on the same file may have freed it first.
    fn free_dedicated(&self, record_id: RecordId) -> Result<()> {
        match self.store.delete(record_id) {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_deleted() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Best-effort cleanup of a record allocated by a failed update
    fn discard(&self, record_id: RecordId) {
        if let Err(e) = self.store.delete(record_id) {
            warn!(record_id, error = %e, "failed to free orphaned dedicated record");
        }
    }
}

impl std::fmt::Debug for AttributesStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributesStorage")
            .field("path", &self.store.path())
            .field("stats", &self.store.stats())
            .finish()
    }
}

fn check_ids(file_id: i32, attribute_id: i32) -> Result<()> {
    if file_id <= 0 {
        return Err(StoreError::InvalidArgument(format!(
            "fileId must be positive, got {}",
            file_id
        )));
    }
    if attribute_id < 0 {
        return Err(StoreError::InvalidArgument(format!(
            "attributeId must not be negative, got {}",
            attribute_id
        )));
    }
    Ok(())
}

/// Reject a record that is not the directory of `file_id`
fn check_owner(directory_id: RecordId, payload: &[u8], file_id: i32) -> Result<()> {
    let owner = DirectoryCursor::new(payload)?.file_id();
    if owner != file_id {
        return Err(StoreError::Corrupted(format!(
            "record {} is not the directory of file {} (owner {})",
            directory_id, file_id, owner
        )));
    }
    Ok(())
}

fn dedicated_value<'a>(
    record_id: RecordId,
    payload: &'a [u8],
    file_id: i32,
    attribute_id: i32,
) -> Result<&'a [u8]> {
    let (owner, attribute, value) = decode_dedicated(payload)?;
    if owner != file_id || attribute != attribute_id {
        return Err(StoreError::Corrupted(format!(
            "record {} holds attribute {} of file {}, expected {} of {}",
            record_id, attribute, owner, attribute_id, file_id
        )));
    }
    Ok(value)
}
