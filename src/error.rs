//! Error types for attrstore
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

use crate::blob::RecordId;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for attrstore operations
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Record Addressing Errors
    // -------------------------------------------------------------------------
    #[error("Record {0} not found")]
    NotFound(RecordId),

    #[error("Record {0} is already deleted")]
    RecordAlreadyDeleted(RecordId),

    #[error("Index {index} is outside the allocated range (limit {limit})")]
    IndexOutOfBounds { index: i64, limit: i64 },

    #[error("Record of {size} bytes exceeds the maximum payload of {max} bytes")]
    RecordTooLarge { size: usize, max: usize },

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    #[error("Storage corrupted: {0}")]
    Corrupted(String),

    // -------------------------------------------------------------------------
    // Usage Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage is closed")]
    Closed,
}

impl StoreError {
    /// True for the error a repeated delete produces
    pub fn is_already_deleted(&self) -> bool {
        matches!(self, StoreError::RecordAlreadyDeleted(_))
    }
}
