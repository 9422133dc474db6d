//! # attrstore
//!
//! Persistent attribute storage for a file-system metadata cache:
//! - Variable-length blob records in a paged file, with relocation on growth
//! - Per-file attribute directories with inline and out-of-line values
//! - Three interchangeable backends (synchronized, memory-mapped, in-memory)
//! - Unclean-shutdown detection and header checksums
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   AttributesStorage                          │
//! │       (fileId, attributeId) -> bytes, caller-held ids        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │  Directory  │          │  BlobStore  │
//!   │   (Codec)   │          │   (trait)   │
//!   └─────────────┘          └──────┬──────┘
//!                                   │
//!                 ┌─────────────────┼─────────────────┐
//!                 ▼                 ▼                 ▼
//!          ┌────────────┐    ┌────────────┐    ┌────────────┐
//!          │    File    │    │    Mmap    │    │  InMemory  │
//!          │  (Mutex)   │    │ (CAS/seq)  │    │  (RwLock)  │
//!          └─────┬──────┘    └─────┬──────┘    └────────────┘
//!                └────────┬────────┘
//!                         ▼
//!                ┌─────────────────┐
//!                │ Allocation      │
//!                │ Strategy        │
//!                └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod alloc;
pub mod blob;
pub mod directory;
pub mod attributes;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, StoreError};
pub use config::{Backend, StoreConfig};
pub use alloc::{DataLengthPlusFixedPercentStrategy, ExactFitStrategy, SpaceAllocationStrategy};
pub use blob::{open_store, BlobStore, RecordId, StoreStats, NON_EXISTENT};
pub use directory::INLINE_ATTRIBUTE_SMALLER_THAN;
pub use attributes::AttributesStorage;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of attrstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
