//! Configuration for attrstore
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::sync::Arc;

use crate::alloc::{DataLengthPlusFixedPercentStrategy, SpaceAllocationStrategy};
use crate::error::{Result, StoreError};

/// Smallest page size any backend accepts
pub const MIN_PAGE_SIZE: usize = 4 * 1024;

/// Largest page size any backend accepts
pub const MAX_PAGE_SIZE: usize = 1 << 30;

/// Default page size (1 MB)
pub const DEFAULT_PAGE_SIZE: usize = 1 << 20;

/// Main configuration for a blob store / attributes storage
#[derive(Debug, Clone)]
pub struct StoreConfig {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Backing file. Ignored by the in-memory backend.
    pub path: PathBuf,

    /// Which blob store implementation to open
    pub backend: Backend,

    /// Page size in bytes. Records never cross a page boundary, so this also
    /// bounds the largest single record.
    pub page_size: usize,

    // -------------------------------------------------------------------------
    // Allocation Configuration
    // -------------------------------------------------------------------------
    /// Sizing policy for new and relocated records
    pub allocation_strategy: Arc<dyn SpaceAllocationStrategy>,

    // -------------------------------------------------------------------------
    // Error Policy
    // -------------------------------------------------------------------------
    /// Deleting an already-deleted record returns `Ok(false)` instead of
    /// `StoreError::RecordAlreadyDeleted`
    pub ignore_already_deleted_errors: bool,
}

/// Blob store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Positioned file I/O behind a single mutex
    Synchronized,

    /// Memory-mapped pages with CAS allocation and per-record seqlocks
    MemoryMapped,

    /// Heap only, nothing persisted
    InMemory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./attributes.dat"),
            backend: Backend::MemoryMapped,
            page_size: DEFAULT_PAGE_SIZE,
            allocation_strategy: Arc::new(DataLengthPlusFixedPercentStrategy::default()),
            ignore_already_deleted_errors: false,
        }
    }
}

impl StoreConfig {
    /// Create a new config builder
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// Check values that every backend relies on
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() {
            return Err(StoreError::Config(format!(
                "page size must be a power of two, got {}",
                self.page_size
            )));
        }
        if self.page_size < MIN_PAGE_SIZE || self.page_size > MAX_PAGE_SIZE {
            return Err(StoreError::Config(format!(
                "page size {} outside [{}, {}]",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }
}

/// Builder for StoreConfig
#[derive(Default)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    /// Set the backing file path
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Set the backend
    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Set the page size (in bytes)
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    /// Set the allocation strategy
    pub fn allocation_strategy(mut self, strategy: impl SpaceAllocationStrategy + 'static) -> Self {
        self.config.allocation_strategy = Arc::new(strategy);
        self
    }

    /// Choose fail-soft (`true`) or fail-fast (`false`) repeated deletes
    pub fn ignore_already_deleted_errors(mut self, ignore: bool) -> Self {
        self.config.ignore_already_deleted_errors = ignore;
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}
