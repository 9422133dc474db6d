//! Space Allocation Module
//!
//! Sizing policy for blob records: given a payload length, how much capacity
//! to reserve so that later in-place growth does not force a relocation.
//!
//! ## Responsibilities
//! - Decide the capacity of a freshly allocated record
//! - Decide the capacity of a record relocated because it outgrew its slot
//!
//! The store clamps every answer into `[payload_len, max_payload]` and rounds it
//! up to the record alignment, so strategies never need to know the page size.

mod strategy;

use std::fmt::Debug;

pub use strategy::{DataLengthPlusFixedPercentStrategy, ExactFitStrategy};

/// Policy computing reserved capacity for a payload
pub trait SpaceAllocationStrategy: Debug + Send + Sync {
    /// Capacity for a record allocated with a payload of `payload_len` bytes
    fn capacity_for(&self, payload_len: usize) -> usize;

    /// Capacity for a record that outgrew its slot and is being relocated
    fn capacity_on_growth(&self, payload_len: usize) -> usize {
        self.capacity_for(payload_len)
    }
}
