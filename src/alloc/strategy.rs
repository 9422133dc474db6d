//! Shipped allocation strategies

use super::SpaceAllocationStrategy;

/// Reserves `max(min_gap, len * percent / 100)` bytes on top of the payload,
/// with the total never below `min_record_size`.
///
/// Attributes that grow a little on every write (timestamps, lengths, small
/// counters) get enough slack to stay in place, while large static values do not
/// waste more than `percent` of their size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLengthPlusFixedPercentStrategy {
    min_record_size: usize,
    min_gap: usize,
    percent: usize,
}

impl DataLengthPlusFixedPercentStrategy {
    pub fn new(min_record_size: usize, min_gap: usize, percent: usize) -> Self {
        Self {
            min_record_size,
            min_gap,
            percent,
        }
    }

    pub fn min_record_size(&self) -> usize {
        self.min_record_size
    }

    pub fn min_gap(&self) -> usize {
        self.min_gap
    }

    pub fn percent(&self) -> usize {
        self.percent
    }
}

impl Default for DataLengthPlusFixedPercentStrategy {
    fn default() -> Self {
        Self::new(64, 8, 30)
    }
}

impl SpaceAllocationStrategy for DataLengthPlusFixedPercentStrategy {
    fn capacity_for(&self, payload_len: usize) -> usize {
        let reserve = (payload_len.saturating_mul(self.percent) / 100).max(self.min_gap);
        payload_len
            .saturating_add(reserve)
            .max(self.min_record_size)
    }
}

/// No slack at all: capacity equals payload length.
///
/// Every growth relocates the record. Useful for read-mostly stores and for
/// exercising relocation paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExactFitStrategy;

impl SpaceAllocationStrategy for ExactFitStrategy {
    fn capacity_for(&self, payload_len: usize) -> usize {
        payload_len
    }
}
