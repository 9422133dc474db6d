//! Tests for space allocation strategies
//!
//! These tests verify:
//! - Percent-based slack with a minimum gap
//! - The minimum record size floor
//! - Exact-fit sizing
//! - How the blob store applies a strategy to real records

use attrstore::blob::BlobStore;
use attrstore::{
    open_store, Backend, DataLengthPlusFixedPercentStrategy, ExactFitStrategy,
    SpaceAllocationStrategy, StoreConfig,
};

// =============================================================================
// DataLengthPlusFixedPercentStrategy Tests
// =============================================================================

#[test]
fn test_percent_strategy_floors_at_min_record_size() {
    let strategy = DataLengthPlusFixedPercentStrategy::new(64, 8, 30);

    assert_eq!(strategy.capacity_for(0), 64);
    assert_eq!(strategy.capacity_for(10), 64);
    assert_eq!(strategy.capacity_for(56), 64);
}

#[test]
fn test_percent_strategy_uses_min_gap_for_small_payloads() {
    let strategy = DataLengthPlusFixedPercentStrategy::new(0, 8, 30);

    // 30% of 20 is 6, below the gap of 8
    assert_eq!(strategy.capacity_for(20), 28);
}

#[test]
fn test_percent_strategy_uses_percent_for_large_payloads() {
    let strategy = DataLengthPlusFixedPercentStrategy::new(64, 8, 30);

    assert_eq!(strategy.capacity_for(1000), 1300);
    assert_eq!(strategy.capacity_on_growth(1000), 1300);
}

#[test]
fn test_percent_strategy_never_below_payload() {
    let strategy = DataLengthPlusFixedPercentStrategy::new(0, 0, 0);

    for len in [0, 1, 63, 64, 4096] {
        assert!(strategy.capacity_for(len) >= len);
    }
}

#[test]
fn test_percent_strategy_saturates() {
    let strategy = DataLengthPlusFixedPercentStrategy::new(64, 8, 30);
    assert_eq!(strategy.capacity_for(usize::MAX), usize::MAX);
}

#[test]
fn test_percent_strategy_default_and_getters() {
    let strategy = DataLengthPlusFixedPercentStrategy::default();

    assert_eq!(strategy.min_record_size(), 64);
    assert_eq!(strategy.min_gap(), 8);
    assert_eq!(strategy.percent(), 30);
}

// =============================================================================
// ExactFitStrategy Tests
// =============================================================================

#[test]
fn test_exact_fit_returns_payload_length() {
    let strategy = ExactFitStrategy;

    assert_eq!(strategy.capacity_for(0), 0);
    assert_eq!(strategy.capacity_for(17), 17);
    assert_eq!(strategy.capacity_on_growth(17), 17);
}

// =============================================================================
// Strategy Applied By The Store
// =============================================================================

#[test]
fn test_store_rounds_capacity_to_alignment() {
    let config = StoreConfig::builder()
        .backend(Backend::InMemory)
        .allocation_strategy(ExactFitStrategy)
        .build();
    let store = open_store(&config).unwrap();

    let id = store.allocate(&[1u8; 17]).unwrap();
    assert_eq!(store.record_capacity(id).unwrap(), 32);
}

#[test]
fn test_store_clamps_capacity_to_max_payload() {
    let config = StoreConfig::builder()
        .backend(Backend::InMemory)
        .page_size(4096)
        .allocation_strategy(DataLengthPlusFixedPercentStrategy::new(0, 0, 100))
        .build();
    let store = open_store(&config).unwrap();

    let id = store.allocate(&[0u8; 3000]).unwrap();
    assert_eq!(store.record_capacity(id).unwrap(), store.max_payload_size());
}

#[test]
fn test_store_uses_strategy_slack() {
    let config = StoreConfig::builder()
        .backend(Backend::InMemory)
        .allocation_strategy(DataLengthPlusFixedPercentStrategy::new(64, 8, 30))
        .build();
    let store = open_store(&config).unwrap();

    let id = store.allocate(&[0u8; 100]).unwrap();
    // 100 + 30 = 130, aligned to 144
    assert_eq!(store.record_capacity(id).unwrap(), 144);
}
