//! Tests for in-place gap resizing
//!
//! These tests verify:
//! - Bytes before the gap never move
//! - Bytes after the gap keep their order and land right after the new gap
//! - The logical end shifts by exactly `new_gap - old_gap`
//! - Zero-size gaps (pure insert, pure delete) behave the same way
//! - Out-of-range gaps are rejected without touching the buffer

use attrstore::directory::resize_gap;
use attrstore::StoreError;
use proptest::prelude::*;

const LIMIT: usize = 128;
const CAPACITY: usize = 200;

// =============================================================================
// Helper Functions
// =============================================================================

/// Buffer of `limit` distinct-looking bytes with room to grow
fn patterned(limit: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CAPACITY);
    buf.extend((0..limit).map(|i| (i * 7 + 3) as u8));
    buf
}

/// Check the resize law for one combination
fn assert_gap_law(limit: usize, offset: usize, old_gap: usize, new_gap: usize) {
    let original = patterned(limit);
    let mut buf = original.clone();

    resize_gap(&mut buf, offset, old_gap, new_gap).unwrap();

    assert_eq!(
        buf.len() as isize,
        limit as isize + new_gap as isize - old_gap as isize,
        "offset={} old_gap={} new_gap={}",
        offset,
        old_gap,
        new_gap
    );
    assert_eq!(&buf[..offset], &original[..offset]);
    assert_eq!(&buf[offset + new_gap..], &original[offset + old_gap..]);
}

fn gap_case() -> impl Strategy<Value = (usize, usize, usize)> {
    (0..LIMIT).prop_flat_map(|offset| (Just(offset), 0..LIMIT - offset, 0..LIMIT))
}

// =============================================================================
// Property Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn test_gap_resize_preserves_surroundings((offset, old_gap, new_gap) in gap_case()) {
        assert_gap_law(LIMIT, offset, old_gap, new_gap);
    }

    #[test]
    fn test_gap_resize_is_reversible((offset, old_gap, new_gap) in gap_case()) {
        let original = patterned(LIMIT);
        let mut buf = original.clone();

        resize_gap(&mut buf, offset, old_gap, new_gap).unwrap();
        // put the old gap bytes back
        resize_gap(&mut buf, offset, new_gap, old_gap).unwrap();
        buf[offset..offset + old_gap].copy_from_slice(&original[offset..offset + old_gap]);

        prop_assert_eq!(buf, original);
    }
}

// =============================================================================
// Exhaustive Small Cases
// =============================================================================

#[test]
fn test_gap_resize_all_small_combinations() {
    let limit = 24;
    for offset in 0..limit {
        for old_gap in 0..limit - offset {
            for new_gap in 0..limit {
                assert_gap_law(limit, offset, old_gap, new_gap);
            }
        }
    }
}

// =============================================================================
// Edge Case Tests
// =============================================================================

#[test]
fn test_zero_to_zero_is_noop() {
    let original = patterned(LIMIT);
    let mut buf = original.clone();

    resize_gap(&mut buf, 40, 0, 0).unwrap();
    assert_eq!(buf, original);
}

#[test]
fn test_same_size_gap_keeps_length() {
    let original = patterned(LIMIT);
    let mut buf = original.clone();

    resize_gap(&mut buf, 10, 5, 5).unwrap();
    assert_eq!(buf, original);
}

#[test]
fn test_delete_to_end() {
    let mut buf = patterned(LIMIT);

    resize_gap(&mut buf, 100, 28, 0).unwrap();
    assert_eq!(buf, patterned(100));
}

#[test]
fn test_insert_at_start() {
    let original = patterned(LIMIT);
    let mut buf = original.clone();

    resize_gap(&mut buf, 0, 0, 16).unwrap();
    assert_eq!(buf.len(), LIMIT + 16);
    assert_eq!(&buf[16..], original.as_slice());
}

#[test]
fn test_grow_past_initial_capacity() {
    let original = patterned(LIMIT);
    let mut buf = original.clone();

    resize_gap(&mut buf, 64, 0, CAPACITY).unwrap();
    assert_eq!(buf.len(), LIMIT + CAPACITY);
    assert_eq!(&buf[64 + CAPACITY..], &original[64..]);
}

#[test]
fn test_offset_past_end_rejected() {
    let original = patterned(LIMIT);
    let mut buf = original.clone();

    let result = resize_gap(&mut buf, LIMIT + 1, 0, 4);
    assert!(matches!(result, Err(StoreError::IndexOutOfBounds { .. })));
    assert_eq!(buf, original);
}

#[test]
fn test_old_gap_past_end_rejected() {
    let original = patterned(LIMIT);
    let mut buf = original.clone();

    let result = resize_gap(&mut buf, 100, 29, 0);
    assert!(matches!(result, Err(StoreError::IndexOutOfBounds { .. })));
    assert_eq!(buf, original);

    assert!(resize_gap(&mut buf, 1, usize::MAX, 0).is_err());
}
