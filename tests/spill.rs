//! # Spill and Eviction Integration Tests
//!
//! Exercises the full admission path against a real disk-backed store:
//!
//! 1. Bounded memory: a long append stream never holds more than the
//!    reserve in memory, and every batch reads back intact.
//! 2. Forward-scan eviction: after a sequential scan, pressure evicts the
//!    batches behind the read cursor, not the ones ahead of it.
//! 3. Accounting: reserve/release sequences never exceed the budget.

use std::sync::Arc;

use spillbuf::{
    BufferManager, BufferOptions, DataType, DiskStorageManager, ReserveMode, TupleBatch,
    TupleSourceType, Value,
};
use tempfile::tempdir;

fn disk_manager(dir: &std::path::Path, max_reserve_kb: u64, ref_cache_kb: u64) -> BufferManager {
    let storage = Arc::new(DiskStorageManager::new(dir).unwrap());
    let manager = BufferManager::with_options(
        storage,
        BufferOptions {
            max_reserve_kb: Some(max_reserve_kb),
            ref_cache_kb: Some(ref_cache_kb),
            ..BufferOptions::default()
        },
    );
    manager.initialize().unwrap();
    manager
}

fn payload(i: u64) -> Vec<u8> {
    vec![(i % 251) as u8; 64]
}

#[test]
fn test_spill_keeps_active_memory_bounded() {
    let dir = tempdir().unwrap();
    let manager = disk_manager(dir.path(), 64, 0);
    let buffer = manager
        .create_tuple_buffer(&[DataType::Binary], "scan", TupleSourceType::Processor)
        .unwrap();

    for i in 0..1000u64 {
        buffer
            .add_batch(TupleBatch::new(vec![vec![Value::Binary(payload(i))]]))
            .unwrap();
        assert!(
            manager.active_batch_kb() <= 64,
            "active total {} exceeded the 64 KB reserve after batch {i}",
            manager.active_batch_kb()
        );
    }
    buffer.close();
    assert_eq!(buffer.row_count(), 1000);
    assert!(manager.write_count() > 0, "the stream must have spilled");

    for i in 0..1000u64 {
        let batch = buffer.batch(i + 1).unwrap();
        assert_eq!(batch.begin_row(), i + 1);
        assert_eq!(batch.rows()[0][0], Value::Binary(payload(i)));
        // A read charges its repromotion after the eviction pass, so the
        // bound is one batch wide here.
        assert!(
            manager.active_batch_kb() <= 64 + 1,
            "read-back repromotion broke the bound"
        );
    }
    assert!(manager.read_count() > 0);
}

#[test]
fn test_forward_scan_evicts_behind_the_cursor() {
    let dir = tempdir().unwrap();
    let manager = disk_manager(dir.path(), 200, 0);
    let buffer = manager
        .create_tuple_buffer(&[DataType::Binary], "scan", TupleSourceType::Processor)
        .unwrap();

    for i in 0..100u64 {
        buffer
            .add_batch(TupleBatch::new(vec![vec![Value::Binary(payload(i))]]))
            .unwrap();
    }
    // Everything fits: the scan up to row 80 is served from memory.
    for row in 1..=80u64 {
        let _ = buffer.batch(row).unwrap();
    }
    assert_eq!(manager.read_count(), 0);

    // Shrink the pool; the eviction pass runs inside the reservation.
    let granted = manager.reserve_buffers(150, ReserveMode::Force).unwrap();
    assert_eq!(granted, 150);
    assert!(manager.active_batch_kb() <= 50);

    // Batches ahead of the cursor survived eviction.
    let reads_before = manager.read_count();
    for row in 80..=100u64 {
        let _ = buffer.batch(row).unwrap();
    }
    assert_eq!(
        manager.read_count(),
        reads_before,
        "rows at or past the cursor must still be memory-resident"
    );

    // A row well behind the cursor was demoted to disk.
    let _ = buffer.batch(40).unwrap();
    assert!(
        manager.read_count() > reads_before,
        "rows behind the cursor should have been evicted"
    );

    manager.release_buffers(granted);
}

#[test]
fn test_reserve_release_respects_budget() {
    let dir = tempdir().unwrap();
    let manager = disk_manager(dir.path(), 128, 0);

    let first = manager.reserve_buffers(100, ReserveMode::NoWait).unwrap();
    assert_eq!(first, 100);
    let second = manager.reserve_buffers(100, ReserveMode::NoWait).unwrap();
    assert_eq!(second, 28);

    manager.release_buffers(first);
    manager.release_buffers(second);
    assert_eq!(manager.reserve_batch_kb(), 128);
    assert!(manager.reserve_batch_kb() <= manager.max_reserve_kb() as i64);

    let forced = manager.reserve_buffers(200, ReserveMode::Force).unwrap();
    assert_eq!(forced, 200);
    assert_eq!(manager.reserve_batch_kb(), -72);
    manager.release_buffers(forced);
    assert_eq!(manager.reserve_batch_kb(), 128);
}

#[test]
fn test_reference_cache_serves_rereads_without_disk() {
    let dir = tempdir().unwrap();
    // A generous reference cache: evicted payloads stay resurrectable.
    let manager = disk_manager(dir.path(), 16, 64);
    let buffer = manager
        .create_tuple_buffer(&[DataType::Binary], "hot", TupleSourceType::Processor)
        .unwrap();

    for i in 0..48u64 {
        buffer
            .add_batch(TupleBatch::new(vec![vec![Value::Binary(payload(i))]]))
            .unwrap();
    }
    assert!(manager.write_count() > 0);

    for i in 0..48u64 {
        let batch = buffer.batch(i + 1).unwrap();
        assert_eq!(batch.rows()[0][0], Value::Binary(payload(i)));
    }
    assert!(
        manager.reference_hits() > 0,
        "some rereads should have hit the reference cache"
    );
}
