//! # Reservation Concurrency Tests
//!
//! Eight operator threads compete for a 64 MiB pool, each wanting 16 MiB.
//! Waiting reservations degrade by halving their target, so every call
//! returns in bounded time and releases keep the pool flowing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use spillbuf::{BufferManager, BufferOptions, MemoryStorageManager, ReserveMode};

const POOL_KB: u64 = 64 * 1024;
const REQUEST_KB: u64 = 16 * 1024;

fn manager() -> Arc<BufferManager> {
    let manager = BufferManager::with_options(
        Arc::new(MemoryStorageManager::new()),
        BufferOptions {
            max_reserve_kb: Some(POOL_KB),
            ref_cache_kb: Some(0),
            ..BufferOptions::default()
        },
    );
    manager.initialize().unwrap();
    Arc::new(manager)
}

#[test]
fn test_competing_waiters_all_make_progress() {
    let manager = manager();
    let start = Instant::now();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                let mut total_granted = 0u64;
                for _ in 0..3 {
                    let granted = manager
                        .reserve_buffers(REQUEST_KB, ReserveMode::Wait)
                        .unwrap();
                    std::thread::sleep(Duration::from_millis(5));
                    manager.release_buffers(granted);
                    total_granted += granted;
                }
                total_granted
            })
        })
        .collect();

    for worker in workers {
        let total_granted = worker.join().unwrap();
        assert!(
            total_granted > 0,
            "every thread must eventually be granted buffer space"
        );
    }

    assert!(
        start.elapsed() < Duration::from_secs(60),
        "waiting reservations must degrade instead of stalling"
    );
    assert_eq!(manager.reserve_batch_kb(), POOL_KB as i64);
}

#[test]
fn test_waiter_wakes_when_holder_releases() {
    let manager = manager();
    let held = manager
        .reserve_buffers(POOL_KB, ReserveMode::NoWait)
        .unwrap();
    assert_eq!(held, POOL_KB);

    let waiter = {
        let manager = Arc::clone(&manager);
        std::thread::spawn(move || {
            manager
                .reserve_buffers(REQUEST_KB, ReserveMode::Wait)
                .unwrap()
        })
    };
    std::thread::sleep(Duration::from_millis(20));
    manager.release_buffers(held);

    let granted = waiter.join().unwrap();
    assert!(granted > 0);
    manager.release_buffers(granted);
    assert_eq!(manager.reserve_batch_kb(), POOL_KB as i64);
}

#[test]
fn test_shutdown_interrupts_blocked_reservation() {
    let manager = manager();
    let _held = manager
        .reserve_buffers(POOL_KB, ReserveMode::NoWait)
        .unwrap();

    let waiter = {
        let manager = Arc::clone(&manager);
        std::thread::spawn(move || manager.reserve_buffers(REQUEST_KB, ReserveMode::Wait))
    };
    std::thread::sleep(Duration::from_millis(20));
    manager.shutdown();

    let result = waiter.join().unwrap();
    let err = result.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<spillbuf::BufferError>(),
        Some(spillbuf::BufferError::Interrupted)
    ));
}
