//! Global buffer reservation pool.
//!
//! Admission is serialized by one mutex (the coarsest lock in the manager);
//! waiters park on a condvar signalled by every release. A WAIT reservation
//! starts out asking for `min(count, max_reserve_kb)` and halves its target
//! after every interval, so waiting terminates even under permanent pressure
//! and grants degrade gracefully instead of timing out.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use eyre::{bail, Result};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::config::RESERVE_WAIT_INTERVAL_MS;
use crate::error::BufferError;

/// How a reservation behaves when the pool cannot satisfy it outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveMode {
    /// Block with a halving backoff until the (shrinking) target fits.
    Wait,
    /// Always grant the full count, driving the pool negative if necessary.
    Force,
    /// Grant `min(count, max(available, 0))` immediately.
    NoWait,
}

struct PoolState {
    reserve_batch_kb: i64,
}

/// The admission-side KB budget.
pub struct ReservePool {
    lock: Mutex<PoolState>,
    batches_freed: Condvar,
    max_reserve_kb: AtomicU64,
    // Lock-free mirror of reserve_batch_kb for the eviction pass, which must
    // not take the admission lock.
    reserve_mirror: AtomicI64,
    shutdown: AtomicBool,
}

impl ReservePool {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(PoolState { reserve_batch_kb: 0 }),
            batches_freed: Condvar::new(),
            max_reserve_kb: AtomicU64::new(0),
            reserve_mirror: AtomicI64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Installs the resolved budget and fills the pool to it.
    pub fn set_budget(&self, max_reserve_kb: u64) {
        let mut state = self.lock.lock();
        self.max_reserve_kb.store(max_reserve_kb, Ordering::Release);
        state.reserve_batch_kb = max_reserve_kb as i64;
        self.reserve_mirror
            .store(state.reserve_batch_kb, Ordering::Release);
        self.batches_freed.notify_all();
    }

    pub fn max_reserve_kb(&self) -> u64 {
        self.max_reserve_kb.load(Ordering::Acquire)
    }

    /// Remaining headroom as last published by an admission operation.
    pub fn approx_remaining_kb(&self) -> i64 {
        self.reserve_mirror.load(Ordering::Acquire)
    }

    /// Reserves up to `count_kb` from the pool, returning the granted amount.
    pub fn reserve(&self, count_kb: u64, mode: ReserveMode) -> Result<u64> {
        let count = count_kb as i64;
        let mut state = self.lock.lock();

        if mode == ReserveMode::Wait {
            // Never wait for more than the pool can ever hold.
            let mut wait_count = count.min(self.max_reserve_kb() as i64);
            while wait_count > 0 && wait_count > state.reserve_batch_kb {
                if self.shutdown.load(Ordering::Acquire) {
                    bail!(BufferError::Interrupted);
                }
                let _ = self
                    .batches_freed
                    .wait_for(&mut state, Duration::from_millis(RESERVE_WAIT_INTERVAL_MS));
                wait_count /= 2;
            }
            if self.shutdown.load(Ordering::Acquire) {
                bail!(BufferError::Interrupted);
            }
        }

        let granted = if state.reserve_batch_kb >= count || mode == ReserveMode::Force {
            state.reserve_batch_kb -= count;
            count
        } else {
            let available = state.reserve_batch_kb.max(0);
            state.reserve_batch_kb -= available;
            available
        };
        self.reserve_mirror
            .store(state.reserve_batch_kb, Ordering::Release);
        trace!(requested = count_kb, granted, remaining = state.reserve_batch_kb, "reserved buffer space");
        Ok(granted as u64)
    }

    /// Returns KB to the pool and wakes every waiter.
    pub fn release(&self, count_kb: u64) {
        if count_kb == 0 {
            return;
        }
        let mut state = self.lock.lock();
        state.reserve_batch_kb += count_kb as i64;
        self.reserve_mirror
            .store(state.reserve_batch_kb, Ordering::Release);
        trace!(released = count_kb, remaining = state.reserve_batch_kb, "released buffer space");
        self.batches_freed.notify_all();
    }

    /// Wakes every waiter with an interruption error.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _state = self.lock.lock();
        self.batches_freed.notify_all();
    }
}

impl Default for ReservePool {
    fn default() -> Self {
        Self::new()
    }
}
