//! Second-chance cache of evicted batch payloads.
//!
//! When a batch is demoted to disk, its in-memory payload is not discarded
//! outright: a strong reference is parked here while the owning
//! `ManagedBatch` keeps only a `Weak`. A read that arrives before the entry
//! is pushed out upgrades the weak reference and skips the disk entirely
//! (counted as a reference hit).
//!
//! ## Why second chance instead of strict LRU?
//!
//! Forward scans touch every batch exactly once, so strict recency would let
//! one large scan flush the whole cache. Entries from buffers that prefer
//! memory are inserted as *soft* and carry a visited bit: the eviction hand
//! clears the bit on first encounter and only evicts on the second, giving
//! re-read batches one full round of protection. *Weak* entries (the common
//! case) are evicted as soon as the hand reaches them.
//!
//! Capacity is a KB budget, not an entry count, because batch footprints
//! vary by two orders of magnitude across schemas.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::buffer::TupleBatch;

struct RefEntry {
    id: u64,
    batch: Arc<TupleBatch>,
    size_kb: u64,
    soft: bool,
    visited: bool,
}

#[derive(Default)]
struct RefCacheInner {
    entries: Vec<RefEntry>,
    index: HashMap<u64, usize>,
    hand: usize,
    used_kb: u64,
}

impl RefCacheInner {
    fn remove_at(&mut self, idx: usize) -> RefEntry {
        let entry = self.entries.swap_remove(idx);
        self.index.remove(&entry.id);
        if idx < self.entries.len() {
            let moved = self.entries[idx].id;
            self.index.insert(moved, idx);
        }
        if self.hand >= self.entries.len() {
            self.hand = 0;
        }
        self.used_kb -= entry.size_kb;
        entry
    }

    fn evict_one(&mut self) {
        // Soft entries with the visited bit set get a second chance; the bit
        // is cleared in passing so a full revolution always evicts something.
        loop {
            let entry = &mut self.entries[self.hand];
            if entry.soft && entry.visited {
                entry.visited = false;
                self.hand = (self.hand + 1) % self.entries.len();
                continue;
            }
            self.remove_at(self.hand);
            return;
        }
    }

    fn evict_to(&mut self, capacity_kb: u64) {
        while self.used_kb > capacity_kb && !self.entries.is_empty() {
            self.evict_one();
        }
    }
}

/// Capacity-bounded holder of evicted batch payloads.
pub struct RefCache {
    inner: Mutex<RefCacheInner>,
    capacity_kb: AtomicU64,
}

impl RefCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RefCacheInner::default()),
            capacity_kb: AtomicU64::new(0),
        }
    }

    pub fn set_capacity_kb(&self, capacity_kb: u64) {
        self.capacity_kb.store(capacity_kb, Ordering::Release);
        let mut inner = self.inner.lock();
        inner.evict_to(capacity_kb);
    }

    pub fn capacity_kb(&self) -> u64 {
        self.capacity_kb.load(Ordering::Acquire)
    }

    /// Parks an evicted payload. A zero-capacity cache drops it immediately,
    /// which makes the owner's weak reference dead on arrival.
    pub fn insert(&self, id: u64, batch: Arc<TupleBatch>, size_kb: u64, soft: bool) {
        let capacity = self.capacity_kb();
        if capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.index.get(&id) {
            let entry = &mut inner.entries[idx];
            entry.batch = batch;
            entry.soft = soft;
            entry.visited = soft;
            return;
        }
        let idx = inner.entries.len();
        inner.entries.push(RefEntry {
            id,
            batch,
            size_kb,
            soft,
            visited: soft,
        });
        inner.index.insert(id, idx);
        inner.used_kb += size_kb;
        inner.evict_to(capacity);
    }

    /// Drops the entry for a batch that was repromoted or removed.
    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.index.get(&id) {
            inner.remove_at(idx);
        }
    }

    pub fn used_kb(&self) -> u64 {
        self.inner.lock().used_kb
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RefCache {
    fn default() -> Self {
        Self::new()
    }
}
