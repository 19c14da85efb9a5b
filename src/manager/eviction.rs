//! Active-batch index and the eviction pass.
//!
//! Resident and cached batches are indexed twice: per store in a
//! `BTreeMap` keyed by starting row, and across stores in an
//! insertion-ordered list promoted on access, so the head of the list is
//! the least recently used store.
//!
//! ## Victim selection
//!
//! Within the coldest store, the victim is the greatest starting row at or
//! before `last_used - 1`, falling back to the very last batch when nothing
//! precedes the cursor. Scans are overwhelmingly forward, so the batch just
//! behind the read cursor is the least likely to be touched again soon; a
//! plain LRU would instead evict the batches the scan is about to revisit
//! on its next pass.
//!
//! The pass never holds the index lock across a `persist` call: the victim
//! is unlinked (and uncharged) first, then written outside the lock.
//! Failed persists are re-charged after the pass so the accounting stays
//! truthful and a later pass retries them.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::ManagedBatch;
use crate::config::{
    EVICTION_LOW_WATER_DEN, EVICTION_LOW_WATER_NUM, VALUE_CACHE_DISABLE_DIVISOR,
    VALUE_CACHE_ENABLE_DIVISOR,
};
use crate::manager::BufferCore;

struct StoreBatches {
    batches: BTreeMap<u64, Arc<ManagedBatch>>,
    last_used: Option<u64>,
}

#[derive(Default)]
struct EvictionInner {
    stores: HashMap<u64, StoreBatches>,
    // Insertion order, promoted on access; the front is the coldest store.
    order: VecDeque<u64>,
}

pub(crate) struct EvictionIndex {
    inner: Mutex<EvictionInner>,
    active_kb: AtomicI64,
}

impl EvictionIndex {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(EvictionInner::default()),
            active_kb: AtomicI64::new(0),
        }
    }

    /// Total estimated KB of indexed batches.
    pub(crate) fn active_kb(&self) -> i64 {
        self.active_kb.load(Ordering::Acquire)
    }

    /// Indexes a batch if (and only if) it still holds an active payload.
    /// The batch's slot stays locked through the insert so a concurrent
    /// demotion cannot leave a payload-less entry behind.
    pub(crate) fn insert_if_active(&self, mb: &Arc<ManagedBatch>, promote: bool) {
        let mut inner = self.inner.lock();
        let slot = mb.lock_slot();
        if slot.active.is_none() {
            return;
        }

        let store_id = mb.store().id();
        let EvictionInner { stores, order } = &mut *inner;
        let sb = match stores.entry(store_id) {
            hashbrown::hash_map::Entry::Occupied(entry) => {
                if promote {
                    order.retain(|s| *s != store_id);
                    order.push_back(store_id);
                }
                entry.into_mut()
            }
            hashbrown::hash_map::Entry::Vacant(entry) => {
                order.push_back(store_id);
                entry.insert(StoreBatches {
                    batches: BTreeMap::new(),
                    last_used: None,
                })
            }
        };
        let prev = sb.batches.insert(mb.begin_row(), Arc::clone(mb));
        debug_assert!(prev.is_none(), "batch indexed twice");
        self.active_kb
            .fetch_add(mb.size_estimate_kb() as i64, Ordering::AcqRel);
        drop(slot);
    }

    /// Records an access: promotes the store to most recently used and
    /// remembers the access point for victim selection. A non-caching read
    /// also unlinks the batch itself.
    pub(crate) fn touch(&self, store_id: u64, begin_row: u64, keep_cached: bool, size_kb: u64) {
        let mut inner = self.inner.lock();
        let EvictionInner { stores, order } = &mut *inner;
        let Some(sb) = stores.get_mut(&store_id) else {
            return;
        };
        let mut keep = true;
        if !keep_cached {
            if sb.batches.remove(&begin_row).is_some() {
                self.active_kb.fetch_sub(size_kb as i64, Ordering::AcqRel);
            }
            if sb.batches.is_empty() {
                keep = false;
            }
        }
        if keep {
            sb.last_used = Some(begin_row);
            order.retain(|s| *s != store_id);
            order.push_back(store_id);
        } else {
            stores.remove(&store_id);
            order.retain(|s| *s != store_id);
        }
    }

    /// Unlinks and uncharges the coldest eligible batch, or returns `None`
    /// once the active total is back under the low-water mark.
    pub(crate) fn pop_victim(&self, reserve_kb: i64) -> Option<Arc<ManagedBatch>> {
        let mut inner = self.inner.lock();
        let active = self.active_kb.load(Ordering::Acquire);
        if active == 0 || active * EVICTION_LOW_WATER_DEN < reserve_kb * EVICTION_LOW_WATER_NUM {
            return None;
        }

        let EvictionInner { stores, order } = &mut *inner;
        while let Some(&store_id) = order.front() {
            let Some(sb) = stores.get_mut(&store_id) else {
                order.pop_front();
                continue;
            };
            let key = sb
                .last_used
                .and_then(|last| sb.batches.range(..last).next_back().map(|(k, _)| *k))
                .or_else(|| sb.batches.keys().next_back().copied());
            let Some(key) = key else {
                stores.remove(&store_id);
                order.pop_front();
                continue;
            };
            if let Some(mb) = sb.batches.remove(&key) {
                self.active_kb
                    .fetch_sub(mb.size_estimate_kb() as i64, Ordering::AcqRel);
                if sb.batches.is_empty() {
                    stores.remove(&store_id);
                    order.pop_front();
                }
                return Some(mb);
            }
        }
        None
    }

    /// Unlinks a batch removed through its cleanup hook.
    pub(crate) fn remove_batch(&self, store_id: u64, begin_row: u64) {
        let mut inner = self.inner.lock();
        let EvictionInner { stores, order } = &mut *inner;
        if let Some(sb) = stores.get_mut(&store_id) {
            if let Some(mb) = sb.batches.remove(&begin_row) {
                self.active_kb
                    .fetch_sub(mb.size_estimate_kb() as i64, Ordering::AcqRel);
            }
            if sb.batches.is_empty() {
                stores.remove(&store_id);
                order.retain(|s| *s != store_id);
            }
        }
    }

    /// Recomputed sum of every indexed estimate; must equal `active_kb`.
    pub(crate) fn recount_kb(&self) -> i64 {
        self.inner
            .lock()
            .stores
            .values()
            .flat_map(|sb| sb.batches.values())
            .map(|mb| mb.size_estimate_kb() as i64)
            .sum()
    }

    /// Every indexed batch must still hold an active payload.
    pub(crate) fn all_entries_active(&self) -> bool {
        self.inner
            .lock()
            .stores
            .values()
            .flat_map(|sb| sb.batches.values())
            .all(|mb| mb.is_active())
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.inner
            .lock()
            .stores
            .values()
            .map(|sb| sb.batches.len())
            .sum()
    }
}

impl BufferCore {
    pub(crate) fn touch_batch(
        &self,
        store_id: u64,
        begin_row: u64,
        keep_cached: bool,
        size_kb: u64,
    ) {
        self.evictions.touch(store_id, begin_row, keep_cached, size_kb);
    }

    pub(crate) fn add_to_cache(&self, mb: &Arc<ManagedBatch>, promote: bool) {
        self.evictions.insert_if_active(mb, promote);
    }

    /// One eviction pass. Under the low-water mark this only adjusts the
    /// value-cache toggle; above it, batches are demoted coldest-first until
    /// the active total drops below `0.8 × reserve_batch_kb`.
    pub(crate) fn persist_batch_references(&self) {
        let active = self.evictions.active_kb();
        let reserve = self.reserve.approx_remaining_kb();
        if active == 0 || active <= reserve {
            let max_reserve = self.reserve.max_reserve_kb() as i64;
            let memory_count = active + max_reserve - reserve;
            if self.value_cache.is_enabled() {
                if memory_count < max_reserve / VALUE_CACHE_DISABLE_DIVISOR {
                    self.value_cache.set_enabled(false);
                }
            } else if memory_count > max_reserve / VALUE_CACHE_ENABLE_DIVISOR {
                self.value_cache.set_enabled(true);
            }
            return;
        }

        let mut failed = Vec::new();
        while let Some(victim) = self
            .evictions
            .pop_victim(self.reserve.approx_remaining_kb())
        {
            if let Err(e) = victim.persist() {
                debug!(
                    batch = victim.id(),
                    error = %e,
                    "failed to persist batch; it stays in memory and a later pass retries"
                );
                failed.push(victim);
            }
        }
        for mb in failed {
            self.add_to_cache(&mb, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{TupleBatch, TupleSourceType};
    use crate::config::BufferOptions;
    use crate::manager::BufferManager;
    use crate::storage::MemoryStorageManager;
    use crate::types::{DataType, Value};

    fn manager(max_reserve_kb: u64) -> BufferManager {
        let manager = BufferManager::with_options(
            Arc::new(MemoryStorageManager::new()),
            BufferOptions {
                max_reserve_kb: Some(max_reserve_kb),
                ref_cache_kb: Some(0),
                ..BufferOptions::default()
            },
        );
        manager.initialize().unwrap();
        manager
    }

    fn one_kb_batch(value: i32) -> TupleBatch {
        // One binary row estimates to 1 KB under the default size table.
        TupleBatch::new(vec![vec![Value::Binary(vec![value as u8; 64])]])
    }

    #[test]
    fn test_accounting_matches_index_contents() {
        let manager = manager(1024);
        let buffer = manager
            .create_tuple_buffer(&[DataType::Binary], "t", TupleSourceType::Processor)
            .unwrap();
        for i in 0..20 {
            buffer.add_batch(one_kb_batch(i)).unwrap();
        }
        let evictions = &manager.core().evictions;
        assert_eq!(evictions.active_kb(), evictions.recount_kb());
        assert!(evictions.all_entries_active());
        assert_eq!(evictions.entry_count(), 20);
    }

    #[test]
    fn test_eviction_drains_below_low_water() {
        let manager = manager(16);
        let buffer = manager
            .create_tuple_buffer(&[DataType::Binary], "t", TupleSourceType::Processor)
            .unwrap();
        for i in 0..64 {
            buffer.add_batch(one_kb_batch(i)).unwrap();
            assert!(
                manager.active_batch_kb() <= 16,
                "active total {} exceeded the reserve",
                manager.active_batch_kb()
            );
        }
        assert!(manager.write_count() > 0, "pressure must have spilled batches");
        let evictions = &manager.core().evictions;
        assert_eq!(evictions.active_kb(), evictions.recount_kb());
        assert!(evictions.all_entries_active());
    }

    #[test]
    fn test_victims_fall_behind_the_read_cursor() {
        let manager = manager(1024);
        let buffer = manager
            .create_tuple_buffer(&[DataType::Binary], "t", TupleSourceType::Processor)
            .unwrap();
        for i in 0..100 {
            buffer.add_batch(one_kb_batch(i)).unwrap();
        }
        // Forward scan up to row 80 marks the access point.
        for row in 1..=80 {
            let _ = buffer.batch(row).unwrap();
        }

        let evictions = &manager.core().evictions;
        let mut victims = Vec::new();
        // Pool is untouched (reserve = 1024 > active), so force victims out
        // directly with a low reserve target.
        while let Some(victim) = evictions.pop_victim(64) {
            victims.push(victim.begin_row());
        }
        assert!(!victims.is_empty());
        assert!(
            victims.iter().all(|row| (1..80).contains(row)),
            "victims {victims:?} must precede the cursor at 80"
        );
    }

    #[test]
    fn test_last_store_falls_back_to_tail_batch() {
        let manager = manager(1024);
        let buffer = manager
            .create_tuple_buffer(&[DataType::Binary], "t", TupleSourceType::Processor)
            .unwrap();
        for i in 0..10 {
            buffer.add_batch(one_kb_batch(i)).unwrap();
        }
        // No access recorded: the victim is the greatest starting row.
        let victim = manager.core().evictions.pop_victim(0).unwrap();
        assert_eq!(victim.begin_row(), 10);
    }

    #[test]
    fn test_coldest_store_is_evicted_first() {
        let manager = manager(1024);
        let cold = manager
            .create_tuple_buffer(&[DataType::Binary], "cold", TupleSourceType::Processor)
            .unwrap();
        let hot = manager
            .create_tuple_buffer(&[DataType::Binary], "hot", TupleSourceType::Processor)
            .unwrap();
        for i in 0..4 {
            cold.add_batch(one_kb_batch(i)).unwrap();
        }
        for i in 0..4 {
            hot.add_batch(one_kb_batch(i)).unwrap();
        }
        // Touch the cold store's batches through a read so insertion order
        // alone does not decide, then touch the hot store afterwards.
        let _ = cold.batch(1).unwrap();
        let _ = hot.batch(1).unwrap();

        let victim = manager.core().evictions.pop_victim(0).unwrap();
        assert_eq!(victim.store().id(), cold.store().id(), "cold store evicts first");
    }

    #[test]
    fn test_value_cache_toggles_with_pressure() {
        let manager = manager(64);
        let buffer = manager
            .create_tuple_buffer(&[DataType::Binary], "t", TupleSourceType::Processor)
            .unwrap();
        assert!(!manager.value_cache_enabled());

        // Fill to just under the reserve: live memory passes 25% of max.
        for i in 0..40 {
            buffer.add_batch(one_kb_batch(i)).unwrap();
        }
        assert!(manager.value_cache_enabled());

        // Dropping the buffer empties the index; the next pass falls below
        // 12.5% and turns the cache back off.
        drop(buffer);
        manager.core().persist_batch_references();
        assert!(!manager.value_cache_enabled());
    }
}
