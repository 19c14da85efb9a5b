//! # Buffer Manager
//!
//! The public face of the crate: creates and tracks tuple buffers, admits
//! batches against the global reserve pool, demotes the coldest batches to
//! disk under pressure, and serves them back on demand.
//!
//! ## Structure
//!
//! ```text
//! BufferManager ──> BufferCore (shared)
//!                    ├── ReservePool        admission budget + waiters
//!                    ├── EvictionIndex      active batches, coldest-first
//!                    ├── RefCache           payloads of evicted batches
//!                    ├── TupleBufferRegistry  weak id -> buffer index
//!                    ├── StorageManager     spill file factory (injected)
//!                    └── ValueCacheHandle   pressure-driven dedup toggle
//! ```
//!
//! Tuple buffers and managed batches hold a `Weak` reference to the core,
//! so a buffer that outlives its manager degrades to no-op bookkeeping
//! instead of keeping the whole subsystem alive.
//!
//! ## Locking order
//!
//! admission lock → eviction lock → per-batch slot → per-store compaction
//! lock → per-file write lock. Code may skip levels downward but never
//! acquires upward; the eviction pass unlinks its victim under the eviction
//! lock and persists it after release.

mod eviction;
mod registry;
mod state;

pub use state::CachedResults;

pub(crate) use eviction::EvictionIndex;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use eyre::Result;
use smallvec::SmallVec;
use sysinfo::System;
use tracing::debug;

use crate::buffer::{BatchTree, LobManager, TupleBuffer, TupleSourceType};
use crate::config::{
    BufferOptions, DEFAULT_REF_CACHE_DIVISOR, ONE_GIG_KB, RESERVE_ABOVE_GIG_PERCENT,
    RESERVE_FIRST_GIG_PERCENT, SYSTEM_OVERHEAD_KB,
};
use crate::memory::{RefCache, ReserveMode, ReservePool};
use crate::storage::{BatchStore, FileStore, StorageManager};
use crate::types::{DataType, SizeUtility, ValueCacheHandle};

use registry::TupleBufferRegistry;

static HOST_MEMORY_KB: OnceLock<u64> = OnceLock::new();

fn host_memory_kb() -> u64 {
    *HOST_MEMORY_KB.get_or_init(|| {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.total_memory() / 1024
    })
}

pub(crate) struct BufferCore {
    pub(crate) options: BufferOptions,
    pub(crate) reserve: ReservePool,
    pub(crate) evictions: EvictionIndex,
    pub(crate) ref_cache: RefCache,
    pub(crate) registry: TupleBufferRegistry,
    pub(crate) storage: Arc<dyn StorageManager>,
    pub(crate) value_cache: ValueCacheHandle,
    pub(crate) max_processing_kb: AtomicU64,
    ts_id: AtomicU64,
    pub(crate) batches_added: AtomicU64,
    pub(crate) read_count: AtomicU64,
    pub(crate) write_count: AtomicU64,
    pub(crate) read_attempts: AtomicU64,
    pub(crate) reference_hit: AtomicU64,
}

impl BufferCore {
    pub(crate) fn next_batch_id(&self) -> u64 {
        self.batches_added.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn next_ts_id(&self) -> u64 {
        self.ts_id.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn new_batch_store(&self, id: u64, schema: &[DataType]) -> Result<Arc<BatchStore>> {
        BatchStore::new(
            id,
            Arc::clone(&self.storage),
            SmallVec::from_slice(schema),
            LobManager::lob_indexes(schema),
            SizeUtility::new(self.value_cache.clone()),
        )
    }

    /// Unlinks a batch everywhere: eviction index, physical map, reference
    /// cache.
    pub(crate) fn cleanup_managed_batch(&self, store: &Arc<BatchStore>, begin_row: u64, id: u64) {
        self.evictions.remove_batch(store.id(), begin_row);
        store.free_slot(id);
        self.ref_cache.remove(id);
    }
}

pub struct BufferManager {
    core: Arc<BufferCore>,
}

impl BufferManager {
    /// A manager with default options; call [`initialize`](Self::initialize)
    /// before use.
    pub fn new(storage: Arc<dyn StorageManager>) -> Self {
        Self::with_options(storage, BufferOptions::default())
    }

    pub fn with_options(storage: Arc<dyn StorageManager>, options: BufferOptions) -> Self {
        Self {
            core: Arc::new(BufferCore {
                options,
                reserve: ReservePool::new(),
                evictions: EvictionIndex::new(),
                ref_cache: RefCache::new(),
                registry: TupleBufferRegistry::new(),
                storage,
                value_cache: ValueCacheHandle::new(),
                max_processing_kb: AtomicU64::new(0),
                ts_id: AtomicU64::new(0),
                batches_added: AtomicU64::new(0),
                read_count: AtomicU64::new(0),
                write_count: AtomicU64::new(0),
                read_attempts: AtomicU64::new(0),
                reference_hit: AtomicU64::new(0),
            }),
        }
    }

    /// Resolves the auto-sized budgets and fills the reserve pool.
    ///
    /// The reserve defaults to 50% of the first GiB of host memory plus 75%
    /// of the rest, after 300 MiB of assumed system overhead. The
    /// per-operator ceiling defaults to the larger of eight processor
    /// batches and a tenth of memory split across the active plans.
    pub fn initialize(&self) -> Result<()> {
        let options = &self.core.options;
        let memory_kb = host_memory_kb().saturating_sub(SYSTEM_OVERHEAD_KB);

        let max_reserve_kb = options.max_reserve_kb.unwrap_or_else(|| {
            let above_gig = memory_kb.saturating_sub(ONE_GIG_KB);
            above_gig * RESERVE_ABOVE_GIG_PERCENT / 100
                + memory_kb.min(ONE_GIG_KB) * RESERVE_FIRST_GIG_PERCENT / 100
        });
        self.core.reserve.set_budget(max_reserve_kb);

        let max_processing_kb = options.max_processing_kb.unwrap_or_else(|| {
            let per_plan = memory_kb / 10 / options.max_active_plans.max(1) as u64;
            (8 * options.processor_batch_size as u64).max(per_plan)
        });
        self.core
            .max_processing_kb
            .store(max_processing_kb, Ordering::Release);

        let ref_cache_kb = options
            .ref_cache_kb
            .unwrap_or(max_reserve_kb / DEFAULT_REF_CACHE_DIVISOR);
        self.core.ref_cache.set_capacity_kb(ref_cache_kb);

        debug!(
            max_reserve_kb,
            max_processing_kb, ref_cache_kb, "buffer manager initialized"
        );
        Ok(())
    }

    /// Allocates a fresh open buffer bound to its own spill store.
    pub fn create_tuple_buffer(
        &self,
        schema: &[DataType],
        group_name: &str,
        source_type: TupleSourceType,
    ) -> Result<Arc<TupleBuffer>> {
        let id = self.core.next_ts_id();
        let store = self.core.new_batch_store(id, schema)?;
        debug!(
            buffer = id,
            group = group_name,
            source = ?source_type,
            columns = schema.len(),
            "creating tuple buffer"
        );
        Ok(TupleBuffer::new(
            Arc::downgrade(&self.core),
            store,
            id.to_string(),
            SmallVec::from_slice(schema),
            self.core.options.processor_batch_size,
        ))
    }

    /// Allocates the two batch stores backing an ordered-tree index.
    pub fn create_stree(
        &self,
        schema: &[DataType],
        group_name: &str,
        key_length: usize,
    ) -> Result<BatchTree> {
        eyre::ensure!(
            key_length >= 1 && key_length <= schema.len(),
            "key length {key_length} out of range for a {}-column schema",
            schema.len()
        );
        let leaf_id = self.core.next_ts_id();
        let key_id = self.core.next_ts_id();
        let leaf_store = self.core.new_batch_store(leaf_id, schema)?;
        let key_store = self.core.new_batch_store(key_id, &schema[..key_length])?;
        debug!(tree = leaf_id, group = group_name, key_length, "creating batch tree");
        Ok(BatchTree::new(
            leaf_store,
            key_store,
            key_length,
            self.core.options.processor_batch_size,
        ))
    }

    /// Opens a raw file store through the injected storage manager.
    pub fn create_file_store(&self, name: &str) -> Result<Box<dyn FileStore>> {
        debug!(name, "creating file store");
        self.core.storage.create_file_store(name)
    }

    /// Reserves up to `count_kb` against the pool; runs one eviction pass
    /// after the admission lock is released.
    pub fn reserve_buffers(&self, count_kb: u64, mode: ReserveMode) -> Result<u64> {
        let granted = self.core.reserve.reserve(count_kb, mode)?;
        self.core.persist_batch_references();
        Ok(granted)
    }

    /// Returns KB to the pool and wakes reservation waiters.
    pub fn release_buffers(&self, count_kb: u64) {
        self.core.reserve.release(count_kb);
    }

    /// Registers a buffer for lookup by id. The registry holds only a weak
    /// reference.
    pub fn add_tuple_buffer(&self, buffer: &Arc<TupleBuffer>) {
        self.core.registry.add(buffer);
    }

    pub fn get_tuple_buffer(&self, id: &str) -> Option<Arc<TupleBuffer>> {
        self.core.registry.get(id)
    }

    /// Rebinds a buffer under a caller-chosen id and registers it.
    pub fn distribute_tuple_buffer(&self, id: &str, buffer: &Arc<TupleBuffer>) {
        buffer.set_id(id.to_string());
        self.core.registry.add(buffer);
    }

    /// Estimated KB of one full processor batch of the given schema.
    pub fn get_schema_size(&self, schema: &[DataType]) -> u64 {
        SizeUtility::new(self.core.value_cache.clone())
            .schema_size_kb(schema, self.core.options.processor_batch_size)
    }

    pub fn processor_batch_size(&self) -> usize {
        self.core.options.processor_batch_size
    }

    pub fn connector_batch_size(&self) -> usize {
        self.core.options.connector_batch_size
    }

    pub fn max_reserve_kb(&self) -> u64 {
        self.core.reserve.max_reserve_kb()
    }

    pub fn max_processing_kb(&self) -> u64 {
        self.core.max_processing_kb.load(Ordering::Acquire)
    }

    /// Remaining admission headroom; negative under FORCE reservations.
    pub fn reserve_batch_kb(&self) -> i64 {
        self.core.reserve.approx_remaining_kb()
    }

    /// Estimated KB held by resident and cached batches.
    pub fn active_batch_kb(&self) -> i64 {
        self.core.evictions.active_kb()
    }

    pub fn value_cache_enabled(&self) -> bool {
        self.core.value_cache.is_enabled()
    }

    pub fn set_value_cache_enabled(&self, enabled: bool) {
        self.core.value_cache.set_enabled(enabled);
    }

    /// Handle for consumers that adapt to the value-cache toggle.
    pub fn value_cache_handle(&self) -> ValueCacheHandle {
        self.core.value_cache.clone()
    }

    // Statistics.

    pub fn batches_added(&self) -> u64 {
        self.core.batches_added.load(Ordering::Acquire)
    }

    pub fn read_count(&self) -> u64 {
        self.core.read_count.load(Ordering::Acquire)
    }

    pub fn write_count(&self) -> u64 {
        self.core.write_count.load(Ordering::Acquire)
    }

    pub fn read_attempts(&self) -> u64 {
        self.core.read_attempts.load(Ordering::Acquire)
    }

    pub fn reference_hits(&self) -> u64 {
        self.core.reference_hit.load(Ordering::Acquire)
    }

    /// Wakes every reservation waiter with an interruption error.
    pub fn shutdown(&self) {
        self.core.reserve.shutdown();
    }

    pub(crate) fn core(&self) -> &Arc<BufferCore> {
        &self.core
    }
}
