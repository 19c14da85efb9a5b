//! Lifecycle of a single buffered batch.
//!
//! A `ManagedBatch` mediates between an in-memory [`TupleBatch`] and its
//! spill slot:
//!
//! ```text
//!            append                    persist
//! (created) ───────> Resident ──────────────────────> Reclaimable
//!                     active=Some                      active=None
//!                     persistent=false                 reference=Some
//!                        │  ▲                          persistent=true
//!               get_batch│  │get_batch(cache)             │
//!                (cache) │  │  reference hit              │ payload dropped
//!                        ▼  │                             ▼
//!                      Cached <─────────────────────── Disk-only
//!                     active=Some      get_batch       active=None
//!                     persistent=true  (cache)         reference=None
//! ```
//!
//! `persistent` is monotonic: once a batch has been written its slot is
//! never rewritten, so re-demoting a cached batch costs nothing. The batch
//! sits in the manager's eviction index exactly while `active` is `Some`;
//! the index entry is removed by the eviction pass (which then calls
//! [`ManagedBatch::persist`]) or by the cleanup hook.
//!
//! All state transitions happen under the batch's own mutex, which by the
//! locking order may be taken while holding the eviction lock but never the
//! other way around.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use eyre::Result;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::buffer::{LobManager, TupleBatch};
use crate::error::BufferError;
use crate::manager::BufferCore;
use crate::storage::BatchStore;
use crate::types::DataType;

pub(crate) struct BatchSlot {
    pub(crate) active: Option<Arc<TupleBatch>>,
    pub(crate) reference: Option<Weak<TupleBatch>>,
    pub(crate) persistent: bool,
}

pub struct ManagedBatch {
    id: u64,
    begin_row: u64,
    size_estimate_kb: u64,
    soft_cache: AtomicBool,
    store: Arc<BatchStore>,
    core: Weak<BufferCore>,
    lobs: Option<LobManager>,
    slot: Mutex<BatchSlot>,
}

impl BatchStore {
    /// Admits a freshly appended batch: creates its managed wrapper in the
    /// resident state, records it in the eviction index, then lets the
    /// manager run one eviction pass.
    pub(crate) fn append(
        self: &Arc<Self>,
        batch: TupleBatch,
        soft_cache: bool,
        core: &Weak<BufferCore>,
    ) -> Result<Arc<ManagedBatch>> {
        let manager = core
            .upgrade()
            .ok_or_else(|| eyre::Report::new(BufferError::Closed))?;

        let size_estimate_kb = self.sizing().batch_size_kb(self.schema(), batch.len());
        let managed = Arc::new(ManagedBatch {
            id: manager.next_batch_id(),
            begin_row: batch.begin_row(),
            size_estimate_kb,
            soft_cache: AtomicBool::new(soft_cache),
            store: Arc::clone(self),
            core: Weak::clone(core),
            lobs: (!self.lob_columns().is_empty()).then(LobManager::new),
            slot: Mutex::new(BatchSlot {
                active: Some(Arc::new(batch)),
                reference: None,
                persistent: false,
            }),
        });
        trace!(
            store = self.id(),
            batch = managed.id,
            size_kb = size_estimate_kb,
            "adding batch to buffer manager"
        );
        manager.add_to_cache(&managed, false);
        manager.persist_batch_references();
        Ok(managed)
    }
}

impl ManagedBatch {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn begin_row(&self) -> u64 {
        self.begin_row
    }

    pub fn size_estimate_kb(&self) -> u64 {
        self.size_estimate_kb
    }

    pub fn store(&self) -> &Arc<BatchStore> {
        &self.store
    }

    pub fn set_prefers_memory(&self, prefers: bool) {
        self.soft_cache.store(prefers, Ordering::Release);
    }

    pub(crate) fn lock_slot(&self) -> MutexGuard<'_, BatchSlot> {
        self.slot.lock()
    }

    /// Whether the payload is currently held strongly in memory.
    pub fn is_active(&self) -> bool {
        self.slot.lock().active.is_some()
    }

    pub fn is_persistent(&self) -> bool {
        self.slot.lock().persistent
    }

    /// Returns the batch, from memory if resident, from the reference cache
    /// if the payload survived eviction, or from disk otherwise.
    ///
    /// With `cache = true` a resurrected batch is repromoted into the
    /// eviction index and charged against the active total.
    pub fn get_batch(
        self: &Arc<Self>,
        cache: bool,
        expected_types: &[DataType],
    ) -> Result<Arc<TupleBatch>> {
        let core = self.core.upgrade();
        if let Some(core) = &core {
            let reads = core.read_attempts.fetch_add(1, Ordering::AcqRel) + 1;
            trace!(
                store = self.store.id(),
                batch = self.id,
                reads,
                reference_hits = core.reference_hit.load(Ordering::Acquire),
                "getting batch"
            );
            core.touch_batch(self.store.id(), self.begin_row, cache, self.size_estimate_kb);
            core.persist_batch_references();
        }

        let mut slot = self.slot.lock();
        if let Some(batch) = &slot.active {
            return Ok(Arc::clone(batch));
        }

        if let Some(weak) = slot.reference.take() {
            if let Some(batch) = weak.upgrade() {
                if let Some(core) = &core {
                    core.reference_hit.fetch_add(1, Ordering::AcqRel);
                    core.ref_cache.remove(self.id);
                    if cache {
                        slot.active = Some(Arc::clone(&batch));
                        drop(slot);
                        core.add_to_cache(self, true);
                    }
                }
                return Ok(batch);
            }
        }

        if let Some(core) = &core {
            let total_reads = core.read_count.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(
                store = self.store.id(),
                batch = self.id,
                total_reads,
                "reading batch from disk"
            );
        }
        let batch = Arc::new(self.store.read_batch(
            self.id,
            self.begin_row,
            expected_types,
            self.lobs.as_ref(),
        )?);
        if cache {
            slot.active = Some(Arc::clone(&batch));
            drop(slot);
            if let Some(core) = &core {
                core.add_to_cache(self, true);
            }
        }
        Ok(batch)
    }

    /// Writes the batch to its store (first time only) and demotes the
    /// in-memory slot to a cache reference. No-op without an active payload.
    ///
    /// On a write error the slot is left untouched so the caller can retry.
    pub fn persist(&self) -> Result<()> {
        let mut slot = self.slot.lock();
        let Some(batch) = slot.active.clone() else {
            return Ok(());
        };

        if !slot.persistent {
            if let Some(lobs) = &self.lobs {
                for row in batch.rows() {
                    lobs.scan(row, self.store.lob_columns());
                }
            }
            if let Some(core) = self.core.upgrade() {
                let total_writes = core.write_count.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(
                    store = self.store.id(),
                    batch = self.id,
                    total_writes,
                    "writing batch to disk"
                );
            }
            let (offset, length) = self.store.write_batch(self.id, &batch)?;
            slot.persistent = true;
            trace!(
                store = self.store.id(),
                batch = self.id,
                offset,
                length,
                "batch written"
            );
        }

        if let Some(core) = self.core.upgrade() {
            let soft =
                self.soft_cache.load(Ordering::Acquire) || !core.options.use_weak_references;
            core.ref_cache
                .insert(self.id, Arc::clone(&batch), self.size_estimate_kb, soft);
        }
        slot.reference = Some(Arc::downgrade(&batch));
        slot.active = None;
        Ok(())
    }

    /// Drops this batch from the eviction index and frees its disk slot.
    pub fn remove(&self) {
        self.cleanup_hook().cleanup();
    }

    /// A weakly referencing handle that can outlive both the batch's store
    /// and the manager; invoking it after either is gone is a no-op.
    pub fn cleanup_hook(&self) -> CleanupHook {
        CleanupHook {
            id: self.id,
            begin_row: self.begin_row,
            store: Arc::downgrade(&self.store),
            core: Weak::clone(&self.core),
        }
    }
}

/// Frees a batch's bookkeeping when its owner goes away.
pub struct CleanupHook {
    id: u64,
    begin_row: u64,
    store: Weak<BatchStore>,
    core: Weak<BufferCore>,
}

impl CleanupHook {
    pub fn cleanup(&self) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        match self.core.upgrade() {
            Some(core) => core.cleanup_managed_batch(&store, self.begin_row, self.id),
            None => store.free_slot(self.id),
        }
    }
}
