//! Ordered batch containers handed to query operators.
//!
//! A [`TupleBuffer`] is an append-until-closed sequence of batches with a
//! unique id. The buffer owns its spill store; dropping the last strong
//! reference (the registry only ever holds a weak one) removes every batch
//! and deletes the backing file.
//!
//! [`BatchTree`] is the storage bundle of an ordered-tree index: two batch
//! stores (leaf pages and key pages) created together. The tree structure
//! itself lives with the query processor.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use eyre::{ensure, Result};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::buffer::{LobManager, ManagedBatch, TupleBatch};
use crate::error::BufferError;
use crate::manager::BufferCore;
use crate::storage::BatchStore;
use crate::types::DataType;

/// Origin of a tuple buffer, recorded for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleSourceType {
    /// Intermediate operator output.
    Processor,
    /// Final, shareable results.
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Open,
    Closed,
    Removed,
}

struct BatchEntry {
    begin_row: u64,
    len: u64,
    managed: Arc<ManagedBatch>,
}

struct BufferInner {
    entries: Vec<BatchEntry>,
    row_count: u64,
    state: BufferState,
}

pub struct TupleBuffer {
    id: RwLock<String>,
    schema: SmallVec<[DataType; 8]>,
    lob_columns: SmallVec<[usize; 4]>,
    store: Arc<BatchStore>,
    core: Weak<BufferCore>,
    batch_size: AtomicUsize,
    prefers_memory: AtomicBool,
    forward_only: AtomicBool,
    inner: Mutex<BufferInner>,
}

impl TupleBuffer {
    pub(crate) fn new(
        core: Weak<BufferCore>,
        store: Arc<BatchStore>,
        id: String,
        schema: SmallVec<[DataType; 8]>,
        batch_size: usize,
    ) -> Arc<Self> {
        let lob_columns = LobManager::lob_indexes(&schema);
        Arc::new(Self {
            id: RwLock::new(id),
            schema,
            lob_columns,
            store,
            core,
            batch_size: AtomicUsize::new(batch_size),
            prefers_memory: AtomicBool::new(false),
            forward_only: AtomicBool::new(false),
            inner: Mutex::new(BufferInner {
                entries: Vec::new(),
                row_count: 0,
                state: BufferState::Open,
            }),
        })
    }

    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    pub(crate) fn set_id(&self, id: String) {
        *self.id.write() = id;
    }

    pub fn schema(&self) -> &[DataType] {
        &self.schema
    }

    /// Whether any column of this buffer carries large objects.
    pub fn has_lobs(&self) -> bool {
        !self.lob_columns.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Acquire)
    }

    pub(crate) fn set_batch_size(&self, batch_size: usize) {
        self.batch_size.store(batch_size, Ordering::Release);
    }

    pub fn prefers_memory(&self) -> bool {
        self.prefers_memory.load(Ordering::Acquire)
    }

    /// Hints that evicted batches of this buffer should be retained with
    /// second-chance priority. Applies to existing batches as well.
    pub fn set_prefers_memory(&self, prefers: bool) {
        self.prefers_memory.store(prefers, Ordering::Release);
        let inner = self.inner.lock();
        for entry in &inner.entries {
            entry.managed.set_prefers_memory(prefers);
        }
    }

    pub fn is_forward_only(&self) -> bool {
        self.forward_only.load(Ordering::Acquire)
    }

    pub fn set_forward_only(&self, forward_only: bool) {
        self.forward_only.store(forward_only, Ordering::Release);
    }

    pub fn row_count(&self) -> u64 {
        self.inner.lock().row_count
    }

    pub fn state(&self) -> BufferState {
        self.inner.lock().state
    }

    pub(crate) fn store(&self) -> &Arc<BatchStore> {
        &self.store
    }

    /// Appends a batch of rows. The buffer stamps the starting row number;
    /// row ranges are contiguous and non-overlapping by construction.
    pub fn add_batch(&self, mut batch: TupleBatch) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure!(inner.state == BufferState::Open, BufferError::Closed);
        if batch.is_empty() {
            return Ok(());
        }
        let begin_row = inner.row_count + 1;
        batch.set_begin_row(begin_row);
        let len = batch.len();
        let managed = self
            .store
            .append(batch, self.prefers_memory(), &self.core)?;
        inner.entries.push(BatchEntry {
            begin_row,
            len,
            managed,
        });
        inner.row_count += len;
        Ok(())
    }

    /// Returns the batch containing `row` (1-based). Forward-only buffers
    /// read without re-caching, everything else repromotes on read.
    pub fn batch(&self, row: u64) -> Result<Arc<TupleBatch>> {
        let managed = {
            let inner = self.inner.lock();
            ensure!(inner.state != BufferState::Removed, BufferError::Closed);
            ensure!(
                row >= 1 && row <= inner.row_count,
                BufferError::not_found(format!("row {row} in buffer {}", self.id()))
            );
            let idx = inner.entries.partition_point(|e| e.begin_row <= row) - 1;
            Arc::clone(&inner.entries[idx].managed)
        };
        managed.get_batch(!self.is_forward_only(), &self.schema)
    }

    /// Starting row numbers of every batch, in order.
    pub(crate) fn batch_begin_rows(&self) -> Vec<u64> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| e.begin_row)
            .collect()
    }

    /// Marks the buffer read-only. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BufferState::Open {
            inner.state = BufferState::Closed;
        }
    }

    /// Drops every batch and deletes the backing file. Idempotent.
    pub fn remove(&self) -> Result<()> {
        let entries = {
            let mut inner = self.inner.lock();
            if inner.state == BufferState::Removed {
                return Ok(());
            }
            inner.state = BufferState::Removed;
            inner.row_count = 0;
            std::mem::take(&mut inner.entries)
        };
        for entry in &entries {
            entry.managed.remove();
        }
        self.store.remove()
    }
}

impl Drop for TupleBuffer {
    fn drop(&mut self) {
        let _ = self.remove();
    }
}

/// Storage bundle for an ordered-tree index: leaf batches and key batches
/// share the buffer manager but spill to separate stores.
pub struct BatchTree {
    leaf_store: Arc<BatchStore>,
    key_store: Arc<BatchStore>,
    key_length: usize,
    compare_indexes: Vec<usize>,
    batch_size: usize,
}

impl BatchTree {
    pub(crate) fn new(
        leaf_store: Arc<BatchStore>,
        key_store: Arc<BatchStore>,
        key_length: usize,
        batch_size: usize,
    ) -> Self {
        let mut compare_indexes = vec![0; key_length];
        for (i, slot) in compare_indexes.iter_mut().enumerate().skip(1) {
            *slot = i;
        }
        Self {
            leaf_store,
            key_store,
            key_length,
            compare_indexes,
            batch_size,
        }
    }

    pub fn leaf_store(&self) -> &Arc<BatchStore> {
        &self.leaf_store
    }

    pub fn key_store(&self) -> &Arc<BatchStore> {
        &self.key_store
    }

    pub fn key_length(&self) -> usize {
        self.key_length
    }

    pub fn compare_indexes(&self) -> &[usize] {
        &self.compare_indexes
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}
