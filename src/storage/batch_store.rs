//! Per-tuple-buffer spill store.
//!
//! A `BatchStore` owns one append-only [`FileStore`] plus the physical map
//! `batch id → (offset, length)`. Batches are only ever appended; freeing a
//! batch just drops its map entry and counts the hole in `unused_space`.
//! When the file exceeds the compaction threshold and at least 75% of it is
//! dead space, the next writer rewrites the live regions into a fresh file
//! in ascending offset order and swaps it in.
//!
//! ## Locking
//!
//! The `file` RwLock is the compaction lock: readers hold it shared while
//! consuming serialized bytes, the compactor holds it exclusively while
//! copying and swapping. Appenders additionally serialize on `append_lock`
//! inside the shared region so the offset they record matches where their
//! bytes landed. Compaction is never triggered from inside a batch read.

use std::io::{BufReader, BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::buffer::{codec, LobManager, TupleBatch};
use crate::config::{
    COMPACTION_THRESHOLD_BYTES, COMPACTION_WASTE_DEN, COMPACTION_WASTE_NUM, IO_BUFFER_SIZE,
};
use crate::error::BufferError;
use crate::types::{DataType, SizeUtility};

use super::{FileStore, StorageManager, StoreReader, StoreWriter};

pub struct BatchStore {
    id: u64,
    storage: Arc<dyn StorageManager>,
    file: RwLock<Box<dyn FileStore>>,
    append_lock: Mutex<()>,
    physical_map: Mutex<HashMap<u64, (u64, u64)>>,
    unused_space: AtomicU64,
    schema: SmallVec<[DataType; 8]>,
    lob_columns: SmallVec<[usize; 4]>,
    sizing: SizeUtility,
}

impl BatchStore {
    pub(crate) fn new(
        id: u64,
        storage: Arc<dyn StorageManager>,
        schema: SmallVec<[DataType; 8]>,
        lob_columns: SmallVec<[usize; 4]>,
        sizing: SizeUtility,
    ) -> Result<Arc<Self>> {
        let file = storage
            .create_file_store(&id.to_string())
            .wrap_err_with(|| format!("failed to create spill store {id}"))?;
        Ok(Arc::new(Self {
            id,
            storage,
            file: RwLock::new(file),
            append_lock: Mutex::new(()),
            physical_map: Mutex::new(HashMap::new()),
            unused_space: AtomicU64::new(0),
            schema,
            lob_columns,
            sizing,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn schema(&self) -> &[DataType] {
        &self.schema
    }

    pub fn lob_columns(&self) -> &[usize] {
        &self.lob_columns
    }

    pub(crate) fn sizing(&self) -> &SizeUtility {
        &self.sizing
    }

    /// Opens a subordinate store for auxiliary data (e.g. tree key pages).
    pub fn create_storage(&self, prefix: &str) -> Result<Box<dyn FileStore>> {
        self.storage.create_file_store(&format!("{}{prefix}", self.id))
    }

    /// Deletes the backing file.
    pub fn remove(&self) -> Result<()> {
        self.file.read().remove()
    }

    fn should_compact(file_len: u64, unused: u64) -> bool {
        file_len > COMPACTION_THRESHOLD_BYTES
            && unused * COMPACTION_WASTE_NUM > file_len * COMPACTION_WASTE_DEN
    }

    /// Compacts if the waste predicate holds, re-checked under the write
    /// lock. Called by writers before appending, never by readers.
    fn maybe_compact(&self) -> Result<()> {
        {
            let file = self.file.read();
            if !Self::should_compact(file.len()?, self.unused_space.load(Ordering::Acquire)) {
                return Ok(());
            }
        }

        let mut file = self.file.write();
        let pre_size = file.len()?;
        if !Self::should_compact(pre_size, self.unused_space.load(Ordering::Acquire)) {
            return Ok(());
        }

        let new_store = self
            .storage
            .create_file_store(&self.id.to_string())
            .wrap_err("failed to create compaction target")?;

        let mut map = self.physical_map.lock();
        let mut live: Vec<(u64, (u64, u64))> = map.iter().map(|(k, v)| (*k, *v)).collect();
        live.sort_by_key(|(_, (offset, _))| *offset);

        let mut buffer = vec![0u8; IO_BUFFER_SIZE];
        for (batch_id, (old_offset, size)) in live {
            let new_offset = new_store.len()?;
            let mut copied = 0u64;
            while copied < size {
                let chunk = (size - copied).min(IO_BUFFER_SIZE as u64) as usize;
                file.read_fully(old_offset + copied, &mut buffer[..chunk])?;
                new_store.append(&buffer[..chunk])?;
                copied += chunk as u64;
            }
            map.insert(batch_id, (new_offset, size));
        }

        file.remove()?;
        let post_size = new_store.len()?;
        *file = new_store;
        self.unused_space.store(0, Ordering::Release);
        debug!(store = self.id, pre_size, post_size, "compacted spill store");
        Ok(())
    }

    /// Serializes `batch` to the end of the file and records its slot.
    /// Returns `(offset, length)`.
    pub(crate) fn write_batch(&self, id: u64, batch: &TupleBatch) -> Result<(u64, u64)> {
        self.maybe_compact()?;

        let file = self.file.read();
        let _append = self.append_lock.lock();
        let offset = file.len()?;
        let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, StoreWriter::new(&**file));
        codec::encode(batch, None, &mut writer)?;
        writer
            .flush()
            .map_err(|e| BufferError::io("flushing batch", e))?;
        drop(writer);
        let length = file.len()? - offset;
        self.physical_map.lock().insert(id, (offset, length));
        trace!(store = self.id, batch = id, offset, length, "batch written");
        Ok((offset, length))
    }

    /// Reads a batch back under the compaction read lock, stamping its row
    /// offset and rewriting LOB references when present.
    pub(crate) fn read_batch(
        &self,
        id: u64,
        begin_row: u64,
        expected_types: &[DataType],
        lobs: Option<&LobManager>,
    ) -> Result<TupleBatch> {
        let file = self.file.read();
        let (offset, length) = self
            .physical_map
            .lock()
            .get(&id)
            .copied()
            .ok_or_else(|| {
                eyre::Report::new(BufferError::not_found(format!(
                    "batch {id} in store {}",
                    self.id
                )))
            })?;

        let mut reader = BufReader::with_capacity(
            IO_BUFFER_SIZE,
            StoreReader::new(&**file, offset, length),
        );
        let mut batch = codec::decode(&mut reader, expected_types)?;
        batch.set_begin_row(begin_row);
        batch.clear_types();
        if let Some(lobs) = lobs {
            for row in batch.rows_mut() {
                lobs.rewrite(row, &self.lob_columns)?;
            }
        }
        Ok(batch)
    }

    /// Frees the disk slot of a removed batch, counting the hole.
    pub(crate) fn free_slot(&self, id: u64) {
        if let Some((_, length)) = self.physical_map.lock().remove(&id) {
            self.unused_space.fetch_add(length, Ordering::AcqRel);
        }
    }

    pub(crate) fn is_mapped(&self, id: u64) -> bool {
        self.physical_map.lock().contains_key(&id)
    }

    pub fn file_length(&self) -> Result<u64> {
        self.file.read().len()
    }

    pub fn unused_space_bytes(&self) -> u64 {
        self.unused_space.load(Ordering::Acquire)
    }

    /// Sum of all mapped slot lengths; with `unused_space_bytes` this must
    /// account for every byte of the file.
    pub fn mapped_bytes(&self) -> u64 {
        self.physical_map.lock().values().map(|(_, len)| *len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorageManager;
    use crate::types::{Value, ValueCacheHandle};
    use smallvec::smallvec;

    fn store() -> Arc<BatchStore> {
        BatchStore::new(
            1,
            Arc::new(MemoryStorageManager::new()),
            smallvec![DataType::Integer, DataType::String],
            smallvec![],
            SizeUtility::new(ValueCacheHandle::new()),
        )
        .unwrap()
    }

    fn batch(first: i32, rows: usize) -> TupleBatch {
        TupleBatch::new(
            (0..rows)
                .map(|i| {
                    vec![
                        Value::Integer(first + i as i32),
                        Value::String(format!("row-{}", first + i as i32)),
                    ]
                })
                .collect(),
        )
    }

    #[test]
    fn test_write_then_read_round_trips() {
        let store = store();
        let original = batch(10, 8);
        store.write_batch(7, &original).unwrap();

        let read = store
            .read_batch(7, 11, &[DataType::Integer, DataType::String], None)
            .unwrap();
        assert_eq!(read.begin_row(), 11);
        assert_eq!(read.rows(), original.rows());
    }

    #[test]
    fn test_missing_batch_is_not_found() {
        let store = store();
        let err = store
            .read_batch(99, 1, &[DataType::Integer, DataType::String], None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BufferError>(),
            Some(BufferError::NotFound { .. })
        ));
    }

    #[test]
    fn test_space_accounting_invariant() {
        let store = store();
        for id in 0..6u64 {
            store.write_batch(id, &batch(id as i32 * 10, 4)).unwrap();
        }
        for id in [0u64, 2, 4] {
            store.free_slot(id);
        }
        assert_eq!(
            store.mapped_bytes() + store.unused_space_bytes(),
            store.file_length().unwrap()
        );
    }

    #[test]
    fn test_free_slot_idempotent() {
        let store = store();
        store.write_batch(1, &batch(0, 4)).unwrap();
        let unused_after_first = {
            store.free_slot(1);
            store.unused_space_bytes()
        };
        store.free_slot(1);
        assert_eq!(store.unused_space_bytes(), unused_after_first);
    }

    #[test]
    fn test_compaction_predicate() {
        let threshold = COMPACTION_THRESHOLD_BYTES;
        assert!(!BatchStore::should_compact(threshold, threshold));
        assert!(!BatchStore::should_compact(threshold * 2, threshold));
        assert!(BatchStore::should_compact(threshold * 2, threshold * 2 - 1));
    }

    #[test]
    fn test_compaction_reclaims_dead_space() {
        let store = BatchStore::new(
            1,
            Arc::new(MemoryStorageManager::new()),
            smallvec![DataType::Binary],
            smallvec![],
            SizeUtility::new(ValueCacheHandle::new()),
        )
        .unwrap();
        let payload =
            |i: u64| TupleBatch::new(vec![vec![Value::Binary(vec![(i % 251) as u8; 100 * 1024])]]);

        for id in 0..400u64 {
            store.write_batch(id, &payload(id)).unwrap();
        }
        let pre_size = store.file_length().unwrap();
        assert!(pre_size > COMPACTION_THRESHOLD_BYTES);

        // Free all but every fifth batch: ~80% of the file is dead space,
        // so the next writer compacts before appending.
        for id in 0..400u64 {
            if id % 5 != 0 {
                store.free_slot(id);
            }
        }
        store.write_batch(400, &payload(400)).unwrap();
        assert!(
            store.file_length().unwrap() <= pre_size / 2,
            "compaction should have reclaimed the dead space"
        );

        for id in 401..600u64 {
            store.write_batch(id, &payload(id)).unwrap();
        }
        assert_eq!(
            store.mapped_bytes() + store.unused_space_bytes(),
            store.file_length().unwrap()
        );

        // Survivors read back intact after their offsets moved.
        let surviving = store.read_batch(0, 1, &[DataType::Binary], None).unwrap();
        assert_eq!(
            surviving.rows()[0][0],
            Value::Binary(vec![0u8; 100 * 1024])
        );
        let appended = store.read_batch(599, 1, &[DataType::Binary], None).unwrap();
        assert_eq!(
            appended.rows()[0][0],
            Value::Binary(vec![(599 % 251) as u8; 100 * 1024])
        );
    }
}
