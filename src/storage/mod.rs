//! # Storage Layer
//!
//! Contracts and implementations for the byte stores backing spilled
//! batches.
//!
//! ## Architecture
//!
//! ```text
//! BufferManager
//!     │ create_file_store(name)
//!     ▼
//! StorageManager (injected)          one per process
//!     │
//!     ▼
//! FileStore                          one per tuple buffer (plus auxiliaries)
//!     append-only writes, random positional reads, explicit removal
//!     │
//!     ▼
//! BatchStore                         physical map + compaction on top
//! ```
//!
//! A `FileStore` is deliberately minimal: `len`, `read_fully`, `append`,
//! `remove`. Everything else (offset bookkeeping, fragmentation accounting,
//! compaction) lives in [`BatchStore`], which treats the file as an opaque
//! append-only byte sequence.
//!
//! Two `StorageManager` implementations ship with the crate:
//!
//! - [`DiskStorageManager`]: one file per store under a base directory.
//!   Names are opaque and never reused by the buffer manager, but the
//!   manager still appends a monotonic suffix because compaction recreates
//!   a store under its original name.
//! - [`MemoryStorageManager`]: growable byte vectors, for tests and for
//!   workloads that must never touch disk.
//!
//! ## Thread Safety
//!
//! Implementations are `Send + Sync`; writes are internally serialized per
//! store. Positional reads never move a shared cursor, so concurrent
//! readers need no coordination.

mod batch_store;
mod file_store;

pub use batch_store::BatchStore;
pub use file_store::{DiskStorageManager, MemoryStorageManager};

use std::io::{self, Read, Write};

use eyre::Result;

/// Append-only byte store with random positional reads.
pub trait FileStore: Send + Sync {
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;

    /// Fills `buf` from `offset`; a short read is an error.
    fn read_fully(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Appends `data` at the current end.
    fn append(&self, data: &[u8]) -> Result<()>;

    /// Deletes the backing resource. Idempotent.
    fn remove(&self) -> Result<()>;
}

/// Factory for [`FileStore`]s. Names are opaque strings derived from
/// monotonic buffer ids.
pub trait StorageManager: Send + Sync {
    fn create_file_store(&self, name: &str) -> Result<Box<dyn FileStore>>;
}

fn to_io_error(err: eyre::Report) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{err:#}"))
}

/// `Write` adapter over a [`FileStore`], for buffered serialization.
pub struct StoreWriter<'a> {
    store: &'a dyn FileStore,
}

impl<'a> StoreWriter<'a> {
    pub fn new(store: &'a dyn FileStore) -> Self {
        Self { store }
    }
}

impl Write for StoreWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.store.append(buf).map_err(to_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `Read` adapter over a byte range of a [`FileStore`].
pub struct StoreReader<'a> {
    store: &'a dyn FileStore,
    pos: u64,
    end: u64,
}

impl<'a> StoreReader<'a> {
    pub fn new(store: &'a dyn FileStore, offset: u64, len: u64) -> Self {
        Self {
            store,
            pos: offset,
            end: offset + len,
        }
    }
}

impl Read for StoreReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.end {
            return Ok(0);
        }
        let n = buf.len().min((self.end - self.pos) as usize);
        self.store
            .read_fully(self.pos, &mut buf[..n])
            .map_err(to_io_error)?;
        self.pos += n as u64;
        Ok(n)
    }
}
