//! Concrete [`FileStore`] implementations.
//!
//! The disk store keeps one plain file per store under the manager's base
//! directory. Appends and positional reads go through a shared handle
//! guarded by a mutex; the buffer manager already serializes writers per
//! store, so the mutex is uncontended in practice.
//!
//! Backing files are transient: a store removes its file explicitly via
//! [`FileStore::remove`], and the `Drop` implementation removes it as a
//! backstop when the owning buffer disappears without an explicit removal.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::BufferError;

use super::{FileStore, StorageManager};

/// Creates one file per store under a base directory.
pub struct DiskStorageManager {
    base_path: PathBuf,
    // Compaction recreates a store under its original name; the suffix keeps
    // the paths distinct.
    counter: AtomicU64,
}

impl DiskStorageManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).wrap_err_with(|| {
            format!(
                "failed to create buffer directory '{}'",
                base_path.display()
            )
        })?;
        Ok(Self {
            base_path,
            counter: AtomicU64::new(0),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl StorageManager for DiskStorageManager {
    fn create_file_store(&self, name: &str) -> Result<Box<dyn FileStore>> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = self.base_path.join(format!("b_{name}_{n}.buf"));
        debug!(path = %path.display(), "creating file store");
        Ok(Box::new(DiskFileStore::create(path)?))
    }
}

struct DiskFileStore {
    path: PathBuf,
    file: Mutex<File>,
    removed: AtomicBool,
}

impl DiskFileStore {
    fn create(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create spill file '{}'", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            removed: AtomicBool::new(false),
        })
    }
}

impl FileStore for DiskFileStore {
    fn len(&self) -> Result<u64> {
        let file = self.file.lock();
        let meta = file
            .metadata()
            .map_err(|e| BufferError::io("reading spill file length", e))?;
        Ok(meta.len())
    }

    fn read_fully(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| BufferError::io("seeking spill file", e))?;
        file.read_exact(buf)
            .map_err(|e| BufferError::io("reading spill file", e))?;
        Ok(())
    }

    fn append(&self, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))
            .map_err(|e| BufferError::io("seeking spill file end", e))?;
        file.write_all(data)
            .map_err(|e| BufferError::io("appending to spill file", e))?;
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        if self.removed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BufferError::io(
                format!("removing spill file '{}'", self.path.display()),
                e,
            )
            .into()),
        }
    }
}

impl Drop for DiskFileStore {
    fn drop(&mut self) {
        let _ = FileStore::remove(self);
    }
}

/// In-memory stores for tests and diskless operation.
#[derive(Default)]
pub struct MemoryStorageManager;

impl MemoryStorageManager {
    pub fn new() -> Self {
        Self
    }
}

impl StorageManager for MemoryStorageManager {
    fn create_file_store(&self, _name: &str) -> Result<Box<dyn FileStore>> {
        Ok(Box::new(MemoryFileStore {
            data: Mutex::new(Vec::new()),
            removed: AtomicBool::new(false),
        }))
    }
}

struct MemoryFileStore {
    data: Mutex<Vec<u8>>,
    removed: AtomicBool,
}

impl MemoryFileStore {
    fn ensure_open(&self) -> Result<()> {
        if self.removed.load(Ordering::Acquire) {
            return Err(BufferError::io(
                "accessing removed store",
                std::io::Error::new(std::io::ErrorKind::NotFound, "store removed"),
            )
            .into());
        }
        Ok(())
    }
}

impl FileStore for MemoryFileStore {
    fn len(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.data.lock().len() as u64)
    }

    fn read_fully(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        let data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(BufferError::io(
                "reading memory store",
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read"),
            )
            .into());
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn append(&self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.data.lock().extend_from_slice(data);
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        self.removed.store(true, Ordering::Release);
        self.data.lock().clear();
        Ok(())
    }
}
