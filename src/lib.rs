//! # spillbuf - Spilling Tuple-Batch Buffer Manager
//!
//! spillbuf is the buffering substrate of a federated query engine: the
//! row batches produced by query operators are held in memory against a
//! global KB budget, spilled to per-buffer append-only files when pressure
//! exceeds the budget, compacted when fragmentation grows, and served back
//! to operators on demand. Result caches, sort runs, hash tables, and
//! ordered-tree indexes are all built on this layer.
//!
//! ## Quick Start
//!
//! ```ignore
//! use spillbuf::{BufferManager, DiskStorageManager, DataType, TupleBatch, Value};
//! use spillbuf::TupleSourceType;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(DiskStorageManager::new("./spill")?);
//! let manager = BufferManager::new(storage);
//! manager.initialize()?;
//!
//! let buffer = manager.create_tuple_buffer(
//!     &[DataType::Integer, DataType::String],
//!     "orders",
//!     TupleSourceType::Processor,
//! )?;
//! buffer.add_batch(TupleBatch::new(vec![
//!     vec![Value::Integer(1), Value::String("first".into())],
//! ]))?;
//! buffer.close();
//!
//! let batch = buffer.batch(1)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │       Public API (BufferManager)            │
//! ├─────────────────────────────────────────────┤
//! │ TupleBuffer │ BatchTree │ CachedResults     │
//! ├─────────────────────────────────────────────┤
//! │ ManagedBatch lifecycle │ LobManager         │
//! ├─────────────────────────────────────────────┤
//! │ ReservePool │ EvictionIndex │ RefCache      │
//! ├─────────────────────────────────────────────┤
//! │ BatchStore (physical map + compaction)      │
//! ├─────────────────────────────────────────────┤
//! │ FileStore / StorageManager (append-only)    │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! Admission is governed by one signed KB pool: operators reserve before
//! materializing and release when done, with WAIT / FORCE / NO_WAIT
//! semantics. Appended batches are charged against the active total; when
//! it crosses the remaining reserve, the eviction pass demotes the coldest
//! batches (picked store-LRU, then just behind each store's read cursor) to
//! their spill files. Evicted payloads linger in a second-chance reference
//! cache so an early re-read skips the disk.
//!
//! ## Module Overview
//!
//! - [`config`]: constants and [`BufferOptions`]
//! - [`types`]: values, type descriptors, size estimation
//! - [`memory`]: reserve pool and reference cache
//! - [`storage`]: file-store contracts, disk/memory stores, batch stores
//! - [`buffer`]: batches, their codec, LOB tracking, tuple buffers
//! - [`manager`]: the buffer manager, eviction, registry, state transfer

pub mod buffer;
pub mod config;
pub mod error;
pub mod manager;
pub mod memory;
pub mod storage;
pub mod types;

pub use buffer::{BatchTree, BufferState, LobManager, TupleBatch, TupleBuffer, TupleSourceType};
pub use config::BufferOptions;
pub use error::BufferError;
pub use manager::{BufferManager, CachedResults};
pub use memory::ReserveMode;
pub use storage::{DiskStorageManager, FileStore, MemoryStorageManager, StorageManager};
pub use types::{DataType, LobHandle, LobRef, Value};
