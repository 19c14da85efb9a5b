//! # Batch Buffering
//!
//! The entities between a query operator and the storage layer:
//!
//! - [`TupleBatch`]: an immutable block of rows plus its wire codec
//! - [`LobManager`]: large-object reference tracking across serialization
//! - [`ManagedBatch`]: the per-batch lifecycle (resident, cached,
//!   reclaimable, on disk) and its cleanup hook
//! - [`TupleBuffer`]: the ordered, append-until-closed batch container
//!   operators actually hold
//! - [`BatchTree`]: the two-store bundle backing ordered-tree indexes

mod batch;
mod lobs;
mod managed;
mod tuple_buffer;

pub(crate) use batch::codec;

pub use batch::TupleBatch;
pub use lobs::LobManager;
pub use managed::{CleanupHook, ManagedBatch};
pub use tuple_buffer::{BatchTree, BufferState, TupleBuffer, TupleSourceType};
