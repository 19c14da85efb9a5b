//! Snapshot transfer of live tuple buffers.
//!
//! Serializes the registry (or one named buffer) so cached results can be
//! replicated to another node. The stream is a flat little-endian framing:
//!
//! ```text
//! per buffer:
//!     id: u32 length + UTF-8 bytes
//!     row_count: u32
//!     batch_size: u32
//!     type_count: u16, then per column: type name (u32 length + UTF-8)
//!     prefers_memory: u8
//!     per batch, in row order:
//!         begin_row: u64
//!         batch in wire format, types forced onto the wire
//! ```
//!
//! Restore rebuilds each buffer through the normal append path, so restored
//! batches are admitted, spilled, and evicted like any others. A short or
//! corrupt stream removes the partially built buffer before failing.

use std::io::{Read, Write};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::buffer::{codec, TupleBuffer, TupleSourceType};
use crate::error::BufferError;
use crate::types::DataType;

use super::BufferManager;

impl BufferManager {
    /// Writes every live registered buffer to `out`.
    pub fn get_state<W: Write>(&self, out: &mut W) -> Result<()> {
        for (id, buffer) in self.core().registry.live() {
            codec::write_string(out, &id)?;
            write_buffer_state(&buffer, out)?;
        }
        Ok(())
    }

    /// Writes one registered buffer to `out`, without the id framing of the
    /// full-registry stream; a miss writes nothing.
    pub fn get_state_for<W: Write>(&self, id: &str, out: &mut W) -> Result<()> {
        if let Some(buffer) = self.get_tuple_buffer(id) {
            write_buffer_state(&buffer, out)?;
        }
        Ok(())
    }

    /// Restores every buffer framed in `input`, registering each under its
    /// transported id.
    ///
    /// The registry holds buffers weakly, so the restored buffers are
    /// returned and live exactly as long as the caller keeps them.
    pub fn set_state<R: Read>(&self, input: &mut R) -> Result<Vec<Arc<TupleBuffer>>> {
        let mut restored = Vec::new();
        while let Some(id_len) = codec::read_u32_opt(input)? {
            let mut id_bytes = vec![0u8; id_len as usize];
            codec::read_exact(input, &mut id_bytes)?;
            let id = String::from_utf8(id_bytes)
                .map_err(|_| BufferError::format("invalid UTF-8 in buffer id"))?;
            restored.push(self.set_tuple_buffer_state(&id, input)?);
        }
        Ok(restored)
    }

    /// Restores one un-framed buffer under `id`, unless a live one is
    /// already registered (which is then returned instead).
    pub fn set_state_for<R: Read>(&self, id: &str, input: &mut R) -> Result<Arc<TupleBuffer>> {
        match self.get_tuple_buffer(id) {
            Some(existing) => Ok(existing),
            None => self.set_tuple_buffer_state(id, input),
        }
    }

    fn set_tuple_buffer_state<R: Read>(
        &self,
        id: &str,
        input: &mut R,
    ) -> Result<Arc<TupleBuffer>> {
        let row_count = codec::read_u32(input)? as u64;
        let batch_size = codec::read_u32(input)? as usize;
        let type_count = codec::read_u16(input)? as usize;
        let mut schema: SmallVec<[DataType; 8]> = SmallVec::with_capacity(type_count);
        for _ in 0..type_count {
            let name = codec::read_string(input)?;
            let data_type = DataType::from_type_name(&name).ok_or_else(|| {
                eyre::Report::new(BufferError::format(format!("unknown column type '{name}'")))
            })?;
            schema.push(data_type);
        }
        let prefers_memory = codec::read_u8(input)? != 0;

        let buffer = self.create_tuple_buffer(&schema, "cached", TupleSourceType::Final)?;
        buffer.set_batch_size(batch_size.max(1));
        buffer.set_id(id.to_string());
        buffer.set_prefers_memory(prefers_memory);
        debug!(buffer = id, row_count, "restoring tuple buffer state");

        let mut restored_rows = 0u64;
        while restored_rows < row_count {
            let result = read_state_batch(input);
            let batch = match result {
                Ok(batch) if batch.is_empty() => {
                    let _ = buffer.remove();
                    bail!(BufferError::format(format!(
                        "empty batch in state stream for buffer {id}"
                    )));
                }
                Ok(batch) => batch,
                Err(e) => {
                    let _ = buffer.remove();
                    return Err(e.wrap_err(format!("restoring buffer {id}")));
                }
            };
            restored_rows += batch.len();
            if let Err(e) = buffer.add_batch(batch) {
                let _ = buffer.remove();
                return Err(e.wrap_err(format!("restoring buffer {id}")));
            }
        }
        buffer.close();
        self.add_tuple_buffer(&buffer);
        Ok(buffer)
    }

    /// Accepted for interface compatibility with the replication layer;
    /// addresses play no role in buffer management.
    pub fn set_local_address(&self, _address: &str) {}

    /// Accepted for interface compatibility with the replication layer.
    pub fn dropped_members(&self, _addresses: &[String]) {}
}

fn write_buffer_state<W: Write>(buffer: &Arc<TupleBuffer>, out: &mut W) -> Result<()> {
    let schema = buffer.schema();
    codec::write_u32(out, buffer.row_count() as u32)?;
    codec::write_u32(out, buffer.batch_size() as u32)?;
    codec::write_u16(out, schema.len() as u16)?;
    for t in schema {
        codec::write_string(out, t.type_name())?;
    }
    codec::write_u8(out, buffer.prefers_memory() as u8)?;
    for begin_row in buffer.batch_begin_rows() {
        let batch = buffer
            .batch(begin_row)
            .wrap_err_with(|| format!("snapshotting buffer {}", buffer.id()))?;
        codec::write_u64(out, batch.begin_row())?;
        codec::encode(&batch, Some(schema), out)?;
    }
    Ok(())
}

fn read_state_batch<R: Read>(input: &mut R) -> Result<crate::buffer::TupleBatch> {
    let _begin_row = codec::read_u64(input)?;
    codec::decode(input, &[])
}

/// Container pairing a result buffer with its cache identity, replicated
/// alongside the result cache.
///
/// LOB payloads are process-local, so entries over LOB-bearing buffers can
/// be prepared for distribution but refuse to restore on another node.
pub struct CachedResults {
    id: String,
    has_lobs: bool,
    results: Mutex<Option<Arc<TupleBuffer>>>,
}

impl CachedResults {
    pub fn new(results: &Arc<TupleBuffer>) -> Self {
        Self {
            id: results.id(),
            has_lobs: results.has_lobs(),
            results: Mutex::new(Some(Arc::clone(results))),
        }
    }

    /// An entry as it arrives from a serialized cache: identity only, the
    /// transient results reattach on [`restore`](Self::restore).
    pub fn detached(id: impl Into<String>, has_lobs: bool) -> Self {
        Self {
            id: id.into(),
            has_lobs,
            results: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has_lobs(&self) -> bool {
        self.has_lobs
    }

    pub fn results(&self) -> Option<Arc<TupleBuffer>> {
        self.results.lock().clone()
    }

    /// Publishes the results into the manager's registry for distribution.
    pub fn prepare(&self, manager: &BufferManager) -> Result<()> {
        let guard = self.results.lock();
        let results = guard
            .as_ref()
            .ok_or_else(|| eyre::Report::new(BufferError::Closed))?;
        ensure!(
            !results.is_forward_only(),
            "forward-only results cannot be distributed"
        );
        manager.distribute_tuple_buffer(&self.id, results);
        Ok(())
    }

    /// Reattaches the results from the local registry. Returns `false` when
    /// the entry cannot be used on this node (LOB-bearing buffers never
    /// restore remotely).
    pub fn restore(&self, manager: &BufferManager) -> bool {
        let mut guard = self.results.lock();
        if guard.is_none() {
            if self.has_lobs {
                warn!(id = %self.id, "refusing to restore cached results with LOBs");
                return false;
            }
            match manager.get_tuple_buffer(&self.id) {
                Some(buffer) => *guard = Some(buffer),
                None => return false,
            }
        }
        true
    }
}
