//! Large-object reference tracking.
//!
//! LOB payloads live outside the tuple stream; tuples carry only references.
//! The manager records every reference seen on the write path so that after
//! a batch is deserialized, the opaque placeholder references can be pointed
//! back at the live payloads. LOB payloads are process-local: they do not
//! travel in spill files or snapshot streams.

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::error::BufferError;
use crate::types::{DataType, LobHandle, Value};

#[derive(Default)]
pub struct LobManager {
    references: Mutex<HashMap<String, Arc<LobHandle>>>,
}

impl LobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Column positions of LOB-bearing fields in the given schema.
    pub fn lob_indexes(types: &[DataType]) -> SmallVec<[usize; 4]> {
        types
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_lob())
            .map(|(i, _)| i)
            .collect()
    }

    /// Registers any newly seen live references in the LOB columns of a
    /// tuple. Placeholders are ignored.
    pub fn scan(&self, tuple: &[Value], lob_columns: &[usize]) {
        for &col in lob_columns {
            if let Some(Value::Lob(lob)) = tuple.get(col) {
                if let Some(handle) = &lob.handle {
                    self.references
                        .lock()
                        .entry(lob.id.clone())
                        .or_insert_with(|| Arc::clone(handle));
                }
            }
        }
    }

    /// Replaces placeholder references in a deserialized tuple with live
    /// ones looked up by id.
    pub fn rewrite(&self, tuple: &mut [Value], lob_columns: &[usize]) -> Result<()> {
        for &col in lob_columns {
            if let Some(Value::Lob(lob)) = tuple.get_mut(col) {
                if lob.handle.is_none() {
                    let handle = self
                        .references
                        .lock()
                        .get(&lob.id)
                        .cloned()
                        .ok_or_else(|| {
                            eyre::Report::new(BufferError::not_found(format!(
                                "lob reference {}",
                                lob.id
                            )))
                        })?;
                    lob.handle = Some(handle);
                }
            }
        }
        Ok(())
    }

    pub fn reference_count(&self) -> usize {
        self.references.lock().len()
    }
}
