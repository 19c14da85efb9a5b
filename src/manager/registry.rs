//! Weakly-held index of tuple buffers by id.
//!
//! The registry never extends a buffer's lifetime: callers hold the strong
//! reference, the registry keeps a `Weak`. Every operation first purges
//! entries whose buffers have been dropped, so lookups after the owner went
//! away reliably miss.

use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::buffer::TupleBuffer;

#[derive(Default)]
pub(crate) struct TupleBufferRegistry {
    map: RwLock<HashMap<String, Weak<TupleBuffer>>>,
}

impl TupleBufferRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn purge(&self) {
        self.map.write().retain(|_, weak| weak.strong_count() > 0);
    }

    pub(crate) fn add(&self, buffer: &Arc<TupleBuffer>) {
        self.purge();
        self.map
            .write()
            .insert(buffer.id(), Arc::downgrade(buffer));
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<TupleBuffer>> {
        self.purge();
        self.map.read().get(id).and_then(Weak::upgrade)
    }

    /// All live buffers, strongly referenced for the duration of the call.
    pub(crate) fn live(&self) -> Vec<(String, Arc<TupleBuffer>)> {
        self.purge();
        self.map
            .read()
            .iter()
            .filter_map(|(id, weak)| weak.upgrade().map(|b| (id.clone(), b)))
            .collect()
    }
}
