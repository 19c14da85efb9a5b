//! # Configuration Module
//!
//! Centralizes the numeric constants and the runtime options of the buffer
//! manager. Interdependent values are co-located in [`constants`] and guarded
//! by compile-time assertions.
//!
//! Runtime knobs live in [`BufferOptions`]; `None` for a sizing field means
//! "auto", resolved from host memory during `BufferManager::initialize`.

pub mod constants;
pub use constants::*;

/// Tunable options of a [`crate::BufferManager`].
///
/// Sizing fields left as `None` are computed during `initialize` from the
/// host's total memory.
#[derive(Debug, Clone)]
pub struct BufferOptions {
    /// Rows per batch produced by connector-side sources.
    pub connector_batch_size: usize,
    /// Rows per batch consumed by processing operators.
    pub processor_batch_size: usize,
    /// Upper bound of the reserve pool in KB; `None` auto-sizes from RAM.
    pub max_reserve_kb: Option<u64>,
    /// Per-operator processing ceiling in KB; `None` auto-sizes.
    pub max_processing_kb: Option<u64>,
    /// Hint used only to auto-compute `max_processing_kb`.
    pub max_active_plans: usize,
    /// When false, every evicted batch is retained with second-chance
    /// priority instead of evict-first priority.
    pub use_weak_references: bool,
    /// Capacity of the second-chance reference cache in KB; `None` defaults
    /// to `max_reserve_kb / 8`.
    pub ref_cache_kb: Option<u64>,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            connector_batch_size: DEFAULT_CONNECTOR_BATCH_SIZE,
            processor_batch_size: DEFAULT_PROCESSOR_BATCH_SIZE,
            max_reserve_kb: None,
            max_processing_kb: None,
            max_active_plans: DEFAULT_MAX_ACTIVE_PLANS,
            use_weak_references: true,
            ref_cache_kb: None,
        }
    }
}
