//! Batch memory-footprint estimation.
//!
//! Estimates are deliberately coarse: they must be cheap, deterministic, and
//! monotonically consistent so eviction decisions are stable, not exact.
//! Variable-width types use a fixed average payload; when value caching is
//! active the cacheable types are assumed to deduplicate to roughly half.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{COLUMN_OVERHEAD_BYTES, ROW_OVERHEAD_BYTES};
use crate::types::DataType;

/// Shared toggle for value caching.
///
/// Injected into every consumer that adjusts its behavior to memory
/// pressure; flipped only by the buffer manager's eviction pass or its
/// explicit setter.
#[derive(Debug, Clone, Default)]
pub struct ValueCacheHandle {
    enabled: Arc<AtomicBool>,
}

impl ValueCacheHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

/// Per-store size estimator.
#[derive(Debug, Clone)]
pub struct SizeUtility {
    value_cache: ValueCacheHandle,
}

impl SizeUtility {
    pub fn new(value_cache: ValueCacheHandle) -> Self {
        Self { value_cache }
    }

    /// Estimated heap bytes of one value of the declared type.
    pub fn value_size_bytes(value_cache_enabled: bool, data_type: DataType) -> u64 {
        let base = match data_type {
            DataType::Boolean => 1,
            DataType::Integer => 12,
            DataType::Long => 16,
            DataType::Double => 16,
            DataType::String => 128,
            DataType::Binary => 256,
            // References only; the payload lives outside the tuple.
            DataType::Blob | DataType::Clob => 64,
        };
        if value_cache_enabled && Self::dedupes(data_type) {
            base / 2
        } else {
            base
        }
    }

    fn dedupes(data_type: DataType) -> bool {
        matches!(
            data_type,
            DataType::String | DataType::Binary | DataType::Long | DataType::Double
        )
    }

    fn row_size_bytes(&self, types: &[DataType]) -> u64 {
        let cached = self.value_cache.is_enabled();
        let values: u64 = types
            .iter()
            .map(|t| Self::value_size_bytes(cached, *t))
            .sum();
        values + COLUMN_OVERHEAD_BYTES * types.len() as u64 + ROW_OVERHEAD_BYTES
    }

    /// Estimated KB footprint of a batch of `row_count` rows. At least 1.
    pub fn batch_size_kb(&self, types: &[DataType], row_count: u64) -> u64 {
        (self.row_size_bytes(types) * row_count / 1024).max(1)
    }

    /// Estimated KB footprint of a full processor batch of the given schema.
    /// At least 1.
    pub fn schema_size_kb(&self, types: &[DataType], processor_batch_size: usize) -> u64 {
        (self.row_size_bytes(types) * processor_batch_size as u64 / 1024).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> SizeUtility {
        SizeUtility::new(ValueCacheHandle::new())
    }

    #[test]
    fn test_estimate_is_at_least_one_kb() {
        let sizing = fixture();
        assert_eq!(sizing.batch_size_kb(&[DataType::Boolean], 1), 1);
        assert_eq!(sizing.schema_size_kb(&[], 1), 1);
    }

    #[test]
    fn test_estimate_monotone_in_rows() {
        let sizing = fixture();
        let types = [DataType::Integer, DataType::String];
        let small = sizing.batch_size_kb(&types, 64);
        let large = sizing.batch_size_kb(&types, 256);
        assert!(large >= small);
    }

    #[test]
    fn test_value_cache_shrinks_cacheable_types() {
        let handle = ValueCacheHandle::new();
        let sizing = SizeUtility::new(handle.clone());
        let types = [DataType::String; 4];

        let plain = sizing.batch_size_kb(&types, 256);
        handle.set_enabled(true);
        let deduped = sizing.batch_size_kb(&types, 256);
        assert!(deduped < plain);
    }

    #[test]
    fn test_boolean_unaffected_by_value_cache() {
        assert_eq!(
            SizeUtility::value_size_bytes(true, DataType::Boolean),
            SizeUtility::value_size_bytes(false, DataType::Boolean)
        );
    }
}
