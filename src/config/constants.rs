//! # Configuration Constants
//!
//! This module centralizes all numeric configuration values, grouping
//! interdependent constants together. Constants that depend on each other are
//! co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! IO_BUFFER_SIZE (16 KiB)
//!       │
//!       ├─> batch serialization streams (BufWriter / BufReader capacity)
//!       │
//!       └─> compaction copy buffer (one chunk per read/write pass)
//!
//! COMPACTION_THRESHOLD_BYTES (32 MiB)
//!       │
//!       └─> compaction predicate: file length must exceed this AND
//!           unused_space * COMPACTION_WASTE_NUM > length * COMPACTION_WASTE_DEN
//!
//! EVICTION_LOW_WATER_{NUM,DEN} (4/5)
//!       │
//!       └─> the eviction pass keeps demoting batches while
//!           active_batch_kb * DEN > reserve_batch_kb * NUM
//!
//! VALUE_CACHE_ENABLE_DIVISOR (4) / VALUE_CACHE_DISABLE_DIVISOR (8)
//!       │
//!       └─> hysteresis band for the value-cache toggle; DISABLE must be the
//!           larger divisor (smaller fraction) or the toggle oscillates
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions below:
//!
//! 1. `EVICTION_LOW_WATER_NUM < EVICTION_LOW_WATER_DEN` (the low-water mark is
//!    a true fraction; otherwise eviction would never stop)
//! 2. `VALUE_CACHE_DISABLE_DIVISOR > VALUE_CACHE_ENABLE_DIVISOR` (hysteresis)
//! 3. `IO_BUFFER_SIZE` is a power of two (stream capacities and the compaction
//!    chunking assume it)

// ============================================================================
// BATCH SIZING
// ============================================================================

/// Rows per batch produced by connector-side sources.
pub const DEFAULT_CONNECTOR_BATCH_SIZE: usize = 256;

/// Rows per batch consumed by processing operators. Also the row count used
/// by schema-size estimation.
pub const DEFAULT_PROCESSOR_BATCH_SIZE: usize = 256;

/// Default number of concurrently active plans; only used to auto-compute the
/// per-operator processing ceiling.
pub const DEFAULT_MAX_ACTIVE_PLANS: usize = 20;

// ============================================================================
// I/O AND COMPACTION
// These constants are tightly coupled to the spill-file layout
// ============================================================================

/// Buffered stream capacity for batch serialization and the chunk size of the
/// compaction copy loop (16 KiB).
pub const IO_BUFFER_SIZE: usize = 1 << 14;

/// Spill files smaller than this are never compacted (32 MiB).
pub const COMPACTION_THRESHOLD_BYTES: u64 = 1 << 25;

/// Compaction waste ratio: compact when `unused * NUM > length * DEN`,
/// i.e. at least 75% of the file is dead space.
pub const COMPACTION_WASTE_NUM: u64 = 4;
pub const COMPACTION_WASTE_DEN: u64 = 3;

// ============================================================================
// MEMORY PRESSURE
// ============================================================================

/// Low-water fraction of the reserve pool: the eviction pass runs until
/// `active_batch_kb <= reserve_batch_kb * NUM / DEN`.
pub const EVICTION_LOW_WATER_NUM: i64 = 4;
pub const EVICTION_LOW_WATER_DEN: i64 = 5;

/// Value caching turns on when live memory exceeds `max_reserve / 4` (25%).
pub const VALUE_CACHE_ENABLE_DIVISOR: i64 = 4;

/// Value caching turns off when live memory drops below `max_reserve / 8`
/// (12.5%).
pub const VALUE_CACHE_DISABLE_DIVISOR: i64 = 8;

/// Interval of one reservation wait; the waiter's target halves after each.
pub const RESERVE_WAIT_INTERVAL_MS: u64 = 100;

/// Fraction of the reserve budget given to the second-chance reference cache
/// when not configured explicitly (`max_reserve_kb / 8`).
pub const DEFAULT_REF_CACHE_DIVISOR: u64 = 8;

// ============================================================================
// BUDGET AUTO-SIZING
// Host-memory heuristic: 50% of the first GiB plus 75% of the rest, after
// subtracting fixed system overhead
// ============================================================================

/// Assumed overhead of the host process and system (300 MiB, in KB).
pub const SYSTEM_OVERHEAD_KB: u64 = 300 * 1024;

/// One GiB expressed in KB, the knee of the auto-sizing curve.
pub const ONE_GIG_KB: u64 = 1024 * 1024;

/// Percentage of memory above the first GiB granted to the reserve pool.
pub const RESERVE_ABOVE_GIG_PERCENT: u64 = 75;

/// Percentage of the first GiB granted to the reserve pool.
pub const RESERVE_FIRST_GIG_PERCENT: u64 = 50;

// ============================================================================
// SIZE ESTIMATION OVERHEADS
// ============================================================================

/// Estimated fixed overhead per column of a row (pointer + alignment).
pub const COLUMN_OVERHEAD_BYTES: u64 = 8;

/// Estimated fixed overhead per row (header + container bookkeeping).
pub const ROW_OVERHEAD_BYTES: u64 = 36;

const _: () = assert!(
    EVICTION_LOW_WATER_NUM < EVICTION_LOW_WATER_DEN,
    "eviction low-water mark must be a fraction below 1 or eviction never terminates"
);

const _: () = assert!(
    VALUE_CACHE_DISABLE_DIVISOR > VALUE_CACHE_ENABLE_DIVISOR,
    "value-cache hysteresis requires the disable threshold below the enable threshold"
);

const _: () = assert!(
    (IO_BUFFER_SIZE & (IO_BUFFER_SIZE - 1)) == 0,
    "I/O buffer size must be a power of two"
);
