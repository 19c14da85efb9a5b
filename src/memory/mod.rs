//! # Memory Pressure Management
//!
//! Two cooperating pieces:
//!
//! - [`ReservePool`]: the global KB budget that admits new active batches.
//!   Operators reserve before materializing and release when done; the
//!   eviction pass runs whenever admission detects pressure.
//! - [`RefCache`]: a capacity-bounded second-chance cache holding the
//!   payloads of evicted batches, so a re-read shortly after eviction avoids
//!   disk I/O when memory allows.
//!
//! ```text
//! +------------------------------------------------------------+
//! |                   max_reserve_kb (budget)                  |
//! |                                                            |
//! |  reserve_batch_kb  <- remaining admission headroom         |
//! |  active_batch_kb   <- resident + cached batch estimates    |
//! +------------------------------------------------------------+
//! |  ref cache (max_reserve_kb / 8 by default)                 |
//! |  evicted payloads, soft entries get a second chance        |
//! +------------------------------------------------------------+
//! ```
//!
//! The pool may go negative under FORCE reservations; the eviction pass
//! compensates by demoting batches until the active total drops below the
//! low-water mark.

mod ref_cache;
mod reserve;

pub use ref_cache::RefCache;
pub use reserve::{ReserveMode, ReservePool};
