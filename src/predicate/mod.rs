//! Predicate interval storage
//!
//! Deduplicated interval arrays on top of the buffer pool.
//!
//! ```text
//! insert([i])        → EntryRef(i)                       (inlined, no storage)
//! insert([a, b, c])  → RefCache hit?  → same EntryRef, ref_count += 1
//!                                 miss → DataStore::allocate → [size 3 | data ref]
//! insert(300 words)  → [size 255 | data ref] → [300, w0, w1, ...]
//! ```

pub mod interval;
pub mod interval_store;
pub mod ref_cache;

pub use interval::{Interval, IntervalEntry, IntervalWithBounds};
pub use interval_store::{IntervalStoreReader, Intervals, PredicateIntervalStore};
pub use ref_cache::{RefCache, Release};
