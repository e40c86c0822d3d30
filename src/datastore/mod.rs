//! Buffer Pool
//!
//! In-memory storage for variable-length `u32` arrays addressed by compact
//! 32-bit references, with generation-based reclamation so readers never
//! take a lock.
//!
//! # Architecture
//!
//! ```text
//! DataStore (single writer)
//!   ├─→ BufferType(1 word)   → primary: buffer 0
//!   ├─→ BufferType(4 words)  → primary: buffer 2, Free: [ref 8, ref 20]
//!   └─→ buffers: [Active, Hold, Active, Free, ...]
//!
//! EntryRef = [ buffer id | offset ]   (0 = null)
//!
//! hold_elem ─→ hold list ─transfer(g)─→ tagged g ─trim(oldest used > g)─→ reused
//! ```
//!
//! Writers commit with:
//!
//! ```text
//! store.transfer_hold_lists(handler.current_generation());
//! handler.inc_generation();
//! store.trim_hold_lists(handler.oldest_used_generation());
//! ```

pub mod buffer_state;
pub mod buffer_type;
pub mod entry_ref;
pub mod generation;
pub mod hold_list;
pub mod memory_usage;
pub mod store;

pub use buffer_state::{BufferAlloc, BufferState, BufferStatus};
pub use buffer_type::BufferType;
pub use entry_ref::{EntryRef, RefLayout};
pub use generation::{Generation, GenerationGuard, GenerationHandler, GenerationReader};
pub use hold_list::GenerationHoldList;
pub use memory_usage::MemoryUsage;
pub use store::{BufferStats, DataStore, DataStoreReader, EntryMut, EntryView};
