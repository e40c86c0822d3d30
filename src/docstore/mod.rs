//! Document store
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ DocumentStore (lid → Document)                │
//! │   ├─ DocumentCache (LRU, bytes + entries)     │
//! │   ├─ compression (none / zstd, tagged blob)   │
//! │   └─ RwLock<Box<dyn BackingStore>>            │
//! ├───────────────────────────────────────────────┤
//! │ LogDataStore                                  │
//! │   ├─ lid index (serial + chunk location)      │
//! │   └─ FileChunk files (crc32 records)          │
//! │ MemoryBackingStore (tests, tools)             │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Every mutation carries a sync token. A backing store ignores a write or
//! remove whose token is below the one it already holds for that lid, and
//! `flush(token)` makes everything up to `token` durable.

pub mod backing;
pub mod cache;
pub mod chunk;
pub mod compression;
pub mod config;
pub mod document;
pub mod document_store;
pub mod log_store;
pub mod memory;
pub mod production_tests;
pub mod stats;
pub mod visitor;

pub use backing::BackingStore;
pub use cache::{CacheStats, DocumentCache};
pub use compression::{CompressionAlgorithm, CompressionConfig, CompressionStats};
pub use config::{DocumentStoreConfig, LogStoreConfig};
pub use document::{Document, DocumentTypeRepo};
pub use document_store::DocumentStore;
pub use log_store::LogDataStore;
pub use memory::MemoryBackingStore;
pub use stats::{DataStoreFileChunkStats, DataStoreStorageStats};
pub use visitor::{DataStoreVisitor, DocumentVisitor, NoProgress, VisitorProgress};
