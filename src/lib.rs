// PhotonDB - Document Storage Layer
// Generation-reclaimed buffer pool, interval dedup store and cached document store

#![warn(rust_2018_idioms)]

pub mod datastore;
pub mod docstore;
pub mod metrics;
pub mod predicate;

// Re-exports for convenience
pub use datastore::{DataStore, EntryRef, GenerationGuard, GenerationHandler, RefLayout};
pub use docstore::{BackingStore, DocumentStore, DocumentStoreConfig, LogDataStore};
pub use predicate::PredicateIntervalStore;

/// Document storage error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Decode error: {0}")]
        Decode(String),

        #[error("Compression error: {0}")]
        Compression(String),

        #[error("Allocation failed: {0}")]
        AllocationFailed(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
