//! Backing store trait
//!
//! The document store treats its backing store as an opaque durable
//! lid → bytes log with sync tokens. Implementations: [`LogDataStore`]
//! (file chunks) and [`MemoryBackingStore`] (in memory).
//!
//! [`LogDataStore`]: super::LogDataStore
//! [`MemoryBackingStore`]: super::MemoryBackingStore

use super::stats::{DataStoreFileChunkStats, DataStoreStorageStats};
use super::visitor::{DataStoreVisitor, VisitorProgress};
use crate::datastore::MemoryUsage;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};

/// Highest usable lid; `doc_id_limit` must stay representable as a `u32`
pub const MAX_LID: u32 = u32::MAX - 1;

/// Reject lids past [`MAX_LID`]
pub fn check_lid(lid: u32) -> Result<()> {
    if lid > MAX_LID {
        return Err(Error::InvalidArgument(format!(
            "Lid {} exceeds the maximum of {}",
            lid, MAX_LID
        )));
    }
    Ok(())
}

/// Durable lid-addressed byte store
pub trait BackingStore: Send + Sync {
    /// Bytes stored for `lid`, or `None` if absent or removed
    fn read(&self, lid: u32) -> Result<Option<Vec<u8>>>;

    /// Visit every present lid of `lids`; absent lids are skipped
    fn read_batch(&self, lids: &[u32], visitor: &mut dyn DataStoreVisitor) -> Result<()>;

    /// Store `data` for `lid`
    ///
    /// A write whose token is below the newest write or remove of `lid` is
    /// ignored and `Ok(false)` returned. Removes keep their token across
    /// compaction and reopen.
    fn write(&mut self, sync_token: u64, lid: u32, data: &[u8]) -> Result<bool>;

    fn remove(&mut self, sync_token: u64, lid: u32) -> Result<()>;

    /// Make every change up to `sync_token` durable
    ///
    /// `last_sync_token` reports at least `sync_token` afterwards, also
    /// after a reopen.
    fn flush(&mut self, sync_token: u64) -> Result<()>;

    /// Start flushing; returns the token that is durable once `flush` completes
    fn init_flush(&mut self, sync_token: u64) -> Result<u64>;

    fn memory_used(&self) -> usize;
    fn memory_meta(&self) -> usize;
    fn memory_usage(&self) -> MemoryUsage;

    fn disk_footprint(&self) -> u64;
    fn disk_bloat(&self) -> u64;

    fn last_sync_token(&self) -> u64;
    fn tentative_last_sync_token(&self) -> u64;
    fn last_flush_time(&self) -> Option<DateTime<Utc>>;

    /// Visit every stored lid in lid order
    fn accept(
        &self,
        visitor: &mut dyn DataStoreVisitor,
        progress: &mut dyn VisitorProgress,
    ) -> Result<()>;

    /// Relative cost of a full visit
    fn visit_cost(&self) -> f64;

    fn storage_stats(&self) -> DataStoreStorageStats;
    fn file_chunk_stats(&self) -> Vec<DataStoreFileChunkStats>;

    /// Rewrite live data to drop bloat
    fn compact(&mut self, sync_token: u64) -> Result<()>;

    /// Forget every lid at or above `wanted_doc_id_limit`
    fn compact_lid_space(&mut self, wanted_doc_id_limit: u32) -> Result<()>;
    fn can_shrink_lid_space(&self) -> bool;
    fn estimated_shrink_lid_space_gain(&self) -> usize;
    fn shrink_lid_space(&mut self);

    /// One past the highest lid in use
    fn doc_id_limit(&self) -> u32;
}
