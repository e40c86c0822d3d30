//! In-memory backing store
//!
//! Keeps payloads in a map and mimics the log store's token and bloat
//! accounting. Clones share state, so a test can keep a handle for
//! inspection and failure injection after handing the store off.

use super::backing::{check_lid, BackingStore};
use super::stats::{DataStoreFileChunkStats, DataStoreStorageStats};
use super::visitor::{DataStoreVisitor, VisitorProgress};
use crate::datastore::MemoryUsage;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Inner {
    docs: BTreeMap<u32, Vec<u8>>,
    serials: BTreeMap<u32, u64>,
    footprint: u64,
    bloat: u64,
    last_serial: u64,
    last_sync_token: u64,
    tentative_sync_token: u64,
    last_flush_time: Option<DateTime<Utc>>,
    doc_id_limit: u32,
    reads: u64,
    fail_flush: bool,
    fail_read: bool,
}

impl Inner {
    fn accept_token(&mut self, lid: u32, sync_token: u64) -> bool {
        let current = self.serials.get(&lid).copied().unwrap_or(0);
        if sync_token < current {
            return false;
        }
        self.serials.insert(lid, sync_token);
        self.last_serial = self.last_serial.max(sync_token);
        true
    }

    fn drop_doc(&mut self, lid: u32) {
        if let Some(old) = self.docs.remove(&lid) {
            self.bloat += old.len() as u64;
        }
    }
}

/// In-memory store for tests and tools
#[derive(Debug, Clone, Default)]
pub struct MemoryBackingStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.inner.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().docs.is_empty()
    }

    /// Reads served so far
    pub fn read_count(&self) -> u64 {
        self.inner.lock().reads
    }

    /// Make every following flush fail
    pub fn set_fail_flush(&self, fail: bool) {
        self.inner.lock().fail_flush = fail;
    }

    /// Make every following read fail
    pub fn set_fail_read(&self, fail: bool) {
        self.inner.lock().fail_read = fail;
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.docs.clear();
        inner.footprint = 0;
        inner.bloat = 0;
    }
}

impl BackingStore for MemoryBackingStore {
    fn read(&self, lid: u32) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        if inner.fail_read {
            return Err(Error::Storage(format!("Injected read failure for lid {}", lid)));
        }
        inner.reads += 1;
        Ok(inner.docs.get(&lid).cloned())
    }

    fn read_batch(&self, lids: &[u32], visitor: &mut dyn DataStoreVisitor) -> Result<()> {
        for &lid in lids {
            if let Some(data) = self.read(lid)? {
                visitor.visit(lid, &data);
            }
        }
        Ok(())
    }

    fn write(&mut self, sync_token: u64, lid: u32, data: &[u8]) -> Result<bool> {
        check_lid(lid)?;
        let mut inner = self.inner.lock();
        if !inner.accept_token(lid, sync_token) {
            return Ok(false);
        }
        inner.drop_doc(lid);
        inner.footprint += data.len() as u64;
        inner.docs.insert(lid, data.to_vec());
        inner.doc_id_limit = inner.doc_id_limit.max(lid + 1);
        Ok(true)
    }

    fn remove(&mut self, sync_token: u64, lid: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.accept_token(lid, sync_token) {
            inner.drop_doc(lid);
        }
        Ok(())
    }

    fn flush(&mut self, sync_token: u64) -> Result<()> {
        let synced = self.init_flush(sync_token)?;
        let mut inner = self.inner.lock();
        if inner.fail_flush {
            return Err(Error::Storage("Injected flush failure".to_string()));
        }
        inner.last_sync_token = inner.last_sync_token.max(synced);
        inner.last_flush_time = Some(Utc::now());
        Ok(())
    }

    fn init_flush(&mut self, sync_token: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.tentative_sync_token = inner.tentative_sync_token.max(sync_token);
        Ok(inner.tentative_sync_token)
    }

    fn memory_used(&self) -> usize {
        let inner = self.inner.lock();
        inner.docs.values().map(|d| d.capacity()).sum::<usize>() + self.memory_meta_locked(&inner)
    }

    fn memory_meta(&self) -> usize {
        self.memory_meta_locked(&self.inner.lock())
    }

    fn memory_usage(&self) -> MemoryUsage {
        let inner = self.inner.lock();
        let used = inner.docs.values().map(|d| d.len()).sum::<usize>();
        let allocated = inner.docs.values().map(|d| d.capacity()).sum::<usize>();
        MemoryUsage::new(allocated, used, 0, 0)
    }

    fn disk_footprint(&self) -> u64 {
        self.inner.lock().footprint
    }

    fn disk_bloat(&self) -> u64 {
        self.inner.lock().bloat
    }

    fn last_sync_token(&self) -> u64 {
        self.inner.lock().last_sync_token
    }

    fn tentative_last_sync_token(&self) -> u64 {
        self.inner.lock().tentative_sync_token
    }

    fn last_flush_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_flush_time
    }

    fn accept(
        &self,
        visitor: &mut dyn DataStoreVisitor,
        progress: &mut dyn VisitorProgress,
    ) -> Result<()> {
        let docs: Vec<(u32, Vec<u8>)> = {
            let inner = self.inner.lock();
            inner.docs.iter().map(|(lid, d)| (*lid, d.clone())).collect()
        };
        let total = docs.len();
        for (i, (lid, data)) in docs.iter().enumerate() {
            visitor.visit(*lid, data);
            progress.update_progress((i + 1) as f64 / total as f64);
        }
        if total == 0 {
            progress.update_progress(1.0);
        }
        Ok(())
    }

    fn visit_cost(&self) -> f64 {
        1.0
    }

    fn storage_stats(&self) -> DataStoreStorageStats {
        let inner = self.inner.lock();
        DataStoreStorageStats::new(
            inner.footprint,
            inner.bloat,
            inner.last_serial,
            inner.last_sync_token,
            inner.doc_id_limit,
        )
    }

    fn file_chunk_stats(&self) -> Vec<DataStoreFileChunkStats> {
        let stats = self.storage_stats();
        vec![DataStoreFileChunkStats {
            name_id: 0,
            disk_usage: stats.disk_usage,
            disk_bloat: stats.disk_bloat,
            last_serial_num: stats.last_serial_num,
            last_flushed_serial_num: stats.last_flushed_serial_num,
            doc_id_limit: stats.doc_id_limit,
        }]
    }

    fn compact(&mut self, sync_token: u64) -> Result<()> {
        self.flush(sync_token)?;
        let mut inner = self.inner.lock();
        let bloat = std::mem::take(&mut inner.bloat);
        inner.footprint -= bloat;
        Ok(())
    }

    fn compact_lid_space(&mut self, wanted_doc_id_limit: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let dropped: Vec<u32> = inner
            .docs
            .range(wanted_doc_id_limit..)
            .map(|(lid, _)| *lid)
            .collect();
        for lid in dropped {
            inner.drop_doc(lid);
        }
        inner.doc_id_limit = wanted_doc_id_limit;
        Ok(())
    }

    fn can_shrink_lid_space(&self) -> bool {
        let inner = self.inner.lock();
        inner.serials.range(inner.doc_id_limit..).next().is_some()
    }

    fn estimated_shrink_lid_space_gain(&self) -> usize {
        let inner = self.inner.lock();
        inner.serials.range(inner.doc_id_limit..).count() * std::mem::size_of::<(u32, u64)>()
    }

    fn shrink_lid_space(&mut self) {
        let mut inner = self.inner.lock();
        let limit = inner.doc_id_limit;
        inner.serials.retain(|lid, _| *lid < limit);
    }

    fn doc_id_limit(&self) -> u32 {
        self.inner.lock().doc_id_limit
    }
}

impl MemoryBackingStore {
    fn memory_meta_locked(&self, inner: &Inner) -> usize {
        (inner.docs.len() + inner.serials.len()) * std::mem::size_of::<(u32, u64)>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_state() -> Result<()> {
        let handle = MemoryBackingStore::new();
        let mut store = handle.clone();
        store.write(1, 4, b"data")?;
        assert_eq!(handle.len(), 1);
        assert_eq!(handle.read(4)?, Some(b"data".to_vec()));
        assert_eq!(handle.read_count(), 1);
        Ok(())
    }

    #[test]
    fn test_bloat_and_compact() -> Result<()> {
        let mut store = MemoryBackingStore::new();
        store.write(1, 0, &[0u8; 100])?;
        store.write(2, 0, &[1u8; 50])?;
        store.remove(3, 1)?;
        assert_eq!(store.disk_footprint(), 150);
        assert_eq!(store.disk_bloat(), 100);

        store.compact(3)?;
        assert_eq!(store.disk_footprint(), 50);
        assert_eq!(store.disk_bloat(), 0);
        assert_eq!(store.last_sync_token(), 3);
        Ok(())
    }

    #[test]
    fn test_injected_failures() -> Result<()> {
        let mut store = MemoryBackingStore::new();
        store.write(1, 0, b"x")?;
        store.set_fail_flush(true);
        assert!(store.flush(1).is_err());
        assert_eq!(store.last_sync_token(), 0);
        assert_eq!(store.tentative_last_sync_token(), 1);

        store.set_fail_read(true);
        assert!(store.read(0).is_err());
        Ok(())
    }

    #[test]
    fn test_lid_space() -> Result<()> {
        let mut store = MemoryBackingStore::new();
        for lid in 0..10 {
            store.write(1, lid, b"x")?;
        }
        store.compact_lid_space(5)?;
        assert_eq!(store.len(), 5);
        assert!(store.can_shrink_lid_space());
        assert!(store.estimated_shrink_lid_space_gain() > 0);
        store.shrink_lid_space();
        assert!(!store.can_shrink_lid_space());
        assert_eq!(store.doc_id_limit(), 5);
        Ok(())
    }

    #[test]
    fn test_stale_write_and_lid_bounds() -> Result<()> {
        let mut store = MemoryBackingStore::new();
        assert!(store.write(5, 2, b"new")?);
        assert!(!store.write(4, 2, b"old")?);
        assert_eq!(store.read(2)?, Some(b"new".to_vec()));

        assert!(store.write(6, crate::docstore::backing::MAX_LID, b"edge")?);
        assert_eq!(store.doc_id_limit(), u32::MAX);
        assert!(matches!(
            store.write(7, u32::MAX, b"x"),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }
}
