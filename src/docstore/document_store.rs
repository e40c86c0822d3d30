//! Cached document store
//!
//! Maps lids to serialized documents over a [`BackingStore`]. Payloads are
//! compressed on write and cached decompressed on read. The backing store
//! sits behind a read-write lock; a write invalidates the cache entry while
//! still holding the write lock, and a read inserts into the cache while
//! holding the read lock, so the cache never keeps a payload older than the
//! backing store.

use super::backing::BackingStore;
use super::cache::{CacheStats, DocumentCache};
use super::compression::{self, CompressionStats};
use super::config::DocumentStoreConfig;
use super::document::{Document, DocumentTypeRepo};
use super::log_store::LogDataStore;
use super::stats::{DataStoreFileChunkStats, DataStoreStorageStats};
use super::visitor::{DocumentVisitor, VisitorProgress};
use crate::datastore::MemoryUsage;
use crate::error::Result;
use crate::metrics;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Document store with an LRU cache in front of a backing store
pub struct DocumentStore {
    backing: RwLock<Box<dyn BackingStore>>,
    cache: DocumentCache,
    config: DocumentStoreConfig,
    bytes_in: AtomicU64,
    bytes_stored: AtomicU64,
}

impl DocumentStore {
    pub fn new(config: DocumentStoreConfig, backing: impl BackingStore + 'static) -> Result<Self> {
        config.validate()?;
        let cache = DocumentCache::new(config.max_cache_bytes, config.max_cache_entries);
        debug!(
            max_cache_bytes = config.max_cache_bytes,
            max_cache_entries = config.max_cache_entries,
            "Created document store"
        );
        Ok(Self {
            backing: RwLock::new(Box::new(backing)),
            cache,
            config,
            bytes_in: AtomicU64::new(0),
            bytes_stored: AtomicU64::new(0),
        })
    }

    /// Open a document store over a log data store in `dir`
    pub fn open<P: AsRef<Path>>(dir: P, config: DocumentStoreConfig) -> Result<Self> {
        info!(path = ?dir.as_ref(), "Opening document store");
        let backing = LogDataStore::open(dir, config.log.clone())?;
        Self::new(config, backing)
    }

    pub fn config(&self) -> &DocumentStoreConfig {
        &self.config
    }

    /// Read and decode the document stored for `lid`
    pub fn read(&self, lid: u32, repo: &DocumentTypeRepo) -> Result<Option<Document>> {
        match self.read_raw(lid)? {
            Some(data) => repo.decode(&data).map(Some),
            None => Ok(None),
        }
    }

    /// Decompressed payload stored for `lid`
    pub fn read_raw(&self, lid: u32) -> Result<Option<Bytes>> {
        if let Some(data) = self.cache.get(lid) {
            return Ok(Some(data));
        }
        let backing = self.backing.read();
        let result = backing
            .read(lid)
            .and_then(|blob| blob.map(|b| compression::decode(&b).map(Bytes::from)).transpose());
        metrics::record_operation("read", result.is_ok());
        let data = result?;
        if let Some(data) = &data {
            self.cache.insert(lid, data.clone());
        }
        Ok(data)
    }

    /// Visit the documents of `lids`; returns how many were visited
    ///
    /// Absent lids are skipped and undecodable ones logged and skipped.
    /// Cache misses are read from the backing store but not cached.
    pub fn visit(
        &self,
        lids: &[u32],
        repo: &DocumentTypeRepo,
        visitor: &mut dyn DocumentVisitor,
    ) -> Result<usize> {
        let mut visited = 0usize;
        let mut misses = Vec::new();
        for &lid in lids {
            match self.cache.get(lid) {
                Some(data) => match repo.decode(&data) {
                    Ok(doc) => {
                        visitor.visit(lid, doc);
                        visited += 1;
                    }
                    Err(e) => warn!(lid, error = %e, "Skipping undecodable document"),
                },
                None => misses.push(lid),
            }
        }
        if misses.is_empty() {
            return Ok(visited);
        }

        self.backing.read().read_batch(&misses, &mut |lid: u32, blob: &[u8]| {
            match compression::decode(blob).and_then(|data| repo.decode(&data)) {
                Ok(doc) => {
                    visitor.visit(lid, doc);
                    visited += 1;
                }
                Err(e) => warn!(lid, error = %e, "Skipping undecodable document"),
            }
        })?;
        Ok(visited)
    }

    pub fn write(&self, sync_token: u64, lid: u32, doc: &Document) -> Result<()> {
        self.write_raw(sync_token, lid, &doc.to_bytes()?)
    }

    /// Compress and store a serialized document
    pub fn write_raw(&self, sync_token: u64, lid: u32, data: &[u8]) -> Result<()> {
        let blob = compression::encode(data, &self.config.compression)?;

        let mut backing = self.backing.write();
        let result = backing.write(sync_token, lid, &blob);
        self.cache.invalidate(lid);
        drop(backing);

        metrics::record_operation("write", result.is_ok());
        if let Ok(true) = result {
            self.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
            self.bytes_stored.fetch_add(blob.len() as u64, Ordering::Relaxed);
            debug!(lid, sync_token, len = data.len(), stored = blob.len(), "Wrote document");
        }
        result.map(|_| ())
    }

    pub fn remove(&self, sync_token: u64, lid: u32) -> Result<()> {
        let mut backing = self.backing.write();
        let result = backing.remove(sync_token, lid);
        self.cache.invalidate(lid);
        drop(backing);

        metrics::record_operation("remove", result.is_ok());
        debug!(lid, sync_token, "Removed document");
        result
    }

    /// Make every change up to `sync_token` durable
    pub fn flush(&self, sync_token: u64) -> Result<()> {
        let start = Instant::now();
        let mut backing = self.backing.write();
        let result = backing.flush(sync_token);
        let (footprint, bloat) = (backing.disk_footprint(), backing.disk_bloat());
        let usage = backing.memory_usage();
        drop(backing);

        metrics::observe_flush("flush", start.elapsed().as_secs_f64());
        metrics::record_operation("flush", result.is_ok());
        match &result {
            Ok(()) => {
                metrics::update_disk_metrics(footprint, bloat);
                metrics::update_memory_usage("docstore", &usage);
                debug!(sync_token, "Flushed document store");
            }
            Err(e) => warn!(sync_token, error = %e, "Flush failed"),
        }
        result
    }

    pub fn init_flush(&self, sync_token: u64) -> Result<u64> {
        self.backing.write().init_flush(sync_token)
    }

    /// Flush on the blocking pool; `last_sync_token` advances on completion
    pub fn spawn_flush(self: &Arc<Self>, sync_token: u64) -> JoinHandle<Result<()>> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.flush(sync_token))
    }

    pub fn last_sync_token(&self) -> u64 {
        self.backing.read().last_sync_token()
    }

    pub fn tentative_last_sync_token(&self) -> u64 {
        self.backing.read().tentative_last_sync_token()
    }

    pub fn last_flush_time(&self) -> Option<DateTime<Utc>> {
        self.backing.read().last_flush_time()
    }

    /// Forget every lid at or above `wanted_doc_id_limit`
    pub fn compact_lid_space(&self, wanted_doc_id_limit: u32) -> Result<()> {
        let mut backing = self.backing.write();
        backing.compact_lid_space(wanted_doc_id_limit)?;
        self.cache.invalidate_from(wanted_doc_id_limit);
        Ok(())
    }

    pub fn can_shrink_lid_space(&self) -> bool {
        self.backing.read().can_shrink_lid_space()
    }

    pub fn estimated_shrink_lid_space_gain(&self) -> usize {
        self.backing.read().estimated_shrink_lid_space_gain()
    }

    pub fn shrink_lid_space(&self) {
        self.backing.write().shrink_lid_space();
    }

    pub fn doc_id_limit(&self) -> u32 {
        self.backing.read().doc_id_limit()
    }

    pub fn disk_footprint(&self) -> u64 {
        self.backing.read().disk_footprint()
    }

    pub fn disk_bloat(&self) -> u64 {
        self.backing.read().disk_bloat()
    }

    pub fn storage_stats(&self) -> DataStoreStorageStats {
        self.backing.read().storage_stats()
    }

    pub fn file_chunk_stats(&self) -> Vec<DataStoreFileChunkStats> {
        self.backing.read().file_chunk_stats()
    }

    /// Whether disk bloat exceeds the configured ratio
    pub fn should_compact(&self) -> bool {
        self.storage_stats().bloat_ratio() > self.config.max_bloat_ratio
    }

    pub fn compact(&self, sync_token: u64) -> Result<()> {
        let start = Instant::now();
        let mut backing = self.backing.write();
        let before = backing.disk_footprint();
        let result = backing.compact(sync_token);
        let (footprint, bloat) = (backing.disk_footprint(), backing.disk_bloat());
        drop(backing);

        metrics::observe_flush("compact", start.elapsed().as_secs_f64());
        metrics::record_operation("compact", result.is_ok());
        if result.is_ok() {
            metrics::update_disk_metrics(footprint, bloat);
            info!(before, after = footprint, "Compacted document store");
        }
        result
    }

    /// Compact if bloat warrants it; returns whether compaction ran
    pub fn compact_bloat(&self, sync_token: u64) -> Result<bool> {
        if !self.should_compact() {
            return Ok(false);
        }
        self.compact(sync_token)?;
        Ok(true)
    }

    /// Visit every stored document in lid order
    ///
    /// With `fields_only` the visited documents carry no id.
    pub fn accept(
        &self,
        visitor: &mut dyn DocumentVisitor,
        progress: &mut dyn VisitorProgress,
        repo: &DocumentTypeRepo,
        fields_only: bool,
    ) -> Result<()> {
        self.backing.read().accept(
            &mut |lid: u32, blob: &[u8]| {
                match compression::decode(blob).and_then(|data| repo.decode(&data)) {
                    Ok(mut doc) => {
                        if fields_only {
                            doc.id.clear();
                        }
                        visitor.visit(lid, doc);
                    }
                    Err(e) => warn!(lid, error = %e, "Skipping undecodable document"),
                }
            },
            progress,
        )
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Backing store memory plus cached bytes
    pub fn memory_used(&self) -> usize {
        self.backing.read().memory_used() + self.cache.memory_used()
    }

    pub fn memory_meta(&self) -> usize {
        self.backing.read().memory_meta()
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let mut usage = self.backing.read().memory_usage();
        let cached = self.cache.memory_used();
        usage.inc_allocated_bytes(cached);
        usage.inc_used_bytes(cached);
        usage
    }

    pub fn visit_cost(&self) -> f64 {
        self.backing.read().visit_cost()
    }

    /// Totals of bytes written versus bytes stored
    pub fn compression_stats(&self) -> CompressionStats {
        CompressionStats::new(
            self.bytes_in.load(Ordering::Relaxed) as usize,
            self.bytes_stored.load(Ordering::Relaxed) as usize,
        )
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish()
    }
}
