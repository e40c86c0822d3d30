//! LRU document cache
//!
//! Holds decompressed serialized documents keyed by lid, bounded by a byte
//! budget and an entry budget. Evicts least recently used entries until both
//! budgets hold.

use crate::metrics;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Bookkeeping bytes charged per cached entry on top of the payload
const ENTRY_OVERHEAD: usize = std::mem::size_of::<u32>() + std::mem::size_of::<Bytes>();

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub elements: usize,
    pub memory_used: usize,
}

impl CacheStats {
    pub fn new(hits: u64, misses: u64, elements: usize, memory_used: usize) -> Self {
        Self {
            hits,
            misses,
            elements,
            memory_used,
        }
    }

    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        match self.lookups() {
            0 => 0.0,
            total => self.hits as f64 / total as f64,
        }
    }
}

impl AddAssign for CacheStats {
    fn add_assign(&mut self, rhs: Self) {
        self.hits += rhs.hits;
        self.misses += rhs.misses;
        self.elements += rhs.elements;
        self.memory_used += rhs.memory_used;
    }
}

struct CacheInner {
    lru: LruCache<u32, Bytes>,
    bytes: usize,
    hits: u64,
    misses: u64,
}

/// Thread-safe LRU cache of serialized documents
pub struct DocumentCache {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
    max_entries: usize,
}

impl DocumentCache {
    /// `max_bytes == 0` disables caching; `max_entries == 0` means no entry bound
    pub fn new(max_bytes: usize, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::unbounded(),
                bytes: 0,
                hits: 0,
                misses: 0,
            }),
            max_bytes,
            max_entries,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_bytes > 0
    }

    fn cost(data: &Bytes) -> usize {
        data.len() + ENTRY_OVERHEAD
    }

    /// Look up `lid`, counting a hit or a miss
    pub fn get(&self, lid: u32) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let found = inner.lru.get(&lid).cloned();
        match found {
            Some(_) => inner.hits += 1,
            None => inner.misses += 1,
        }
        metrics::record_cache_lookup(found.is_some());
        found
    }

    /// Insert or replace `lid`, evicting until both budgets hold
    pub fn insert(&self, lid: u32, data: Bytes) {
        let cost = Self::cost(&data);
        if !self.is_enabled() || cost > self.max_bytes {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(old) = inner.lru.put(lid, data) {
            inner.bytes -= Self::cost(&old);
        }
        inner.bytes += cost;
        while inner.bytes > self.max_bytes
            || (self.max_entries > 0 && inner.lru.len() > self.max_entries)
        {
            match inner.lru.pop_lru() {
                Some((_, evicted)) => inner.bytes -= Self::cost(&evicted),
                None => break,
            }
        }
    }

    /// Drop `lid` from the cache
    pub fn invalidate(&self, lid: u32) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.lru.pop(&lid) {
            inner.bytes -= Self::cost(&old);
        }
    }

    /// Drop every entry with a lid at or above `limit`
    pub fn invalidate_from(&self, limit: u32) {
        let mut inner = self.inner.lock();
        let doomed: Vec<u32> = inner
            .lru
            .iter()
            .map(|(&lid, _)| lid)
            .filter(|&lid| lid >= limit)
            .collect();
        for lid in doomed {
            if let Some(old) = inner.lru.pop(&lid) {
                inner.bytes -= Self::cost(&old);
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.lru.clear();
        inner.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes charged to cached entries
    pub fn memory_used(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats::new(inner.hits, inner.misses, inner.lru.len(), inner.bytes)
    }
}

impl std::fmt::Debug for DocumentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentCache")
            .field("max_bytes", &self.max_bytes)
            .field("max_entries", &self.max_entries)
            .field("stats", &self.stats())
            .finish()
    }
}
