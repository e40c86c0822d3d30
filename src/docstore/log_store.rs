//! File-backed log data store
//!
//! Every write and remove is appended to the active chunk as a record tagged
//! with its sync token. An in-memory lid index points at the newest record of
//! each lid. The active chunk is closed once it reaches
//! `max_chunk_bytes` and a new one is started.
//!
//! On open, chunks are scanned in parallel and replayed in id order; a record
//! only wins if its serial is not below the one already seen for its lid, so
//! replay converges on the same state as the writer had.
//!
//! The newest remove of a lid stays live as a tombstone so its token
//! survives compaction. A flush whose token is above every logged serial
//! appends a sync record, and recovery takes the highest serial of any
//! record as the last sync token.

use super::backing::{check_lid, BackingStore};
use super::chunk::{
    decode_record, parse_chunk_id, scan_chunk, FileChunk, RecordKind, RECORD_HEADER_LEN,
};
use super::config::LogStoreConfig;
use super::stats::{DataStoreFileChunkStats, DataStoreStorageStats};
use super::visitor::{DataStoreVisitor, VisitorProgress};
use crate::datastore::MemoryUsage;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const PROGRESS_INTERVAL: usize = 1024;
const COMPACT_WRITE_BATCH: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Location {
    chunk_id: u64,
    offset: u64,
    len: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct LidEntry {
    /// Serial of the newest write or remove applied
    serial: u64,
    location: Option<Location>,
    /// Newest remove record, while no later put exists
    tombstone: Option<Location>,
}

fn release(chunks: &mut BTreeMap<u64, FileChunk>, location: Location) {
    if let Some(chunk) = chunks.get_mut(&location.chunk_id) {
        chunk.live_bytes = chunk.live_bytes.saturating_sub(location.len as u64);
    }
}

/// Release both records of `entry` and clear it down to its serial
fn release_entry(chunks: &mut BTreeMap<u64, FileChunk>, entry: &mut LidEntry) {
    for location in [entry.location.take(), entry.tombstone.take()].into_iter().flatten() {
        release(chunks, location);
    }
}

/// Backing store over append-only chunk files in one directory
#[derive(Debug)]
pub struct LogDataStore {
    dir: PathBuf,
    config: LogStoreConfig,
    chunks: BTreeMap<u64, FileChunk>,
    active: u64,
    lids: Vec<LidEntry>,
    last_serial: u64,
    last_sync_token: u64,
    tentative_sync_token: u64,
    last_flush_time: Option<DateTime<Utc>>,
    doc_id_limit: u32,
}

impl LogDataStore {
    /// Open the store in `dir`, replaying any chunks found there
    pub fn open<P: AsRef<Path>>(dir: P, config: LogStoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::Storage(format!("Failed to create {}: {}", dir.display(), e))
        })?;
        info!(path = ?dir, "Opening log data store");

        let mut store = Self {
            dir,
            config,
            chunks: BTreeMap::new(),
            active: 0,
            lids: Vec::new(),
            last_serial: 0,
            last_sync_token: 0,
            tentative_sync_token: 0,
            last_flush_time: None,
            doc_id_limit: 0,
        };
        store.recover()?;
        Ok(store)
    }

    fn list_chunks(&self) -> Result<Vec<(u64, PathBuf)>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            Error::Storage(format!("Failed to list {}: {}", self.dir.display(), e))
        })?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::Storage(e.to_string()))?;
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(parse_chunk_id) {
                found.push((id, entry.path()));
            }
        }
        found.sort_unstable_by_key(|(id, _)| *id);
        Ok(found)
    }

    fn recover(&mut self) -> Result<()> {
        let found = self.list_chunks()?;
        let mut scans = found
            .par_iter()
            .map(|(id, path)| scan_chunk(*id, path))
            .collect::<Result<Vec<_>>>()?;

        if let Some(checkpoint) = scans.iter().filter(|s| s.is_checkpoint()).map(|s| s.id).max() {
            for scan in scans.iter().filter(|s| s.id < checkpoint) {
                info!(chunk = scan.id, checkpoint, "Removing chunk superseded by compaction");
                std::fs::remove_file(&scan.path).map_err(|e| {
                    Error::Storage(format!("Failed to remove {}: {}", scan.path.display(), e))
                })?;
            }
            scans.retain(|s| s.id >= checkpoint);
        }

        let mut records = 0usize;
        for scan in &scans {
            self.chunks.insert(scan.id, FileChunk::open(scan)?);
            if let Some(error) = &scan.error {
                warn!(chunk = scan.id, error = %error, "Chunk scan stopped early");
            }
            for record in &scan.records {
                let header = record.header;
                match header.kind {
                    RecordKind::Checkpoint => {
                        if let Some(chunk) = self.chunks.get_mut(&scan.id) {
                            chunk.live_bytes += header.record_len() as u64;
                        }
                        continue;
                    }
                    RecordKind::Sync => continue,
                    RecordKind::Put | RecordKind::Remove => {}
                }
                records += 1;
                let lid = header.lid as usize;
                if lid >= self.lids.len() {
                    self.lids.resize(lid + 1, LidEntry::default());
                }
                let entry = &mut self.lids[lid];
                if header.serial < entry.serial {
                    continue;
                }
                release_entry(&mut self.chunks, entry);
                entry.serial = header.serial;
                let location = Location {
                    chunk_id: scan.id,
                    offset: record.offset,
                    len: header.record_len() as u32,
                };
                if header.kind == RecordKind::Put {
                    entry.location = Some(location);
                } else {
                    entry.tombstone = Some(location);
                }
                if let Some(chunk) = self.chunks.get_mut(&scan.id) {
                    chunk.live_bytes += location.len as u64;
                }
            }
        }

        // Sync and checkpoint records count here too
        self.last_serial = self.chunks.values().map(|c| c.last_serial).max().unwrap_or(0);
        self.last_sync_token = self.last_serial;
        self.tentative_sync_token = self.last_serial;
        self.doc_id_limit = self
            .lids
            .iter()
            .rposition(|e| e.location.is_some())
            .map_or(0, |lid| lid as u32 + 1);

        match self.chunks.keys().next_back().copied() {
            Some(id) => {
                self.active = id;
                self.last_flush_time = std::fs::metadata(self.chunks[&id].path())
                    .and_then(|m| m.modified())
                    .ok()
                    .map(DateTime::<Utc>::from);
            }
            None => {
                self.chunks.insert(1, FileChunk::create(&self.dir, 1)?);
                self.active = 1;
            }
        }

        info!(
            chunks = self.chunks.len(),
            records,
            doc_id_limit = self.doc_id_limit,
            last_serial = self.last_serial,
            "Log data store recovered"
        );
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    fn active_mut(&mut self) -> Result<&mut FileChunk> {
        let active = self.active;
        self.chunks
            .get_mut(&active)
            .ok_or_else(|| Error::Internal(format!("Active chunk {} missing", active)))
    }

    fn rotate_if_needed(&mut self, record_len: usize) -> Result<()> {
        let max_chunk_bytes = self.config.max_chunk_bytes;
        let active = self.active_mut()?;
        if active.is_empty() || active.len() + record_len as u64 <= max_chunk_bytes {
            return Ok(());
        }
        active.sync()?;
        let next = self.active + 1;
        self.chunks.insert(next, FileChunk::create(&self.dir, next)?);
        self.active = next;
        debug!(chunk = next, "Rotated active chunk");
        Ok(())
    }

    fn read_location(&self, lid: u32, location: Location) -> Result<Vec<u8>> {
        let chunk = self.chunks.get(&location.chunk_id).ok_or_else(|| {
            Error::Internal(format!("Chunk {} of lid {} missing", location.chunk_id, lid))
        })?;
        let bytes = chunk.read_record(location.offset, location.len)?;
        let (header, payload) = decode_record(&bytes)?;
        if header.lid != lid || header.kind != RecordKind::Put {
            return Err(Error::Decode(format!(
                "Record at chunk {} offset {} belongs to lid {}, expected {}",
                location.chunk_id, location.offset, header.lid, lid
            )));
        }
        Ok(payload.to_vec())
    }

    fn location(&self, lid: u32) -> Option<Location> {
        self.lids.get(lid as usize).and_then(|e| e.location)
    }

    fn lid_bytes(&self) -> usize {
        self.lids.capacity() * std::mem::size_of::<LidEntry>()
    }

    fn pending_bytes(&self) -> usize {
        self.chunks.values().map(|c| c.pending_len()).sum()
    }

    /// Copy every live record and tombstone into `target`, returning the new
    /// locations, then seal it with a checkpoint at the flushed token
    fn copy_live(&self, target: &mut FileChunk) -> Result<Vec<(usize, Location)>> {
        let mut moved = Vec::new();
        for (lid, entry) in self.lids.iter().enumerate() {
            let Some(location) = entry.location.or(entry.tombstone) else {
                continue;
            };
            let chunk = self.chunks.get(&location.chunk_id).ok_or_else(|| {
                Error::Internal(format!("Chunk {} of lid {} missing", location.chunk_id, lid))
            })?;
            let record = chunk.read_record(location.offset, location.len)?;
            let offset = target.append_raw(&record)?;
            moved.push((
                lid,
                Location {
                    chunk_id: target.id(),
                    offset,
                    len: location.len,
                },
            ));
            if target.pending_len() >= COMPACT_WRITE_BATCH {
                target.write_pending()?;
            }
        }
        let sealed = self.last_serial.max(self.last_sync_token);
        target.append(RecordKind::Checkpoint, 0, sealed, &[])?;
        target.sync()?;
        Ok(moved)
    }
}

impl BackingStore for LogDataStore {
    fn read(&self, lid: u32) -> Result<Option<Vec<u8>>> {
        match self.location(lid) {
            Some(location) => self.read_location(lid, location).map(Some),
            None => Ok(None),
        }
    }

    fn read_batch(&self, lids: &[u32], visitor: &mut dyn DataStoreVisitor) -> Result<()> {
        let mut located: Vec<(u32, Location)> = lids
            .iter()
            .filter_map(|&lid| self.location(lid).map(|loc| (lid, loc)))
            .collect();
        located.sort_unstable_by_key(|(_, loc)| (loc.chunk_id, loc.offset));
        for (lid, location) in located {
            let data = self.read_location(lid, location)?;
            visitor.visit(lid, &data);
        }
        Ok(())
    }

    fn write(&mut self, sync_token: u64, lid: u32, data: &[u8]) -> Result<bool> {
        check_lid(lid)?;
        let index = lid as usize;
        if index >= self.lids.len() {
            self.lids.resize(index + 1, LidEntry::default());
        }
        let current = self.lids[index].serial;
        if sync_token < current {
            warn!(lid, sync_token, current, "Ignoring stale write");
            return Ok(false);
        }

        self.rotate_if_needed(RECORD_HEADER_LEN + data.len())?;
        let active = self.active_mut()?;
        let (offset, len) = active.append(RecordKind::Put, lid, sync_token, data)?;
        active.live_bytes += len as u64;
        let location = Location {
            chunk_id: self.active,
            offset,
            len,
        };

        let entry = &mut self.lids[index];
        release_entry(&mut self.chunks, entry);
        entry.location = Some(location);
        entry.serial = sync_token;
        self.last_serial = self.last_serial.max(sync_token);
        self.doc_id_limit = self.doc_id_limit.max(lid + 1);
        Ok(true)
    }

    fn remove(&mut self, sync_token: u64, lid: u32) -> Result<()> {
        let index = lid as usize;
        let Some(current) = self.lids.get(index).map(|e| e.serial) else {
            return Ok(());
        };
        if sync_token < current {
            warn!(lid, sync_token, current, "Ignoring stale remove");
            return Ok(());
        }

        self.rotate_if_needed(RECORD_HEADER_LEN)?;
        let active = self.active_mut()?;
        let (offset, len) = active.append(RecordKind::Remove, lid, sync_token, &[])?;
        active.live_bytes += len as u64;
        let tombstone = Location {
            chunk_id: self.active,
            offset,
            len,
        };

        let entry = &mut self.lids[index];
        release_entry(&mut self.chunks, entry);
        entry.tombstone = Some(tombstone);
        entry.serial = sync_token;
        self.last_serial = self.last_serial.max(sync_token);
        Ok(())
    }

    fn flush(&mut self, sync_token: u64) -> Result<()> {
        let synced = self.init_flush(sync_token)?;
        if synced > self.last_serial {
            self.rotate_if_needed(RECORD_HEADER_LEN)?;
            self.active_mut()?.append(RecordKind::Sync, 0, synced, &[])?;
            self.last_serial = synced;
        }
        for chunk in self.chunks.values_mut().filter(|c| !c.is_synced()) {
            chunk.sync()?;
        }
        self.last_sync_token = self.last_sync_token.max(synced);
        self.last_flush_time = Some(Utc::now());
        debug!(sync_token = self.last_sync_token, "Flushed log data store");
        Ok(())
    }

    fn init_flush(&mut self, sync_token: u64) -> Result<u64> {
        for chunk in self.chunks.values_mut() {
            chunk.write_pending()?;
        }
        self.tentative_sync_token = self.tentative_sync_token.max(sync_token);
        Ok(self.tentative_sync_token)
    }

    fn memory_used(&self) -> usize {
        self.lid_bytes() + self.pending_bytes()
    }

    fn memory_meta(&self) -> usize {
        self.lid_bytes() + self.chunks.len() * std::mem::size_of::<FileChunk>()
    }

    fn memory_usage(&self) -> MemoryUsage {
        let entry = std::mem::size_of::<LidEntry>();
        let pending = self.pending_bytes();
        MemoryUsage::new(
            self.lid_bytes() + pending,
            self.lids.len() * entry + pending,
            0,
            0,
        )
    }

    fn disk_footprint(&self) -> u64 {
        self.chunks.values().map(|c| c.len()).sum()
    }

    fn disk_bloat(&self) -> u64 {
        self.chunks.values().map(|c| c.bloat()).sum()
    }

    fn last_sync_token(&self) -> u64 {
        self.last_sync_token
    }

    fn tentative_last_sync_token(&self) -> u64 {
        self.tentative_sync_token
    }

    fn last_flush_time(&self) -> Option<DateTime<Utc>> {
        self.last_flush_time
    }

    fn accept(
        &self,
        visitor: &mut dyn DataStoreVisitor,
        progress: &mut dyn VisitorProgress,
    ) -> Result<()> {
        let total = self.lids.len();
        for (lid, entry) in self.lids.iter().enumerate() {
            if let Some(location) = entry.location {
                let data = self.read_location(lid as u32, location)?;
                visitor.visit(lid as u32, &data);
            }
            if lid % PROGRESS_INTERVAL == 0 {
                progress.update_progress(lid as f64 / total as f64);
            }
        }
        progress.update_progress(1.0);
        Ok(())
    }

    fn visit_cost(&self) -> f64 {
        self.chunks.len() as f64
    }

    fn storage_stats(&self) -> DataStoreStorageStats {
        DataStoreStorageStats::new(
            self.disk_footprint(),
            self.disk_bloat(),
            self.last_serial,
            self.last_sync_token,
            self.doc_id_limit,
        )
    }

    fn file_chunk_stats(&self) -> Vec<DataStoreFileChunkStats> {
        self.chunks
            .values()
            .map(|chunk| DataStoreFileChunkStats {
                name_id: chunk.id(),
                disk_usage: chunk.len(),
                disk_bloat: chunk.bloat(),
                last_serial_num: chunk.last_serial,
                last_flushed_serial_num: if chunk.is_synced() {
                    chunk.last_serial
                } else {
                    chunk.last_serial.min(self.last_sync_token)
                },
                doc_id_limit: chunk.lid_limit,
            })
            .collect()
    }

    fn compact(&mut self, sync_token: u64) -> Result<()> {
        self.flush(sync_token)?;
        let before = self.disk_footprint();
        let target_id = self.chunks.keys().next_back().map_or(1, |id| id + 1);
        let mut target = FileChunk::create(&self.dir, target_id)?;

        let moved = match self.copy_live(&mut target) {
            Ok(moved) => moved,
            Err(e) => {
                warn!(chunk = target_id, error = %e, "Compaction failed, discarding target chunk");
                if let Err(e) = target.remove_file() {
                    warn!(error = %e, "Failed to remove partial compaction chunk");
                }
                return Err(e);
            }
        };

        // The checkpoint record counts as live
        target.live_bytes = target.len();
        for (lid, location) in moved {
            let entry = &mut self.lids[lid];
            if entry.location.is_some() {
                entry.location = Some(location);
            } else {
                entry.tombstone = Some(location);
            }
        }
        let old = std::mem::take(&mut self.chunks);
        self.chunks.insert(target_id, target);
        self.active = target_id;
        for (_, chunk) in old {
            let id = chunk.id();
            if let Err(e) = chunk.remove_file() {
                warn!(chunk = id, error = %e, "Failed to remove compacted chunk");
            }
        }

        info!(
            before,
            after = self.disk_footprint(),
            chunk = target_id,
            "Compacted log data store"
        );
        Ok(())
    }

    fn compact_lid_space(&mut self, wanted_doc_id_limit: u32) -> Result<()> {
        let start = wanted_doc_id_limit as usize;
        let mut dropped = 0usize;
        for lid in start..self.lids.len() {
            let entry = self.lids[lid];
            if entry.location.is_none() {
                continue;
            }
            self.rotate_if_needed(RECORD_HEADER_LEN)?;
            let active = self.active_mut()?;
            let (offset, len) =
                active.append(RecordKind::Remove, lid as u32, entry.serial, &[])?;
            active.live_bytes += len as u64;
            let tombstone = Location {
                chunk_id: self.active,
                offset,
                len,
            };
            let entry = &mut self.lids[lid];
            release_entry(&mut self.chunks, entry);
            entry.tombstone = Some(tombstone);
            dropped += 1;
        }
        if dropped > 0 {
            warn!(
                dropped,
                limit = wanted_doc_id_limit,
                "Dropped live documents above the lid limit"
            );
        }
        self.doc_id_limit = wanted_doc_id_limit;
        debug!(limit = wanted_doc_id_limit, "Compacted lid space");
        Ok(())
    }

    fn can_shrink_lid_space(&self) -> bool {
        self.lids.len() > self.doc_id_limit as usize
    }

    fn estimated_shrink_lid_space_gain(&self) -> usize {
        if !self.can_shrink_lid_space() {
            return 0;
        }
        (self.lids.capacity() - self.doc_id_limit as usize) * std::mem::size_of::<LidEntry>()
    }

    fn shrink_lid_space(&mut self) {
        if !self.can_shrink_lid_space() {
            return;
        }
        let limit = self.doc_id_limit as usize;
        for entry in &mut self.lids[limit..] {
            release_entry(&mut self.chunks, entry);
        }
        self.lids.truncate(limit);
        self.lids.shrink_to_fit();
    }

    fn doc_id_limit(&self) -> u32 {
        self.doc_id_limit
    }
}

impl Drop for LogDataStore {
    fn drop(&mut self) {
        for chunk in self.chunks.values_mut() {
            if let Err(e) = chunk.write_pending() {
                warn!(chunk = chunk.id(), error = %e, "Failed to write chunk tail on close");
            }
        }
    }
}
