//! File chunks of the log data store
//!
//! A chunk is an append-only file of records:
//!
//! ```text
//! [kind: u8][lid: u32][serial: u64][len: u32][crc32: u32][payload: len bytes]
//!  kind 0 = put, 1 = remove, 2 = checkpoint, 3 = sync
//! ```
//!
//! All integers are little-endian. The checksum covers every header byte
//! before it plus the payload. Compaction copies every live record into a
//! fresh chunk and then appends a checkpoint record; a chunk holding a
//! checkpoint supersedes every chunk with a lower id. A sync record carries
//! a flushed token that no put or remove reached.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const RECORD_HEADER_LEN: usize = 21;
const CRC_OFFSET: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Put,
    Remove,
    Checkpoint,
    Sync,
}

impl RecordKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::Put => 0,
            Self::Remove => 1,
            Self::Checkpoint => 2,
            Self::Sync => 3,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Put),
            1 => Some(Self::Remove),
            2 => Some(Self::Checkpoint),
            3 => Some(Self::Sync),
            _ => None,
        }
    }
}

/// Fixed-size part of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: RecordKind,
    pub lid: u32,
    pub serial: u64,
    pub payload_len: u32,
}

impl RecordKind {
    /// Whether the record is about a lid rather than the chunk log itself
    pub fn is_lid_record(self) -> bool {
        matches!(self, Self::Put | Self::Remove)
    }
}

impl RecordHeader {
    /// Total encoded length, header included
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_LEN + self.payload_len as usize
    }
}

fn checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[..CRC_OFFSET]);
    hasher.update(payload);
    hasher.finalize()
}

/// Append an encoded record to `out`
pub fn encode_record(
    out: &mut Vec<u8>,
    kind: RecordKind,
    lid: u32,
    serial: u64,
    payload: &[u8],
) -> Result<usize> {
    let payload_len = u32::try_from(payload.len()).map_err(|_| {
        Error::InvalidArgument(format!("Record payload of {} bytes is too large", payload.len()))
    })?;
    let mut header = [0u8; RECORD_HEADER_LEN];
    header[0] = kind.to_byte();
    header[1..5].copy_from_slice(&lid.to_le_bytes());
    header[5..13].copy_from_slice(&serial.to_le_bytes());
    header[13..17].copy_from_slice(&payload_len.to_le_bytes());
    let crc = checksum(&header, payload);
    header[17..21].copy_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    Ok(RECORD_HEADER_LEN + payload.len())
}

fn parse_header(bytes: &[u8]) -> std::result::Result<(RecordHeader, u32), String> {
    if bytes.len() < RECORD_HEADER_LEN {
        return Err(format!("Truncated header: {} bytes", bytes.len()));
    }
    let kind = RecordKind::from_byte(bytes[0])
        .ok_or_else(|| format!("Unknown record kind: {}", bytes[0]))?;
    let lid = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    let mut serial = [0u8; 8];
    serial.copy_from_slice(&bytes[5..13]);
    let payload_len = u32::from_le_bytes([bytes[13], bytes[14], bytes[15], bytes[16]]);
    let crc = u32::from_le_bytes([bytes[17], bytes[18], bytes[19], bytes[20]]);
    Ok((
        RecordHeader {
            kind,
            lid,
            serial: u64::from_le_bytes(serial),
            payload_len,
        },
        crc,
    ))
}

/// Decode one complete record, verifying its checksum
pub fn decode_record(bytes: &[u8]) -> Result<(RecordHeader, &[u8])> {
    let (header, crc) = parse_header(bytes).map_err(Error::Decode)?;
    let payload = bytes
        .get(RECORD_HEADER_LEN..header.record_len())
        .ok_or_else(|| Error::Decode("Truncated record payload".to_string()))?;
    if checksum(bytes, payload) != crc {
        return Err(Error::Decode(format!(
            "Checksum mismatch for lid {} serial {}",
            header.lid, header.serial
        )));
    }
    Ok((header, payload))
}

/// A record found while scanning a chunk
#[derive(Debug, Clone, Copy)]
pub struct ScannedRecord {
    pub header: RecordHeader,
    pub offset: u64,
}

/// Result of scanning a chunk file
#[derive(Debug)]
pub struct ChunkScan {
    pub id: u64,
    pub path: PathBuf,
    pub records: Vec<ScannedRecord>,
    /// Length of the valid prefix
    pub valid_len: u64,
    pub file_len: u64,
    /// Why scanning stopped before the end of the file
    pub error: Option<String>,
}

impl ChunkScan {
    pub fn is_checkpoint(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.header.kind == RecordKind::Checkpoint)
    }
}

/// Read a chunk file and collect its records up to the first torn or corrupt one
pub fn scan_chunk(id: u64, path: &Path) -> Result<ChunkScan> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::Storage(format!("Failed to read chunk {}: {}", path.display(), e)))?;
    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut error = None;
    while offset < bytes.len() {
        match decode_record(&bytes[offset..]) {
            Ok((header, _)) => {
                records.push(ScannedRecord {
                    header,
                    offset: offset as u64,
                });
                offset += header.record_len();
            }
            Err(e) => {
                error = Some(format!("at offset {}: {}", offset, e));
                break;
            }
        }
    }
    Ok(ChunkScan {
        id,
        path: path.to_path_buf(),
        records,
        valid_len: offset as u64,
        file_len: bytes.len() as u64,
        error,
    })
}

pub fn chunk_file_name(id: u64) -> String {
    format!("chunk-{:08}.dat", id)
}

pub fn parse_chunk_id(name: &str) -> Option<u64> {
    name.strip_prefix("chunk-")?.strip_suffix(".dat")?.parse().ok()
}

/// One append-only chunk file plus its unwritten tail
#[derive(Debug)]
pub struct FileChunk {
    id: u64,
    path: PathBuf,
    file: Mutex<File>,
    /// Bytes written to the file
    disk_len: u64,
    /// Bytes fsynced
    synced_len: u64,
    /// Appended records not yet written to the file
    pending: Vec<u8>,
    /// Bytes of records still referenced by the lid index
    pub(crate) live_bytes: u64,
    pub(crate) last_serial: u64,
    pub(crate) lid_limit: u32,
}

impl FileChunk {
    fn open_file(path: &Path, create_new: bool) -> Result<File> {
        let mut options = OpenOptions::new();
        options.read(true).append(true);
        if create_new {
            options.create_new(true);
        }
        options
            .open(path)
            .map_err(|e| Error::Storage(format!("Failed to open chunk {}: {}", path.display(), e)))
    }

    /// Create a new empty chunk file
    pub fn create(dir: &Path, id: u64) -> Result<Self> {
        let path = dir.join(chunk_file_name(id));
        let file = Self::open_file(&path, true)?;
        debug!(chunk = id, "Created chunk");
        Ok(Self {
            id,
            path,
            file: Mutex::new(file),
            disk_len: 0,
            synced_len: 0,
            pending: Vec::new(),
            live_bytes: 0,
            last_serial: 0,
            lid_limit: 0,
        })
    }

    /// Open a scanned chunk, cutting off a torn tail
    pub fn open(scan: &ChunkScan) -> Result<Self> {
        let file = Self::open_file(&scan.path, false)?;
        if scan.valid_len < scan.file_len {
            warn!(
                chunk = scan.id,
                valid = scan.valid_len,
                len = scan.file_len,
                "Truncating torn chunk tail"
            );
            file.set_len(scan.valid_len)
                .map_err(|e| Error::Storage(format!("Failed to truncate chunk: {}", e)))?;
        }
        let last_serial = scan.records.iter().map(|r| r.header.serial).max().unwrap_or(0);
        let lid_limit = scan
            .records
            .iter()
            .filter(|r| r.header.kind.is_lid_record())
            .map(|r| r.header.lid.saturating_add(1))
            .max()
            .unwrap_or(0);
        Ok(Self {
            id: scan.id,
            path: scan.path.clone(),
            file: Mutex::new(file),
            disk_len: scan.valid_len,
            synced_len: scan.valid_len,
            pending: Vec::new(),
            live_bytes: 0,
            last_serial,
            lid_limit,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical length, unwritten tail included
    pub fn len(&self) -> u64 {
        self.disk_len + self.pending.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn bloat(&self) -> u64 {
        self.len().saturating_sub(self.live_bytes)
    }

    pub fn is_synced(&self) -> bool {
        self.pending.is_empty() && self.synced_len == self.disk_len
    }

    /// Append a record, returning its offset and encoded length
    pub fn append(
        &mut self,
        kind: RecordKind,
        lid: u32,
        serial: u64,
        payload: &[u8],
    ) -> Result<(u64, u32)> {
        let offset = self.len();
        let len = encode_record(&mut self.pending, kind, lid, serial, payload)?;
        self.last_serial = self.last_serial.max(serial);
        if kind.is_lid_record() {
            self.lid_limit = self.lid_limit.max(lid.saturating_add(1));
        }
        Ok((offset, len as u32))
    }

    /// Append an already encoded record
    pub fn append_raw(&mut self, record: &[u8]) -> Result<u64> {
        let (header, _) = decode_record(record)?;
        let offset = self.len();
        self.pending.extend_from_slice(record);
        self.last_serial = self.last_serial.max(header.serial);
        if header.kind.is_lid_record() {
            self.lid_limit = self.lid_limit.max(header.lid.saturating_add(1));
        }
        Ok(offset)
    }

    /// Raw bytes of the record at `offset`
    pub fn read_record(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let len = len as usize;
        if offset >= self.disk_len {
            let start = (offset - self.disk_len) as usize;
            return self
                .pending
                .get(start..start + len)
                .map(|bytes| bytes.to_vec())
                .ok_or_else(|| Error::Internal(format!("Record at {} out of range", offset)));
        }
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|e| {
                Error::Storage(format!(
                    "Failed to read chunk {} at {}: {}",
                    self.id, offset, e
                ))
            })?;
        Ok(buf)
    }

    /// Write the unwritten tail to the file
    pub fn write_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file
            .get_mut()
            .write_all(&self.pending)
            .map_err(|e| Error::Storage(format!("Failed to write chunk {}: {}", self.id, e)))?;
        self.disk_len += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    /// Write and fsync everything appended so far
    pub fn sync(&mut self) -> Result<()> {
        self.write_pending()?;
        if self.synced_len == self.disk_len {
            return Ok(());
        }
        self.file
            .get_mut()
            .sync_data()
            .map_err(|e| Error::Storage(format!("Failed to sync chunk {}: {}", self.id, e)))?;
        self.synced_len = self.disk_len;
        Ok(())
    }

    /// Delete the chunk file
    pub fn remove_file(self) -> Result<()> {
        std::fs::remove_file(&self.path).map_err(|e| {
            Error::Storage(format!("Failed to remove chunk {}: {}", self.path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_encoding() -> Result<()> {
        let mut buf = Vec::new();
        let len = encode_record(&mut buf, RecordKind::Put, 7, 42, b"hello")?;
        assert_eq!(len, RECORD_HEADER_LEN + 5);

        let (header, payload) = decode_record(&buf)?;
        assert_eq!(header.kind, RecordKind::Put);
        assert_eq!(header.lid, 7);
        assert_eq!(header.serial, 42);
        assert_eq!(payload, b"hello");
        Ok(())
    }

    #[test]
    fn test_corrupt_record_detected() -> Result<()> {
        let mut buf = Vec::new();
        encode_record(&mut buf, RecordKind::Put, 1, 1, b"payload")?;
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(decode_record(&buf), Err(Error::Decode(_))));
        assert!(matches!(decode_record(&buf[..10]), Err(Error::Decode(_))));
        Ok(())
    }

    #[test]
    fn test_chunk_names() {
        assert_eq!(chunk_file_name(3), "chunk-00000003.dat");
        assert_eq!(parse_chunk_id("chunk-00000003.dat"), Some(3));
        assert_eq!(parse_chunk_id("chunk-x.dat"), None);
        assert_eq!(parse_chunk_id("other.dat"), None);
    }

    #[test]
    fn test_append_read_and_scan() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;
        let mut chunk = FileChunk::create(dir.path(), 1)?;

        let (first, first_len) = chunk.append(RecordKind::Put, 0, 1, b"one")?;
        // Readable before it reaches the file
        let record = chunk.read_record(first, first_len)?;
        assert_eq!(decode_record(&record)?.1, b"one");

        chunk.sync()?;
        assert!(chunk.is_synced());
        let (second, second_len) = chunk.append(RecordKind::Remove, 0, 2, &[])?;
        chunk.write_pending()?;
        assert!(!chunk.is_synced());
        let record = chunk.read_record(second, second_len)?;
        assert_eq!(decode_record(&record)?.0.kind, RecordKind::Remove);

        let scan = scan_chunk(1, chunk.path())?;
        assert_eq!(scan.records.len(), 2);
        assert_eq!(scan.valid_len, chunk.len());
        assert!(scan.error.is_none());
        assert!(!scan.is_checkpoint());
        Ok(())
    }

    #[test]
    fn test_sync_record_keeps_lid_limit() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;
        let mut chunk = FileChunk::create(dir.path(), 1)?;
        chunk.append(RecordKind::Put, 2, 4, b"doc")?;
        chunk.append(RecordKind::Sync, 0, 9, &[])?;
        chunk.append(RecordKind::Put, u32::MAX, 10, b"edge")?;
        chunk.sync()?;
        assert_eq!(chunk.last_serial, 10);
        assert_eq!(chunk.lid_limit, u32::MAX);

        let scan = scan_chunk(1, chunk.path())?;
        assert_eq!(scan.records[1].header.kind, RecordKind::Sync);
        assert_eq!(scan.records[1].header.serial, 9);
        assert!(!scan.is_checkpoint());
        let reopened = FileChunk::open(&scan)?;
        assert_eq!(reopened.last_serial, 10);
        assert_eq!(reopened.lid_limit, u32::MAX);
        Ok(())
    }

    #[test]
    fn test_torn_tail_truncated_on_open() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;
        let path = {
            let mut chunk = FileChunk::create(dir.path(), 1)?;
            chunk.append(RecordKind::Put, 3, 5, b"intact")?;
            chunk.sync()?;
            chunk.path().to_path_buf()
        };
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| Error::Storage(e.to_string()))?;
        file.write_all(&[0, 1, 2, 3])
            .map_err(|e| Error::Storage(e.to_string()))?;

        let scan = scan_chunk(1, &path)?;
        assert_eq!(scan.records.len(), 1);
        assert!(scan.error.is_some());
        let chunk = FileChunk::open(&scan)?;
        assert_eq!(chunk.len(), scan.valid_len);
        assert_eq!(chunk.lid_limit, 4);
        assert_eq!(chunk.last_serial, 5);
        let on_disk = std::fs::metadata(&path)
            .map_err(|e| Error::Storage(e.to_string()))?
            .len();
        assert_eq!(on_disk, scan.valid_len);
        Ok(())
    }
}
