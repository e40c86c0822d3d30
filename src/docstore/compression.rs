//! Compression support for stored documents
//!
//! Every stored blob starts with a 5 byte header so it can be decoded no
//! matter how the store is configured when it is read back:
//!
//! ```text
//! [tag: u8][uncompressed length: u32 LE][payload]
//!  tag 0 = raw, 1 = zstd
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

pub const HEADER_LEN: usize = 5;

const TAG_NONE: u8 = 0;
const TAG_ZSTD: u8 = 1;

/// Compression algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Zstd,
}

impl CompressionAlgorithm {
    fn tag(self) -> u8 {
        match self {
            Self::None => TAG_NONE,
            Self::Zstd => TAG_ZSTD,
        }
    }
}

/// Compression settings applied on the write path
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub algorithm: CompressionAlgorithm,
    /// zstd level
    pub level: i32,
    /// Keep the compressed form only if it is at most this percentage of the input
    pub threshold: u8,
    /// Inputs shorter than this are stored raw
    pub min_size: usize,
}

impl CompressionConfig {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn zstd(level: i32) -> Self {
        Self {
            algorithm: CompressionAlgorithm::Zstd,
            level,
            ..Self::default()
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            level: 3,
            threshold: 90,
            min_size: 0,
        }
    }
}

/// Encode `data` into a self-describing blob
pub fn encode(data: &[u8], config: &CompressionConfig) -> Result<Vec<u8>> {
    let len = u32::try_from(data.len()).map_err(|_| {
        Error::InvalidArgument(format!("Payload of {} bytes is too large", data.len()))
    })?;

    let compressed = match config.algorithm {
        CompressionAlgorithm::Zstd if data.len() >= config.min_size => {
            let compressed = compress(data, config)?;
            let limit = data.len() * config.threshold as usize / 100;
            (compressed.len() <= limit).then_some(compressed)
        }
        _ => None,
    };

    let (tag, payload) = match &compressed {
        Some(compressed) => (config.algorithm.tag(), compressed.as_slice()),
        None => (TAG_NONE, data),
    };
    let mut blob = Vec::with_capacity(HEADER_LEN + payload.len());
    blob.push(tag);
    blob.extend_from_slice(&len.to_le_bytes());
    blob.extend_from_slice(payload);
    Ok(blob)
}

/// Decode a blob produced by [`encode`]
pub fn decode(blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < HEADER_LEN {
        return Err(Error::Decode(format!(
            "Blob too short: {} bytes",
            blob.len()
        )));
    }
    let len = u32::from_le_bytes([blob[1], blob[2], blob[3], blob[4]]) as usize;
    let payload = &blob[HEADER_LEN..];
    let data = match blob[0] {
        TAG_NONE => payload.to_vec(),
        TAG_ZSTD => decompress(payload, len)?,
        tag => return Err(Error::Decode(format!("Unknown compression tag: {}", tag))),
    };
    if data.len() != len {
        return Err(Error::Decode(format!(
            "Length mismatch: header says {} bytes, got {}",
            len,
            data.len()
        )));
    }
    Ok(data)
}

/// Decompress at most `len + 1` bytes; the buffer grows with the real output,
/// not with the length claimed by the header
fn decompress(payload: &[u8], len: usize) -> Result<Vec<u8>> {
    let decoder = zstd::Decoder::new(payload)
        .map_err(|e| Error::Compression(format!("Failed to create zstd decoder: {}", e)))?;
    let mut data = Vec::new();
    decoder
        .take(len as u64 + 1)
        .read_to_end(&mut data)
        .map_err(|e| Error::Compression(format!("Failed to decompress: {}", e)))?;
    Ok(data)
}

fn compress(data: &[u8], config: &CompressionConfig) -> Result<Vec<u8>> {
    let mut encoder = zstd::Encoder::new(Vec::new(), config.level)
        .map_err(|e| Error::Compression(format!("Failed to create zstd encoder: {}", e)))?;
    encoder
        .write_all(data)
        .map_err(|e| Error::Compression(format!("Failed to compress: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Compression(format!("Failed to finish compression: {}", e)))
}

/// Compression statistics
#[derive(Debug, Clone)]
pub struct CompressionStats {
    pub original_size: usize,
    pub compressed_size: usize,
    pub ratio: f64,
}

impl CompressionStats {
    pub fn new(original_size: usize, compressed_size: usize) -> Self {
        let ratio = if original_size > 0 {
            compressed_size as f64 / original_size as f64
        } else {
            1.0
        };
        Self {
            original_size,
            compressed_size,
            ratio,
        }
    }

    /// Calculate space saved (percentage)
    pub fn space_saved_percent(&self) -> f64 {
        (1.0 - self.ratio) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_none() -> Result<()> {
        let data = b"Hello, World!";
        let blob = encode(data, &CompressionConfig::none())?;
        assert_eq!(blob[0], TAG_NONE);
        assert_eq!(&blob[HEADER_LEN..], data);
        assert_eq!(decode(&blob)?, data);
        Ok(())
    }

    #[test]
    fn test_encode_zstd() -> Result<()> {
        let data = b"Hello, World! This is a test of zstd compression. ".repeat(10);
        let blob = encode(&data, &CompressionConfig::zstd(3))?;

        // Compression should reduce size for repetitive data
        assert_eq!(blob[0], TAG_ZSTD);
        assert!(blob.len() < data.len());
        assert_eq!(decode(&blob)?, data);
        Ok(())
    }

    #[test]
    fn test_incompressible_kept_raw() -> Result<()> {
        let data: Vec<u8> = (0..64u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let config = CompressionConfig {
            threshold: 10,
            ..CompressionConfig::zstd(3)
        };
        let blob = encode(&data, &config)?;
        assert_eq!(blob[0], TAG_NONE);
        assert_eq!(decode(&blob)?, data);
        Ok(())
    }

    #[test]
    fn test_decode_regardless_of_config() -> Result<()> {
        let data = b"abcabcabcabcabcabcabcabcabcabcabcabc".repeat(4);
        let blob = encode(&data, &CompressionConfig::zstd(1))?;
        // Reader needs no configuration
        assert_eq!(decode(&blob)?, data);
        Ok(())
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode(&[0, 1]), Err(Error::Decode(_))));
        assert!(matches!(decode(&[9, 0, 0, 0, 0]), Err(Error::Decode(_))));
        assert!(matches!(decode(&[0, 4, 0, 0, 0, 1]), Err(Error::Decode(_))));
        assert!(matches!(decode(&[1, 4, 0, 0, 0, 1, 2]), Err(Error::Compression(_))));
    }

    #[test]
    fn test_corrupt_length_header() -> Result<()> {
        let data = "abc".repeat(100);
        let mut blob = encode(data.as_bytes(), &CompressionConfig::zstd(3))?;
        assert_eq!(blob[0], TAG_ZSTD);

        // Claims 4 GiB; decoding only grows to the real frame size
        blob[1..5].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(decode(&blob), Err(Error::Decode(_))));

        // Claims less than the frame holds
        blob[1..5].copy_from_slice(&10u32.to_le_bytes());
        assert!(matches!(decode(&blob), Err(Error::Decode(_))));
        Ok(())
    }

    #[test]
    fn test_compression_stats() {
        let stats = CompressionStats::new(1000, 250);
        assert_eq!(stats.ratio, 0.25);
        assert_eq!(stats.space_saved_percent(), 75.0);
    }
}
