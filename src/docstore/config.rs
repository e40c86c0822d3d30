//! Document store configuration
//!
//! ```toml
//! max_cache_bytes = 16777216
//! max_cache_entries = 0
//! max_bloat_ratio = 0.3
//!
//! [compression]
//! algorithm = "zstd"
//! level = 3
//!
//! [log]
//! max_chunk_bytes = 268435456
//! ```
//!
//! [`DocumentStoreConfig::load`] layers environment variables prefixed with
//! `PHOTONDB_DOCSTORE` over the file, e.g. `PHOTONDB_DOCSTORE_MAX_CACHE_BYTES`
//! or `PHOTONDB_DOCSTORE_LOG__MAX_CHUNK_BYTES`.

use super::compression::CompressionConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_PREFIX: &str = "PHOTONDB_DOCSTORE";

/// Settings for the file-backed log store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStoreConfig {
    /// Size at which the active chunk is closed and a new one started
    pub max_chunk_bytes: u64,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Document store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentStoreConfig {
    pub compression: CompressionConfig,
    /// Cache byte budget; 0 disables the cache
    pub max_cache_bytes: usize,
    /// Cache entry budget; 0 means unbounded
    pub max_cache_entries: usize,
    /// Disk bloat ratio above which compaction is due
    pub max_bloat_ratio: f64,
    pub log: LogStoreConfig,
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        Self {
            compression: CompressionConfig::default(),
            max_cache_bytes: 16 * 1024 * 1024,
            max_cache_entries: 0,
            max_bloat_ratio: 0.3,
            log: LogStoreConfig::default(),
        }
    }
}

impl DocumentStoreConfig {
    pub fn new(compression: CompressionConfig, max_cache_bytes: usize, max_cache_entries: usize) -> Self {
        Self {
            compression,
            max_cache_bytes,
            max_cache_entries,
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, with environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(format!("Failed to load config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.max_bloat_ratio > 0.0 && self.max_bloat_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "max_bloat_ratio must be in (0, 1], got {}",
                self.max_bloat_ratio
            )));
        }
        if self.compression.threshold > 100 {
            return Err(Error::Config(format!(
                "compression threshold must be a percentage, got {}",
                self.compression.threshold
            )));
        }
        if self.log.max_chunk_bytes == 0 {
            return Err(Error::Config("log.max_chunk_bytes must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::compression::CompressionAlgorithm;
    use std::io::Write;

    #[test]
    fn test_defaults() -> Result<()> {
        let config = DocumentStoreConfig::default();
        config.validate()?;
        assert_eq!(config.compression.algorithm, CompressionAlgorithm::None);
        assert_eq!(config.max_cache_entries, 0);
        Ok(())
    }

    #[test]
    fn test_from_toml() -> Result<()> {
        let config = DocumentStoreConfig::from_toml_str(
            r#"
            max_cache_bytes = 1024
            max_bloat_ratio = 0.5

            [compression]
            algorithm = "zstd"
            level = 6

            [log]
            max_chunk_bytes = 4096
            "#,
        )?;
        assert_eq!(config.max_cache_bytes, 1024);
        assert_eq!(config.max_bloat_ratio, 0.5);
        assert_eq!(config.compression.algorithm, CompressionAlgorithm::Zstd);
        assert_eq!(config.compression.level, 6);
        assert_eq!(config.compression.threshold, 90);
        assert_eq!(config.log.max_chunk_bytes, 4096);
        Ok(())
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            DocumentStoreConfig::from_toml_str("max_bloat_ratio = 0.0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            DocumentStoreConfig::from_toml_str("[log]\nmax_chunk_bytes = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            DocumentStoreConfig::from_toml_str("max_cache_bytes = \"lots\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .map_err(|e| Error::Storage(e.to_string()))?;
        writeln!(file, "max_cache_entries = 7\n[compression]\nalgorithm = \"zstd\"")
            .map_err(|e| Error::Storage(e.to_string()))?;

        let config = DocumentStoreConfig::load(file.path())?;
        assert_eq!(config.max_cache_entries, 7);
        assert_eq!(config.compression.algorithm, CompressionAlgorithm::Zstd);
        assert_eq!(config.max_cache_bytes, DocumentStoreConfig::default().max_cache_bytes);
        Ok(())
    }
}
