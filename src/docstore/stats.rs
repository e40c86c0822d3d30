//! Storage health statistics

use serde::{Deserialize, Serialize};

/// Storage statistics of a whole backing store
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DataStoreStorageStats {
    pub disk_usage: u64,
    pub disk_bloat: u64,
    /// Highest serial written
    pub last_serial_num: u64,
    /// Highest serial made durable
    pub last_flushed_serial_num: u64,
    pub doc_id_limit: u32,
}

impl DataStoreStorageStats {
    pub fn new(
        disk_usage: u64,
        disk_bloat: u64,
        last_serial_num: u64,
        last_flushed_serial_num: u64,
        doc_id_limit: u32,
    ) -> Self {
        Self {
            disk_usage,
            disk_bloat,
            last_serial_num,
            last_flushed_serial_num,
            doc_id_limit,
        }
    }

    /// Share of the disk footprint held by dead records
    pub fn bloat_ratio(&self) -> f64 {
        if self.disk_usage == 0 {
            0.0
        } else {
            self.disk_bloat as f64 / self.disk_usage as f64
        }
    }
}

/// Statistics of one file chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DataStoreFileChunkStats {
    pub name_id: u64,
    pub disk_usage: u64,
    pub disk_bloat: u64,
    pub last_serial_num: u64,
    pub last_flushed_serial_num: u64,
    pub doc_id_limit: u32,
}

impl DataStoreFileChunkStats {
    pub fn bloat_ratio(&self) -> f64 {
        if self.disk_usage == 0 {
            0.0
        } else {
            self.disk_bloat as f64 / self.disk_usage as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloat_ratio() {
        let stats = DataStoreStorageStats::new(1000, 250, 10, 8, 100);
        assert_eq!(stats.bloat_ratio(), 0.25);
        assert_eq!(DataStoreStorageStats::default().bloat_ratio(), 0.0);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = DataStoreFileChunkStats {
            name_id: 3,
            disk_usage: 64,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"name_id\":3"));
    }
}
