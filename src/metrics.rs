//! Prometheus metrics for the storage layer
//!
//! Features:
//! - Document cache lookups (hit/miss)
//! - Document store operations by kind and outcome
//! - Flush latency
//! - Disk footprint and bloat
//! - Buffer pool memory usage

use crate::datastore::MemoryUsage;
use prometheus::{
    core::{AtomicU64, GenericGauge},
    Encoder, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref CACHE_LOOKUPS: IntCounterVec = IntCounterVec::new(
        Opts::new("photondb_docstore_cache_lookups_total", "Document cache lookups"),
        &["result"]
    ).unwrap();

    pub static ref OPERATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("photondb_docstore_operations_total", "Document store operations"),
        &["op", "status"]
    ).unwrap();

    pub static ref FLUSH_DURATION: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "photondb_docstore_flush_duration_seconds",
            "Flush duration in seconds"
        ).buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["kind"]
    ).unwrap();

    pub static ref DISK_FOOTPRINT: GenericGauge<AtomicU64> = GenericGauge::new(
        "photondb_docstore_disk_footprint_bytes",
        "Bytes on disk used by the document store"
    ).unwrap();

    pub static ref DISK_BLOAT: GenericGauge<AtomicU64> = GenericGauge::new(
        "photondb_docstore_disk_bloat_bytes",
        "Bytes on disk held by superseded or removed records"
    ).unwrap();

    pub static ref BUFFER_POOL_MEMORY: IntGaugeVec = IntGaugeVec::new(
        Opts::new("photondb_buffer_pool_memory_bytes", "Buffer pool memory usage"),
        &["pool", "kind"]
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    info!("Initializing Prometheus metrics");

    METRICS_REGISTRY.register(Box::new(CACHE_LOOKUPS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(OPERATIONS_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(FLUSH_DURATION.clone())).ok();
    METRICS_REGISTRY.register(Box::new(DISK_FOOTPRINT.clone())).ok();
    METRICS_REGISTRY.register(Box::new(DISK_BLOAT.clone())).ok();
    METRICS_REGISTRY.register(Box::new(BUFFER_POOL_MEMORY.clone())).ok();

    #[cfg(target_os = "linux")]
    METRICS_REGISTRY
        .register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))
        .ok();

    info!("Metrics initialized successfully");
}

/// Record a document cache lookup
pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    CACHE_LOOKUPS.with_label_values(&[result]).inc();
}

/// Record a document store operation
pub fn record_operation(op: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    OPERATIONS_TOTAL.with_label_values(&[op, status]).inc();
}

pub fn observe_flush(kind: &str, seconds: f64) {
    FLUSH_DURATION.with_label_values(&[kind]).observe(seconds);
}

/// Update disk gauges
pub fn update_disk_metrics(footprint: u64, bloat: u64) {
    DISK_FOOTPRINT.set(footprint);
    DISK_BLOAT.set(bloat);
}

/// Publish a buffer pool's memory usage under `pool`
pub fn update_memory_usage(pool: &str, usage: &MemoryUsage) {
    let values = [
        ("allocated", usage.allocated_bytes),
        ("used", usage.used_bytes),
        ("dead", usage.dead_bytes),
        ("hold", usage.allocated_bytes_on_hold),
    ];
    for (kind, bytes) in values {
        BUFFER_POOL_MEMORY
            .with_label_values(&[pool, kind])
            .set(bytes as i64);
    }
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        init_metrics();
        // Registering twice must not panic
    }

    #[test]
    fn test_record_cache_lookup() {
        let before = CACHE_LOOKUPS.with_label_values(&["hit"]).get();
        record_cache_lookup(true);
        assert!(CACHE_LOOKUPS.with_label_values(&["hit"]).get() > before);
    }

    #[test]
    fn test_memory_usage_gauges() {
        update_memory_usage("test", &MemoryUsage::new(4096, 100, 10, 5));
        assert_eq!(BUFFER_POOL_MEMORY.with_label_values(&["test", "allocated"]).get(), 4096);
        assert_eq!(BUFFER_POOL_MEMORY.with_label_values(&["test", "hold"]).get(), 5);
    }

    #[test]
    fn test_export_metrics() {
        init_metrics();
        record_operation("write", true);
        update_disk_metrics(1024, 0);

        let output = export_metrics();
        assert!(output.contains("photondb_docstore_operations_total"));
        assert!(output.contains("photondb_docstore_disk_footprint_bytes"));
    }
}
