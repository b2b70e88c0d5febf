use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

use crate::sync_queue::QueueStats;

/// Metric name prefix for all sync engine metrics
const PREFIX: &str = "offline_sync";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Queue Metrics
    pub static ref JOBS_ADDED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_added_total"), "Total jobs accepted into the queue"),
        &["kind"]
    ).expect("Failed to create jobs_added_total metric");

    pub static ref JOBS_REJECTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_rejected_total"), "Jobs refused at add time"),
        &["reason"]
    ).expect("Failed to create jobs_rejected_total metric");

    pub static ref JOBS_SYNCED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_synced_total"), "Jobs confirmed by the remote"),
        &["kind"]
    ).expect("Failed to create jobs_synced_total metric");

    pub static ref JOBS_FAILED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_failed_total"), "Failed dispatch attempts"),
        &["error_type", "outcome"]
    ).expect("Failed to create jobs_failed_total metric");

    pub static ref QUEUE_JOBS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_queue_jobs"), "Jobs in the local queue by status"),
        &["status"]
    ).expect("Failed to create queue_jobs metric");

    // Flush Metrics
    pub static ref FLUSHES_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_flushes_total"),
        "Total flush cycles run"
    ).expect("Failed to create flushes_total metric");

    pub static ref FLUSH_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            format!("{PREFIX}_flush_duration_seconds"),
            "Flush cycle duration in seconds"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0])
    ).expect("Failed to create flush_duration_seconds metric");

    // Storage Metrics
    pub static ref CLEANUP_REMOVED_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_cleanup_removed_total"),
        "Jobs removed by storage cleanup"
    ).expect("Failed to create cleanup_removed_total metric");

    pub static ref STORAGE_USED_BYTES: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_storage_used_bytes"), "Bytes held by the local store"),
        &["type"]
    ).expect("Failed to create storage_used_bytes metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(JOBS_ADDED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_REJECTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_SYNCED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FAILED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_JOBS.clone()));
    let _ = REGISTRY.register(Box::new(FLUSHES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(FLUSH_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(CLEANUP_REMOVED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(STORAGE_USED_BYTES.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record a job accepted into the queue
pub fn record_job_added(kind: &str) {
    JOBS_ADDED_TOTAL.with_label_values(&[kind]).inc();
}

/// Record a job refused at add time (duplicate, similar, quota)
pub fn record_job_rejected(reason: &str) {
    JOBS_REJECTED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_job_synced(kind: &str) {
    JOBS_SYNCED_TOTAL.with_label_values(&[kind]).inc();
}

/// Record a failed attempt, `terminal` telling whether the job gave up
pub fn record_job_failed(error_type: &str, terminal: bool) {
    let outcome = if terminal { "terminal" } else { "retryable" };
    JOBS_FAILED_TOTAL
        .with_label_values(&[error_type, outcome])
        .inc();
}

pub fn record_flush(duration: Duration) {
    FLUSHES_TOTAL.inc();
    FLUSH_DURATION_SECONDS.observe(duration.as_secs_f64());
}

pub fn record_cleanup_removed(count: usize) {
    CLEANUP_REMOVED_TOTAL.inc_by(count as u64);
}

/// Update queue gauges from store statistics
pub fn update_queue_stats(stats: &QueueStats) {
    QUEUE_JOBS.with_label_values(&["pending"]).set(stats.pending as f64);
    QUEUE_JOBS
        .with_label_values(&["processing"])
        .set(stats.processing as f64);
    QUEUE_JOBS.with_label_values(&["synced"]).set(stats.synced as f64);
    QUEUE_JOBS
        .with_label_values(&["failed_retryable"])
        .set(stats.failed_retryable as f64);
    QUEUE_JOBS
        .with_label_values(&["failed_terminal"])
        .set(stats.failed_terminal as f64);
}

pub fn update_storage_usage(payload_bytes: u64, media_bytes: u64) {
    STORAGE_USED_BYTES
        .with_label_values(&["payload"])
        .set(payload_bytes as f64);
    STORAGE_USED_BYTES
        .with_label_values(&["media"])
        .set(media_bytes as f64);
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => String::from_utf8(buffer).unwrap_or_default(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        // This test ensures metrics can be initialized without panic
        init_metrics();
        init_metrics();

        record_flush(Duration::from_millis(10));
        let metric_families = REGISTRY.gather();
        assert!(!metric_families.is_empty(), "Metrics should be registered");
    }

    #[test]
    fn test_record_job_failed() {
        init_metrics();

        record_job_failed("timeout", false);
        record_job_failed("timeout", true);

        let metrics = REGISTRY.gather();
        let failed = metrics
            .iter()
            .find(|m| m.get_name() == "offline_sync_jobs_failed_total");
        assert!(failed.is_some(), "Failure metrics should exist");
    }

    #[test]
    fn test_queue_gauges_rendered() {
        init_metrics();

        update_queue_stats(&QueueStats {
            pending: 3,
            failed_terminal: 1,
            failed: 1,
            ..Default::default()
        });

        let text = gather_metrics();
        assert!(text.contains("offline_sync_queue_jobs{status=\"pending\"} 3"));
    }
}
