//! Prometheus metrics instrumentation for qbench.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//! They complement the JSONL snapshots: snapshots carry the percentile
//! summary, Prometheus carries per-backend counters for live scraping.
//!
//! # Metrics
//!
//! ## Counters
//! - `qbench_jobs_produced_total` - Jobs accepted by the queue
//! - `qbench_jobs_acknowledged_total` - Jobs acknowledged by workers
//! - `qbench_backend_errors_total` - Failed backend interactions
//! - `qbench_entries_reclaimed_total` - Stream entries claimed from idle consumers
//!
//! ## Histograms
//! - `qbench_job_latency_seconds` - Enqueue-to-completion latency
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, Counter, CounterVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for qbench metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for jobs accepted by the queue.
pub static JOBS_PRODUCED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new("qbench_jobs_produced_total", "Total number of jobs produced")
        .expect("qbench_jobs_produced_total metric creation failed")
});

/// Counter for acknowledged jobs.
///
/// Labels:
/// - `backend`: The queue variant
pub static JOBS_ACKNOWLEDGED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "qbench_jobs_acknowledged_total",
        "Total number of jobs acknowledged",
    );
    CounterVec::new(opts, &["backend"])
        .expect("qbench_jobs_acknowledged_total metric creation failed")
});

/// Counter for failed backend interactions.
///
/// Labels:
/// - `backend`: The queue variant
/// - `op`: The operation (fetch, ack, requeue, submit)
pub static BACKEND_ERRORS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "qbench_backend_errors_total",
        "Total number of failed backend operations",
    );
    CounterVec::new(opts, &["backend", "op"])
        .expect("qbench_backend_errors_total metric creation failed")
});

/// Counter for stream entries claimed from idle consumers.
pub static ENTRIES_RECLAIMED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "qbench_entries_reclaimed_total",
        "Total number of pending stream entries reclaimed",
    )
    .expect("qbench_entries_reclaimed_total metric creation failed")
});

/// Histogram for end-to-end job latency in seconds.
///
/// Labels:
/// - `backend`: The queue variant
pub static JOB_LATENCY_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "qbench_job_latency_seconds",
        "Enqueue-to-completion latency in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["backend"])
        .expect("qbench_job_latency_seconds metric creation failed")
});

/// Register all metrics with the global registry.
///
/// Idempotent: repeated registration is ignored.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_PRODUCED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_ACKNOWLEDGED_TOTAL.clone()),
        Box::new(BACKEND_ERRORS_TOTAL.clone()),
        Box::new(ENTRIES_RECLAIMED_TOTAL.clone()),
        Box::new(JOB_LATENCY_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_jobs_produced(jobs: usize) {
    JOBS_PRODUCED_TOTAL.inc_by(jobs as f64);
}

pub fn record_jobs_acknowledged(backend: &str, jobs: usize) {
    JOBS_ACKNOWLEDGED_TOTAL
        .with_label_values(&[backend])
        .inc_by(jobs as f64);
}

pub fn record_backend_error(backend: &str, op: &str) {
    BACKEND_ERRORS_TOTAL.with_label_values(&[backend, op]).inc();
}

pub fn record_entries_reclaimed(entries: usize) {
    ENTRIES_RECLAIMED_TOTAL.inc_by(entries as f64);
}

pub fn observe_job_latency(backend: &str, latency_secs: f64) {
    JOB_LATENCY_SECONDS
        .with_label_values(&[backend])
        .observe(latency_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization is a no-op");
    }

    #[test]
    fn test_backend_error_labels() {
        record_backend_error("stream", "fetch");
        record_backend_error("skip_locked", "ack");
        assert!(BACKEND_ERRORS_TOTAL.with_label_values(&["stream", "fetch"]).get() >= 1.0);
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_jobs_produced(10);
        record_jobs_acknowledged("partitioned", 10);
        observe_job_latency("partitioned", 0.012);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("qbench_jobs_produced_total"));
        assert!(output.contains("qbench_jobs_acknowledged_total"));
        assert!(output.contains("qbench_job_latency_seconds"));
    }
}
