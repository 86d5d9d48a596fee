//! Tracing and telemetry instrumentation for qbench.
//!
//! Span constructors for the hot paths (fetch, acknowledge, produce,
//! reclaim) and `record_*` helpers that log through `tracing` and, with the
//! `metrics` feature enabled, forward to the Prometheus collectors in
//! [`crate::metrics`]. Every helper works with and without the feature.
//!
//! # Example
//!
//! ```ignore
//! use qbench::telemetry::{fetch_span, record_acknowledged};
//!
//! let span = fetch_span("worker_0", "skip_locked");
//! let _enter = span.enter();
//! // ... fetch and process
//! record_acknowledged("skip_locked", 1);
//! ```

use tracing::{info_span, Span};

/// Create a tracing span for one backend fetch.
#[must_use]
pub fn fetch_span(worker_id: impl AsRef<str>, backend: impl AsRef<str>) -> Span {
    info_span!(
        "qbench.fetch",
        worker_id = %worker_id.as_ref(),
        backend = %backend.as_ref(),
    )
}

/// Create a tracing span for acknowledging a batch of deliveries.
///
/// # Arguments
/// * `worker_id` - The consumer identity
/// * `backend` - The backend name
/// * `jobs` - Deliveries in the batch
#[must_use]
pub fn ack_span(worker_id: impl AsRef<str>, backend: impl AsRef<str>, jobs: usize) -> Span {
    info_span!(
        "qbench.ack",
        worker_id = %worker_id.as_ref(),
        backend = %backend.as_ref(),
        jobs = jobs,
    )
}

/// Create a tracing span for one producer batch.
#[must_use]
pub fn produce_span(backend: impl AsRef<str>, jobs: usize) -> Span {
    info_span!("qbench.produce", backend = %backend.as_ref(), jobs = jobs)
}

/// Create a tracing span for a pending-entry sweep.
#[must_use]
pub fn reclaim_span(consumer: impl AsRef<str>) -> Span {
    info_span!("qbench.reclaim", worker_id = %consumer.as_ref())
}

/// Record a batch accepted by the queue.
pub fn record_produced(backend: impl AsRef<str>, jobs: usize) {
    tracing::debug!(backend = %backend.as_ref(), jobs = jobs, "batch produced");

    #[cfg(feature = "metrics")]
    crate::metrics::record_jobs_produced(jobs);
}

/// Record successfully acknowledged deliveries.
pub fn record_acknowledged(backend: impl AsRef<str>, jobs: usize) {
    tracing::debug!(backend = %backend.as_ref(), jobs = jobs, "jobs acknowledged");

    #[cfg(feature = "metrics")]
    crate::metrics::record_jobs_acknowledged(backend.as_ref(), jobs);
}

/// Record a failed backend interaction.
///
/// # Arguments
/// * `worker_id` - Who saw the failure
/// * `backend` - The backend name
/// * `op` - The operation (`fetch`, `ack`, `requeue`, `submit`)
/// * `error` - The error, logged with its context chain
pub fn record_backend_error(
    worker_id: impl AsRef<str>,
    backend: impl AsRef<str>,
    op: &str,
    error: &anyhow::Error,
) {
    tracing::warn!(
        worker_id = %worker_id.as_ref(),
        backend = %backend.as_ref(),
        op = op,
        error = %format!("{error:#}"),
        "backend operation failed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_backend_error(backend.as_ref(), op);
}

/// Record stream entries claimed from other consumers.
pub fn record_reclaimed(consumer: impl AsRef<str>, entries: usize) {
    tracing::info!(
        worker_id = %consumer.as_ref(),
        entries = entries,
        "reclaimed stale pending entries"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_entries_reclaimed(entries);
}

/// Observe one end-to-end latency sample, in milliseconds.
pub fn observe_latency(backend: impl AsRef<str>, latency_ms: f64) {
    tracing::trace!(backend = %backend.as_ref(), latency_ms = latency_ms, "latency observed");

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_latency(backend.as_ref(), latency_ms / 1000.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_span() {
        let _guard = tracing::subscriber::set_default(tracing_subscriber::fmt().finish());
        let span = fetch_span("worker_0", "skip_locked");
        assert_eq!(span.metadata().unwrap().name(), "qbench.fetch");
    }

    #[test]
    fn test_ack_span() {
        let _guard = tracing::subscriber::set_default(tracing_subscriber::fmt().finish());
        let span = ack_span("worker_0", "stream", 50);
        assert_eq!(span.metadata().unwrap().name(), "qbench.ack");
    }

    #[test]
    fn test_produce_span() {
        let _guard = tracing::subscriber::set_default(tracing_subscriber::fmt().finish());
        let span = produce_span("partitioned", 10);
        assert_eq!(span.metadata().unwrap().name(), "qbench.produce");
    }

    #[test]
    fn test_reclaim_span() {
        let _guard = tracing::subscriber::set_default(tracing_subscriber::fmt().finish());
        let span = reclaim_span("worker_3");
        assert_eq!(span.metadata().unwrap().name(), "qbench.reclaim");
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_produced("stream", 10);
        record_acknowledged("stream", 10);
        record_backend_error("worker_1", "stream", "fetch", &anyhow::anyhow!("reset"));
        record_reclaimed("worker_1", 2);
        observe_latency("stream", 12.5);
    }
}
