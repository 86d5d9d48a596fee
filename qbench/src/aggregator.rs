//! Online latency/throughput accumulator shared by every worker.
//!
//! Samples are kept in full for the whole run and percentiles are exact:
//! each [`MetricsAggregator::snapshot`] sorts a copy of the cumulative
//! history, which costs O(n log n) and grows with the run. A streaming
//! estimator would bound that cost at the price of exactness.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::runtime::ShutdownToken;

/// Point-in-time view of everything recorded so far.
///
/// Snapshots are cumulative: `elapsed` and `jobs_processed` never decrease
/// over a run. Latencies are in milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Seconds since the aggregator was created.
    #[serde(rename = "elapsed")]
    pub elapsed_seconds: f64,
    pub jobs_processed: u64,
    /// Cumulative jobs per second since creation.
    pub throughput: f64,
    #[serde(rename = "latency_p50")]
    pub p50: f64,
    #[serde(rename = "latency_p95")]
    pub p95: f64,
    #[serde(rename = "latency_p99")]
    pub p99: f64,
    #[serde(rename = "latency_min")]
    pub min: f64,
    #[serde(rename = "latency_max")]
    pub max: f64,
    #[serde(rename = "latency_avg")]
    pub avg: f64,
}

#[derive(Debug, Default)]
struct Samples {
    latencies: Vec<f64>,
    processed: u64,
}

/// Concurrency-safe sample accumulator.
///
/// One mutex guards both the sample list and the processed counter so the
/// two always agree. The lock is held only for the in-memory append or copy.
#[derive(Debug)]
pub struct MetricsAggregator {
    samples: Mutex<Samples>,
    started: Instant,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(Samples::default()),
            started: Instant::now(),
        }
    }

    /// Record one completed job.
    pub fn record(&self, latency_ms: f64) {
        let mut samples = self.samples.lock();
        samples.latencies.push(latency_ms);
        samples.processed += 1;
    }

    /// Record a batch of completed jobs under a single lock acquisition.
    pub fn record_batch(&self, latencies_ms: &[f64]) {
        if latencies_ms.is_empty() {
            return;
        }
        let mut samples = self.samples.lock();
        samples.latencies.extend_from_slice(latencies_ms);
        samples.processed += latencies_ms.len() as u64;
    }

    /// Jobs recorded so far.
    pub fn count(&self) -> u64 {
        self.samples.lock().processed
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Summarize every sample recorded so far; `None` until the first one.
    pub fn snapshot(&self) -> Option<MetricsSnapshot> {
        let (mut sorted, processed) = {
            let samples = self.samples.lock();
            if samples.latencies.is_empty() {
                return None;
            }
            (samples.latencies.clone(), samples.processed)
        };
        let elapsed = self.started.elapsed().as_secs_f64();

        sorted.sort_unstable_by(f64::total_cmp);
        let n = sorted.len();
        let sum: f64 = sorted.iter().sum();

        Some(MetricsSnapshot {
            timestamp: Utc::now(),
            elapsed_seconds: elapsed,
            jobs_processed: processed,
            throughput: if elapsed > 0.0 {
                processed as f64 / elapsed
            } else {
                0.0
            },
            p50: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
            min: sorted[0],
            max: sorted[n - 1],
            avg: sum / n as f64,
        })
    }
}

/// Nearest-rank percentile over an ascending slice: the element at
/// `floor(p × n)`, clamped to the last index. Empty input yields 0.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = (p * sorted.len() as f64).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Open (or create) an append-only JSONL metrics file.
pub async fn open_metrics_file(path: impl AsRef<Path>) -> anyhow::Result<tokio::fs::File> {
    use anyhow::Context;

    let path = path.as_ref();
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open metrics file {}", path.display()))
}

async fn write_snapshot<W>(writer: &mut W, snapshot: &MetricsSnapshot) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(snapshot)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Append one snapshot line to `writer` every `interval` until shutdown,
/// then write a final snapshot. Ticks before the first sample write
/// nothing. Returns the number of lines written.
///
/// Write failures are logged and the emitter keeps going; the metrics sink
/// never stops the benchmark.
pub async fn emit_periodically<W>(
    aggregator: Arc<MetricsAggregator>,
    mut writer: W,
    interval: Duration,
    shutdown: ShutdownToken,
) -> u64
where
    W: AsyncWrite + Unpin,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    let mut written = 0;
    loop {
        let stopping = tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = ticker.tick() => false,
        };

        if let Some(snapshot) = aggregator.snapshot() {
            match write_snapshot(&mut writer, &snapshot).await {
                Ok(()) => written += 1,
                Err(err) => warn!(error = %err, "failed to write metrics snapshot"),
            }
        }

        if stopping {
            debug!(lines = written, "metrics emitter stopped");
            return written;
        }
    }
}
