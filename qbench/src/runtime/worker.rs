use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn, Instrument};

use crate::aggregator::MetricsAggregator;
use crate::backend::QueueBackend;
use crate::delivery::Delivery;
use crate::error::PartialAck;
use crate::runtime::{JobProcessor, ProcessOutcome, ShutdownToken};
use crate::telemetry;

/// Where a worker is in its consume loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum WorkerState {
    Fetching,
    Processing,
    Acknowledging,
    BackingOff,
    Stopped,
}

/// Per-worker totals reported when the loop stops.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: String,
    /// Jobs acknowledged and recorded into the aggregator.
    pub processed: u64,
    /// Jobs whose processing failed.
    pub failed: u64,
    /// Failed backend interactions (fetch, acknowledge, requeue).
    pub backend_errors: u64,
}

/// One consumer: a private backend, the shared processor and aggregator.
pub(crate) struct Worker<B, P: ?Sized> {
    backend: B,
    processor: Arc<P>,
    aggregator: Arc<MetricsAggregator>,
    shutdown: ShutdownToken,
    state: WorkerState,
    in_flight: Vec<Delivery>,
    completed: Vec<Delivery>,
    latencies: Vec<f64>,
    report: WorkerReport,
}

impl<B, P> Worker<B, P>
where
    B: QueueBackend,
    P: JobProcessor + ?Sized,
{
    pub(crate) fn new(
        backend: B,
        processor: Arc<P>,
        aggregator: Arc<MetricsAggregator>,
        shutdown: ShutdownToken,
    ) -> Self {
        let report = WorkerReport {
            worker_id: backend.worker_id().to_string(),
            ..WorkerReport::default()
        };
        Self {
            backend,
            processor,
            aggregator,
            shutdown,
            state: WorkerState::Fetching,
            in_flight: Vec::new(),
            completed: Vec::new(),
            latencies: Vec::new(),
            report,
        }
    }

    /// Drive the state machine until shutdown is observed at a fetch
    /// boundary. In-flight jobs always finish processing and acknowledgement
    /// first.
    pub(crate) async fn run(mut self) -> WorkerReport {
        info!(
            worker_id = %self.report.worker_id,
            backend = %self.backend.kind(),
            "worker started"
        );

        while self.state != WorkerState::Stopped {
            self.state = match self.state {
                WorkerState::Fetching => self.fetch().await,
                WorkerState::Processing => self.process().await,
                WorkerState::Acknowledging => self.acknowledge().await,
                WorkerState::BackingOff => self.back_off().await,
                WorkerState::Stopped => WorkerState::Stopped,
            };
        }

        if let Err(err) = self.backend.close().await {
            warn!(worker_id = %self.report.worker_id, error = %err, "failed to close backend");
        }
        info!(
            worker_id = %self.report.worker_id,
            processed = self.report.processed,
            failed = self.report.failed,
            "worker stopped"
        );
        self.report
    }

    async fn fetch(&mut self) -> WorkerState {
        if self.shutdown.is_cancelled() {
            return WorkerState::Stopped;
        }

        let span = telemetry::fetch_span(&self.report.worker_id, self.backend.kind().as_str());
        match self.backend.fetch().instrument(span).await {
            Ok(deliveries) if deliveries.is_empty() => {
                if self.backend.fetch_blocks() {
                    WorkerState::Fetching
                } else {
                    WorkerState::BackingOff
                }
            }
            Ok(deliveries) => {
                self.in_flight = deliveries;
                WorkerState::Processing
            }
            Err(err) => {
                self.backend_error("fetch", &err);
                WorkerState::BackingOff
            }
        }
    }

    async fn process(&mut self) -> WorkerState {
        for delivery in std::mem::take(&mut self.in_flight) {
            match self.processor.process(&delivery.job).await {
                ProcessOutcome::Done => {
                    self.latencies.push(delivery.latency_ms(Utc::now()));
                    self.completed.push(delivery);
                }
                ProcessOutcome::Failed(reason) => {
                    self.report.failed += 1;
                    warn!(
                        worker_id = %self.report.worker_id,
                        job_id = %delivery.job.id,
                        reason = %reason,
                        "job processing failed"
                    );
                    if let Err(err) = self.backend.fail_or_requeue(delivery).await {
                        self.backend_error("requeue", &err);
                    }
                }
            }
        }

        if self.completed.is_empty() {
            WorkerState::Fetching
        } else {
            WorkerState::Acknowledging
        }
    }

    async fn acknowledge(&mut self) -> WorkerState {
        let backend = self.backend.kind().as_str();
        let span = telemetry::ack_span(&self.report.worker_id, backend, self.completed.len());
        let result = self.backend.acknowledge(&self.completed).instrument(span).await;

        self.completed.clear();
        let mut latencies = std::mem::take(&mut self.latencies);
        let (acknowledged, error) = match result {
            Ok(n) => (n, None),
            Err(err) => (PartialAck::acknowledged_before(&err), Some(err)),
        };

        // Only what this call acknowledged is counted: entries another
        // consumer already acknowledged, and the unfinished tail of a
        // failed batch, are not.
        latencies.truncate(acknowledged);
        if !latencies.is_empty() {
            self.aggregator.record_batch(&latencies);
            self.report.processed += latencies.len() as u64;
            telemetry::record_acknowledged(backend, latencies.len());
            for &latency in &latencies {
                telemetry::observe_latency(backend, latency);
            }
        }

        match error {
            None => WorkerState::Fetching,
            Some(err) => {
                // Unacknowledged jobs are redelivered by the backend.
                self.backend_error("ack", &err);
                WorkerState::BackingOff
            }
        }
    }

    async fn back_off(&mut self) -> WorkerState {
        tokio::select! {
            _ = self.shutdown.cancelled() => WorkerState::Stopped,
            _ = tokio::time::sleep(self.backend.poll_interval()) => WorkerState::Fetching,
        }
    }

    fn backend_error(&mut self, op: &str, err: &anyhow::Error) {
        self.report.backend_errors += 1;
        telemetry::record_backend_error(
            &self.report.worker_id,
            self.backend.kind().as_str(),
            op,
            err,
        );
    }
}
