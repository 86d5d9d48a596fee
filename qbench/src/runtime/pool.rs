use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::aggregator::MetricsAggregator;
use crate::backend::QueueBackend;
use crate::runtime::worker::{Worker, WorkerReport};
use crate::runtime::{JobProcessor, ShutdownToken};

/// How long [`WorkerPool::shutdown`] waits for each worker to finish its
/// in-flight batch.
pub const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Totals across the pool, one entry per worker in spawn order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub workers: Vec<WorkerReport>,
}

impl PoolReport {
    /// Jobs acknowledged across all workers.
    pub fn total_processed(&self) -> u64 {
        self.workers.iter().map(|w| w.processed).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.workers.iter().map(|w| w.failed).sum()
    }

    pub fn total_backend_errors(&self) -> u64 {
        self.workers.iter().map(|w| w.backend_errors).sum()
    }
}

/// N independent consumer loops, each over its own backend instance.
///
/// Workers share only the processor and the aggregator; stopping is
/// cooperative through the [`ShutdownToken`].
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<(String, JoinHandle<WorkerReport>)>,
    shutdown: ShutdownToken,
}

impl WorkerPool {
    /// Spawn one worker per backend.
    pub fn spawn<B, P>(
        backends: Vec<B>,
        processor: Arc<P>,
        aggregator: Arc<MetricsAggregator>,
        shutdown: ShutdownToken,
    ) -> Self
    where
        B: QueueBackend + 'static,
        P: JobProcessor + ?Sized + 'static,
    {
        let handles = backends
            .into_iter()
            .map(|backend| {
                let worker_id = backend.worker_id().to_string();
                let worker = Worker::new(
                    backend,
                    Arc::clone(&processor),
                    Arc::clone(&aggregator),
                    shutdown.clone(),
                );
                (worker_id, tokio::spawn(worker.run()))
            })
            .collect();

        Self { handles, shutdown }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Signal stop and wait for every worker to finish its in-flight work.
    pub async fn shutdown(self) -> PoolReport {
        tracing::info!(workers = self.handles.len(), "stopping worker pool");
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for every worker without signalling stop.
    pub async fn join(self) -> PoolReport {
        let mut report = PoolReport::default();

        // Workers finish concurrently; each gets its own timeout.
        let results = futures::future::join_all(self.handles.into_iter().map(
            |(worker_id, handle)| async move {
                (worker_id, tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, handle).await)
            },
        ))
        .await;

        for (worker_id, result) in results {
            match result {
                Ok(Ok(worker)) => report.workers.push(worker),
                Ok(Err(e)) => {
                    tracing::warn!(worker_id = %worker_id, error = %e, "worker task failed");
                    report.workers.push(WorkerReport {
                        worker_id,
                        ..WorkerReport::default()
                    });
                }
                Err(_) => {
                    tracing::warn!(worker_id = %worker_id, "worker task timed out during shutdown");
                    report.workers.push(WorkerReport {
                        worker_id,
                        ..WorkerReport::default()
                    });
                }
            }
        }

        tracing::info!(
            processed = report.total_processed(),
            failed = report.total_failed(),
            "worker pool stopped"
        );
        report
    }
}
