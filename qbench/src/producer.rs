use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn, Instrument};

use crate::backend::{BackendKind, JobSink};
use crate::config::BenchConfig;
use crate::job::JobFactory;
use crate::runtime::ShutdownToken;
use crate::telemetry;

/// Batches submitted per second at any rate.
pub const BATCHES_PER_SECOND: u64 = 100;

/// Outcome of one production run.
#[derive(Clone, Debug, PartialEq)]
pub struct ProducerReport {
    pub jobs_produced: u64,
    /// Batches the sink rejected; none of their jobs were stored.
    pub failed_batches: u64,
    pub elapsed: Duration,
    /// Jobs per second actually achieved.
    pub achieved_rate: f64,
    /// Whether shutdown cut the run short.
    pub interrupted: bool,
}

/// Open-loop producer: emits `rate × duration` jobs at a fixed cadence
/// regardless of how fast workers consume them.
#[derive(Debug)]
pub struct RateLimitedProducer {
    factory: JobFactory,
    backend: BackendKind,
}

impl RateLimitedProducer {
    pub fn new(factory: JobFactory, backend: BackendKind) -> Self {
        Self { factory, backend }
    }

    /// Job generator sized and seeded from `config`; only the partitioned
    /// backend gets partition keys.
    pub fn from_config(config: &BenchConfig) -> Self {
        let mut factory = JobFactory::new(config.job_size_bytes, config.seed);
        if config.backend == BackendKind::Partitioned {
            factory = factory.with_partitions(config.partitions);
        }
        Self::new(factory, config.backend)
    }

    /// Jobs per batch so that roughly [`BATCHES_PER_SECOND`] batches go out
    /// each second.
    pub fn batch_size(rate: u64) -> u64 {
        (rate / BATCHES_PER_SECOND).max(1)
    }

    /// Produce into `sink` until `rate × duration` jobs are stored or
    /// shutdown is signalled. The sink is closed on every exit path.
    ///
    /// The schedule advances by a fixed interval per batch rather than from
    /// "now", so a slow sink is caught up with back-to-back batches instead
    /// of drifting the overall rate.
    pub async fn run<S>(
        &mut self,
        sink: &mut S,
        rate: u64,
        duration: Duration,
        shutdown: &ShutdownToken,
    ) -> ProducerReport
    where
        S: JobSink + ?Sized,
    {
        let rate = rate.max(1);
        let total = (rate as f64 * duration.as_secs_f64()).round() as u64;
        let batch = Self::batch_size(rate);
        let interval = Duration::from_secs_f64(batch as f64 / rate as f64);
        let progress_every = rate * 10;

        info!(
            backend = %self.backend,
            rate,
            duration_secs = duration.as_secs_f64(),
            total,
            "producer started"
        );

        let start = Instant::now();
        let mut next_batch_at = start;
        let mut next_progress = progress_every;
        let mut produced = 0u64;
        let mut failed_batches = 0u64;
        let mut interrupted = false;

        while produced < total {
            if shutdown.is_cancelled() {
                interrupted = true;
                break;
            }

            let n = batch.min(total - produced) as usize;
            let jobs = self.factory.batch(n);
            let span = telemetry::produce_span(self.backend.as_str(), n);
            match sink.submit(&jobs).instrument(span).await {
                Ok(()) => {
                    produced += n as u64;
                    telemetry::record_produced(self.backend.as_str(), n);
                }
                Err(err) => {
                    failed_batches += 1;
                    warn!(
                        backend = %self.backend,
                        jobs = n,
                        error = %format!("{err:#}"),
                        "batch rejected, nothing stored"
                    );
                }
            }

            if produced >= next_progress {
                let elapsed = start.elapsed().as_secs_f64();
                info!(
                    produced,
                    total,
                    rate = produced as f64 / elapsed.max(f64::EPSILON),
                    "production progress"
                );
                next_progress += progress_every;
            }

            next_batch_at += interval;
            if produced < total && next_batch_at > Instant::now() {
                tokio::select! {
                    _ = tokio::time::sleep_until(next_batch_at) => {}
                    _ = shutdown.cancelled() => {
                        interrupted = true;
                        break;
                    }
                }
            }
        }

        if let Err(err) = sink.close().await {
            warn!(backend = %self.backend, error = %err, "failed to close producer sink");
        }

        let elapsed = start.elapsed();
        let secs = elapsed.as_secs_f64();
        let report = ProducerReport {
            jobs_produced: produced,
            failed_batches,
            elapsed,
            achieved_rate: if secs > 0.0 { produced as f64 / secs } else { 0.0 },
            interrupted,
        };

        info!(
            backend = %self.backend,
            jobs_produced = report.jobs_produced,
            elapsed_secs = secs,
            achieved_rate = report.achieved_rate,
            interrupted,
            "producer finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::job::Job;

    #[derive(Default)]
    struct CountingSink {
        stored: Vec<usize>,
        reject_first: usize,
        closed: bool,
    }

    #[async_trait]
    impl JobSink for CountingSink {
        async fn submit(&mut self, jobs: &[Job]) -> anyhow::Result<()> {
            if self.reject_first > 0 {
                self.reject_first -= 1;
                anyhow::bail!("serialization failure");
            }
            self.stored.push(jobs.len());
            Ok(())
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    #[test]
    fn test_batch_size_targets_hundred_batches_per_second() {
        assert_eq!(RateLimitedProducer::batch_size(1000), 10);
        assert_eq!(RateLimitedProducer::batch_size(50), 1);
        assert_eq!(RateLimitedProducer::batch_size(250), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_batch_is_truncated() {
        let mut producer =
            RateLimitedProducer::new(JobFactory::new(16, Some(1)), BackendKind::SkipLocked);
        let mut sink = CountingSink::default();
        let report = producer
            .run(&mut sink, 250, Duration::from_millis(1010), &ShutdownToken::new())
            .await;

        // 252.5 rounds to 253: batches of 2 then a final batch of 1.
        assert_eq!(report.jobs_produced, 253);
        assert_eq!(sink.stored.last(), Some(&1));
        assert!(sink.closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_batches_credit_nothing_and_production_continues() {
        let mut producer =
            RateLimitedProducer::new(JobFactory::new(16, Some(2)), BackendKind::StreamGroup);
        let mut sink = CountingSink {
            reject_first: 3,
            ..Default::default()
        };
        let report = producer
            .run(&mut sink, 100, Duration::from_secs(1), &ShutdownToken::new())
            .await;

        assert_eq!(report.failed_batches, 3);
        assert_eq!(report.jobs_produced, 100);
        assert_eq!(sink.stored.iter().sum::<usize>(), 100);
    }
}
