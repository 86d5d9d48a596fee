use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use qbench::{Job, JobId, JobProcessor, JobSink, ProcessOutcome};

/// Processor that records every job it sees and fails the ones it is told
/// to.
#[derive(Clone, Default)]
pub struct RecordingProcessor {
    seen: Arc<Mutex<Vec<JobId>>>,
    fail: Arc<Mutex<HashSet<JobId>>>,
    delay: Duration,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Fail `id` every time it is processed.
    pub fn fail_job(&self, id: JobId) {
        self.fail.lock().insert(id);
    }

    /// Stop failing `id`.
    pub fn heal_job(&self, id: JobId) {
        self.fail.lock().remove(&id);
    }

    pub fn seen(&self) -> Vec<JobId> {
        self.seen.lock().clone()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn assert_seen_count_eq(&self, expected: usize) {
        let actual = self.seen_count();
        assert_eq!(
            actual, expected,
            "Expected {} processed jobs, got {}",
            expected, actual
        );
    }
}

#[async_trait]
impl JobProcessor for RecordingProcessor {
    async fn process(&self, job: &Job) -> ProcessOutcome {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seen.lock().push(job.id);
        if self.fail.lock().contains(&job.id) {
            ProcessOutcome::Failed(format!("job {} marked to fail", job.id))
        } else {
            ProcessOutcome::Done
        }
    }
}

/// Sink wrapper that rejects the first `n` batches before passing the rest
/// through to `inner`.
pub struct FlakySink<S> {
    inner: S,
    reject: u32,
    rejected: u32,
}

impl<S: JobSink> FlakySink<S> {
    pub fn new(inner: S, reject: u32) -> Self {
        Self {
            inner,
            reject,
            rejected: 0,
        }
    }

    pub fn rejected(&self) -> u32 {
        self.rejected
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: JobSink> JobSink for FlakySink<S> {
    async fn submit(&mut self, jobs: &[Job]) -> anyhow::Result<()> {
        if self.rejected < self.reject {
            self.rejected += 1;
            anyhow::bail!("could not serialize access due to concurrent update");
        }
        self.inner.submit(jobs).await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.inner.close().await
    }
}
