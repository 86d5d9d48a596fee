use std::time::Duration;

use async_trait::async_trait;

use crate::job::Job;

/// Result of processing one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Job finished; acknowledge it.
    Done,
    /// Job failed; it is not acknowledged and becomes visible again.
    Failed(String),
}

/// Work performed on each delivered job.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Process a job. Runs to completion even when shutdown is requested.
    async fn process(&self, job: &Job) -> ProcessOutcome;
}

/// Stands in for real work with a fixed delay.
#[derive(Clone, Debug)]
pub struct SimulatedProcessor {
    delay: Duration,
}

impl SimulatedProcessor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[async_trait]
impl JobProcessor for SimulatedProcessor {
    async fn process(&self, _job: &Job) -> ProcessOutcome {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        ProcessOutcome::Done
    }
}
