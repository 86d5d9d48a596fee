use std::time::Duration;

use tracing::{debug, Instrument};

use crate::backend::{StreamEntry, StreamStore};
use crate::config::StreamQueueConfig;
use crate::telemetry;

/// Periodic sweep that moves stale pending entries to the calling consumer.
///
/// Entries delivered to a consumer that crashed (or stalled) stay pending in
/// the group forever unless another consumer claims them. Every `every`
/// fetch iterations the owning worker inspects up to `scan_count` pending
/// entries and claims those idle strictly longer than `idle_threshold`.
#[derive(Clone, Debug)]
pub struct PendingReclaimer {
    every: u32,
    idle_threshold: Duration,
    scan_count: usize,
    iterations: u32,
}

impl PendingReclaimer {
    pub fn new(every: u32, idle_threshold: Duration, scan_count: usize) -> Self {
        Self {
            every: every.max(1),
            idle_threshold,
            scan_count: scan_count.max(1),
            iterations: 0,
        }
    }

    pub fn from_config(config: &StreamQueueConfig) -> Self {
        Self::new(
            config.reclaim_every,
            Duration::from_millis(config.reclaim_idle_ms),
            config.reclaim_scan_count,
        )
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    /// Count one fetch iteration; returns `true` when a sweep is due.
    pub fn tick(&mut self) -> bool {
        self.iterations += 1;
        if self.iterations >= self.every {
            self.iterations = 0;
            true
        } else {
            false
        }
    }

    /// Claim stale pending entries for `consumer`.
    ///
    /// The store re-checks idleness atomically during the claim, so when two
    /// consumers race for the same entry only one of them receives it.
    pub async fn sweep<S>(&self, store: &mut S, consumer: &str) -> anyhow::Result<Vec<StreamEntry>>
    where
        S: StreamStore + ?Sized,
    {
        let span = telemetry::reclaim_span(consumer);
        self.claim_stale(store, consumer).instrument(span).await
    }

    async fn claim_stale<S>(&self, store: &mut S, consumer: &str) -> anyhow::Result<Vec<StreamEntry>>
    where
        S: StreamStore + ?Sized,
    {
        let pending = store.pending(self.scan_count).await?;
        let stale: Vec<String> = pending
            .into_iter()
            .filter(|entry| entry.idle > self.idle_threshold)
            .map(|entry| entry.id)
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let claimed = store.claim(consumer, self.idle_threshold, &stale).await?;
        debug!(
            candidates = stale.len(),
            claimed = claimed.len(),
            "claimed stale pending entries"
        );
        if !claimed.is_empty() {
            telemetry::record_reclaimed(consumer, claimed.len());
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_fires_every_nth_iteration() {
        let mut reclaimer = PendingReclaimer::new(3, Duration::from_secs(5), 10);
        let fired: Vec<bool> = (0..7).map(|_| reclaimer.tick()).collect();
        assert_eq!(fired, vec![false, false, true, false, false, true, false]);
    }

    #[test]
    fn test_zero_cadence_sweeps_every_iteration() {
        let mut reclaimer = PendingReclaimer::new(0, Duration::ZERO, 0);
        assert!(reclaimer.tick());
        assert!(reclaimer.tick());
    }

    #[test]
    fn test_from_config_defaults() {
        let reclaimer = PendingReclaimer::from_config(&StreamQueueConfig::default());
        assert_eq!(reclaimer.idle_threshold(), Duration::from_millis(5000));
        assert_eq!(reclaimer.scan_count, 10);
        assert_eq!(reclaimer.every, 10);
    }
}
