use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::backend::{BackendKind, QueueBackend, RowStore};
use crate::config::RowQueueConfig;
use crate::delivery::{Delivery, Receipt};
use crate::error::PartialAck;

/// Partitions owned by worker `worker_index` in a pool of `workers`.
///
/// Worker `w` takes `(w + k·W) mod P` for `k in 0..⌈P/W⌉`, so every worker
/// owns `⌈P/W⌉` distinct partitions and, when `W <= P`, partition `p` is
/// always owned by worker `p mod W`.
pub fn assign_partitions(worker_index: usize, workers: usize, partitions: u32) -> Vec<i32> {
    let partitions = partitions.max(1) as usize;
    let workers = workers.max(1);
    let per_worker = partitions.div_ceil(workers);
    (0..per_worker)
        .map(|k| ((worker_index + k * workers) % partitions) as i32)
        .collect()
}

/// Row-store queue: SkipLocked, DeleteReturning or Partitioned over a
/// private [`RowStore`] client.
#[derive(Debug)]
pub struct RowQueue<S: RowStore> {
    kind: BackendKind,
    store: S,
    worker_id: String,
    partitions: Vec<i32>,
    cursor: usize,
    batch_size: usize,
    poll_interval: Duration,
}

impl<S: RowStore> RowQueue<S> {
    fn with_kind(
        kind: BackendKind,
        store: S,
        worker_id: impl Into<String>,
        partitions: Vec<i32>,
        config: &RowQueueConfig,
    ) -> Self {
        Self {
            kind,
            store,
            worker_id: worker_id.into(),
            partitions,
            cursor: 0,
            batch_size: config.batch_size.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Fetch locks one row; other fetchers skip it until it is completed or
    /// its lease lapses.
    pub fn skip_locked(store: S, worker_id: impl Into<String>, config: &RowQueueConfig) -> Self {
        Self::with_kind(BackendKind::SkipLocked, store, worker_id, Vec::new(), config)
    }

    /// Fetch removes the row and returns it whole; acknowledge archives it.
    pub fn delete_returning(
        store: S,
        worker_id: impl Into<String>,
        config: &RowQueueConfig,
    ) -> Self {
        Self::with_kind(BackendKind::DeleteReturning, store, worker_id, Vec::new(), config)
    }

    /// Fetch polls each owned partition in turn and takes the first hit.
    pub fn partitioned(
        store: S,
        worker_id: impl Into<String>,
        partitions: Vec<i32>,
        config: &RowQueueConfig,
    ) -> Self {
        Self::with_kind(BackendKind::Partitioned, store, worker_id, partitions, config)
    }

    /// Build the row variant selected by `kind`.
    pub fn for_kind(
        kind: BackendKind,
        store: S,
        worker_index: usize,
        workers: usize,
        partitions: u32,
        config: &RowQueueConfig,
    ) -> anyhow::Result<Self> {
        let worker_id = crate::config::BenchConfig::worker_id(worker_index);
        match kind {
            BackendKind::SkipLocked => Ok(Self::skip_locked(store, worker_id, config)),
            BackendKind::DeleteReturning => Ok(Self::delete_returning(store, worker_id, config)),
            BackendKind::Partitioned => Ok(Self::partitioned(
                store,
                worker_id,
                assign_partitions(worker_index, workers, partitions),
                config,
            )),
            BackendKind::StreamGroup => {
                anyhow::bail!("stream backend cannot be served by a row store")
            }
        }
    }

    pub fn partitions(&self) -> &[i32] {
        &self.partitions
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn receipt(&self, partition: Option<i32>) -> Receipt {
        match (self.kind, partition) {
            (BackendKind::DeleteReturning, _) => Receipt::Removed,
            (BackendKind::Partitioned, Some(p)) => Receipt::Partition(p),
            _ => Receipt::Locked,
        }
    }

    async fn fetch_one(&mut self) -> anyhow::Result<Option<Delivery>> {
        if self.kind != BackendKind::Partitioned {
            let job = self.store.get_next(&self.worker_id, None).await?;
            return Ok(job.map(|job| Delivery::new(job, self.receipt(None), &self.worker_id)));
        }

        // One poll cycle visits every owned partition once, starting after
        // the partition that produced the previous hit.
        let owned = self.partitions.len();
        let mut last_err = None;
        for step in 0..owned {
            let idx = (self.cursor + step) % owned;
            let partition = self.partitions[idx];
            match self.store.get_next(&self.worker_id, Some(partition)).await {
                Ok(Some(job)) => {
                    self.cursor = (idx + 1) % owned;
                    let receipt = self.receipt(Some(partition));
                    return Ok(Some(Delivery::new(job, receipt, &self.worker_id)));
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(worker_id = %self.worker_id, partition, error = %err, "partition fetch failed");
                    last_err = Some(err.context(format!("fetch from partition {partition}")));
                }
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<S: RowStore> QueueBackend for RowQueue<S> {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn fetch(&mut self) -> anyhow::Result<Vec<Delivery>> {
        let mut out = Vec::with_capacity(self.batch_size);
        while out.len() < self.batch_size {
            match self.fetch_one().await {
                Ok(Some(delivery)) => out.push(delivery),
                Ok(None) => break,
                // Rows already locked stay with this worker; surface the
                // error only when nothing was fetched.
                Err(err) if out.is_empty() => return Err(err),
                Err(_) => break,
            }
        }
        Ok(out)
    }

    async fn acknowledge(&mut self, deliveries: &[Delivery]) -> anyhow::Result<usize> {
        for (done, delivery) in deliveries.iter().enumerate() {
            // Earlier rows are already complete in the store.
            if let Err(err) = self.store.complete(delivery).await {
                return Err(err.context(PartialAck {
                    acknowledged: done,
                    requested: deliveries.len(),
                }));
            }
        }
        Ok(deliveries.len())
    }

    async fn fail_or_requeue(&mut self, delivery: Delivery) -> anyhow::Result<()> {
        self.store.fail(&delivery).await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.store.close().await
    }
}
