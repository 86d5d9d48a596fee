use std::time::Duration;

use qbench::{
    BackendKind, BenchConfig, Job, JobFactory, RowQueue, RowQueueConfig, StreamGroupQueue,
    StreamQueueConfig,
};

use crate::row::InMemoryRowStore;
use crate::stream::InMemoryStreamStore;

/// Row settings with a 1ms poll so tests drain quickly.
pub fn fast_row_config() -> RowQueueConfig {
    RowQueueConfig {
        poll_interval_ms: 1,
        ..RowQueueConfig::default()
    }
}

/// Stream settings with short blocking reads and a sweep on every fetch.
pub fn fast_stream_config() -> StreamQueueConfig {
    StreamQueueConfig {
        block_ms: 5,
        reclaim_every: 1,
        reclaim_idle_ms: 200,
        ..StreamQueueConfig::default()
    }
}

/// `n` jobs from a seeded generator.
pub fn sample_jobs(n: usize) -> Vec<Job> {
    JobFactory::new(32, Some(7)).batch(n)
}

/// `n` jobs spread over `partitions` partitions.
pub fn partitioned_jobs(n: usize, partitions: u32) -> Vec<Job> {
    JobFactory::new(32, Some(7))
        .with_partitions(partitions)
        .batch(n)
}

/// One row queue per worker, all over clones of `store`.
pub fn row_queues(
    store: &InMemoryRowStore,
    workers: usize,
    partitions: u32,
    config: &RowQueueConfig,
) -> anyhow::Result<Vec<RowQueue<InMemoryRowStore>>> {
    (0..workers)
        .map(|index| {
            RowQueue::for_kind(
                store.kind(),
                store.clone(),
                index,
                workers,
                partitions,
                config,
            )
        })
        .collect()
}

/// One consumer per worker in the same group, all over clones of `store`.
pub fn stream_queues(
    store: &InMemoryStreamStore,
    workers: usize,
    config: &StreamQueueConfig,
) -> Vec<StreamGroupQueue<InMemoryStreamStore>> {
    (0..workers)
        .map(|index| {
            StreamGroupQueue::new(store.clone(), BenchConfig::worker_id(index), config)
        })
        .collect()
}

/// Small benchmark run over `kind`.
pub fn bench_config(kind: BackendKind) -> BenchConfig {
    BenchConfig::new(kind)
        .with_workers(4)
        .with_rate(1000)
        .with_duration_secs(1)
        .with_processing_time_ms(1)
        .with_partitions(8)
        .with_seed(7)
}

/// Poll `condition` every millisecond until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
