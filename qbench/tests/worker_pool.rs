//! Worker pool integration tests over the in-memory stores.
//!
//! Covers exactly-once acknowledgement per queue variant, agreement between
//! the aggregator and per-worker counts, failed-job redelivery and recovery
//! from backend errors.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use qbench::{
    BackendKind, JobSink, MetricsAggregator, QueueBackend, RowQueueConfig, ShutdownToken,
    SimulatedProcessor, WorkerPool,
};
use qbench_testkit::{
    fast_row_config, fast_stream_config, partitioned_jobs, row_queues, sample_jobs,
    stream_queues, wait_until, InMemoryRowStore, InMemoryStreamStore, RecordingProcessor,
};

const JOBS: usize = 200;
const WORKERS: usize = 4;
const PARTITIONS: u32 = 8;

async fn drain_row_variant(kind: BackendKind) {
    let mut store = InMemoryRowStore::new(kind);
    let jobs = if kind == BackendKind::Partitioned {
        partitioned_jobs(JOBS, PARTITIONS)
    } else {
        sample_jobs(JOBS)
    };
    store.submit(&jobs).await.unwrap();

    let backends = row_queues(&store, WORKERS, PARTITIONS, &fast_row_config()).unwrap();
    let aggregator = Arc::new(MetricsAggregator::new());
    let pool = WorkerPool::spawn(
        backends,
        Arc::new(SimulatedProcessor::new(Duration::from_millis(1))),
        Arc::clone(&aggregator),
        ShutdownToken::new(),
    );

    let drained = wait_until(Duration::from_secs(30), || {
        store.acknowledged() == JOBS as u64
    })
    .await;
    let report = pool.shutdown().await;

    assert!(drained, "{kind}: only {} of {JOBS} acknowledged", store.acknowledged());
    assert!(store.duplicate_acks().is_empty(), "{kind}: duplicate acknowledgements");
    assert!(store.is_empty());
    assert_eq!(store.in_flight(), 0);
    assert_eq!(report.total_processed(), JOBS as u64);
    assert_eq!(aggregator.count(), report.total_processed());
}

#[tokio::test(start_paused = true)]
async fn test_skip_locked_acknowledges_each_job_once() {
    drain_row_variant(BackendKind::SkipLocked).await;
}

#[tokio::test(start_paused = true)]
async fn test_delete_returning_acknowledges_each_job_once() {
    drain_row_variant(BackendKind::DeleteReturning).await;
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_acknowledges_each_job_once() {
    drain_row_variant(BackendKind::Partitioned).await;
}

#[tokio::test(start_paused = true)]
async fn test_stream_group_acknowledges_each_entry_once() {
    let mut store = InMemoryStreamStore::new("bench_queue", "bench_workers");
    let backends = stream_queues(&store, WORKERS, &fast_stream_config());
    let aggregator = Arc::new(MetricsAggregator::new());
    let pool = WorkerPool::spawn(
        backends,
        Arc::new(SimulatedProcessor::new(Duration::from_millis(1))),
        Arc::clone(&aggregator),
        ShutdownToken::new(),
    );

    // Workers create the group on first fetch; only then is it safe to
    // append.
    assert!(wait_until(Duration::from_secs(1), || store.has_group()).await);
    store.submit(&sample_jobs(JOBS)).await.unwrap();

    let drained = wait_until(Duration::from_secs(30), || {
        store.acknowledged() == JOBS as u64 && store.pending_len() == 0
    })
    .await;
    let report = pool.shutdown().await;

    assert!(drained, "only {} of {JOBS} acknowledged", store.acknowledged());
    assert!(store.ack_counts().values().all(|&n| n == 1));
    assert_eq!(report.total_processed(), JOBS as u64);
    assert_eq!(aggregator.count(), report.total_processed());
    let per_worker: u64 = report.workers.iter().map(|w| w.processed).sum();
    assert_eq!(per_worker, aggregator.count());
}

#[tokio::test(start_paused = true)]
async fn test_failed_row_job_is_redelivered_until_it_succeeds() {
    let mut store = InMemoryRowStore::new(BackendKind::SkipLocked);
    let jobs = sample_jobs(20);
    let flaky = jobs[3].id;
    store.submit(&jobs).await.unwrap();

    let processor = Arc::new(RecordingProcessor::with_delay(Duration::from_millis(1)));
    processor.fail_job(flaky);

    let backends = row_queues(&store, 2, 1, &fast_row_config()).unwrap();
    let aggregator = Arc::new(MetricsAggregator::new());
    let pool = WorkerPool::spawn(
        backends,
        Arc::clone(&processor),
        Arc::clone(&aggregator),
        ShutdownToken::new(),
    );

    assert!(
        wait_until(Duration::from_secs(5), || {
            store.acknowledged() == 19
                && processor.seen().iter().filter(|id| **id == flaky).count() >= 2
        })
        .await
    );

    processor.heal_job(flaky);
    assert!(wait_until(Duration::from_secs(5), || store.acknowledged() == 20).await);
    let report = pool.shutdown().await;

    assert_eq!(store.ack_counts()[&flaky], 1);
    assert!(report.total_failed() >= 2);
    assert_eq!(report.total_processed(), 20);
    assert_eq!(aggregator.count(), 20);
}

#[tokio::test(start_paused = true)]
async fn test_partial_stream_batch_failure_leaves_only_the_failed_entry_pending() {
    let mut store = InMemoryStreamStore::new("bench_queue", "bench_workers");
    let config = fast_stream_config();
    let mut queue = stream_queues(&store, 1, &config).pop().unwrap();

    // Create the group through the queue, then append a batch of five.
    assert!(queue.fetch().await.unwrap().is_empty());
    let jobs = sample_jobs(5);
    let bad = jobs[2].id;
    store.submit(&jobs).await.unwrap();

    let processor = Arc::new(RecordingProcessor::new());
    processor.fail_job(bad);

    let aggregator = Arc::new(MetricsAggregator::new());
    let pool = WorkerPool::spawn(
        vec![queue],
        Arc::clone(&processor),
        Arc::clone(&aggregator),
        ShutdownToken::new(),
    );

    assert!(wait_until(Duration::from_millis(100), || store.acknowledged() == 4).await);
    assert_eq!(store.pending_len(), 1);
    assert_eq!(aggregator.count(), 4);

    // Once idle past the threshold the entry is reclaimed and retried.
    processor.heal_job(bad);
    let reclaim_after = Duration::from_millis(config.reclaim_idle_ms) * 2;
    assert!(wait_until(reclaim_after, || store.pending_len() == 0).await);
    let report = pool.shutdown().await;

    assert_eq!(store.acknowledged(), 5);
    assert_eq!(report.total_processed(), 5);
    assert_eq!(report.total_failed(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_completions_before_a_failed_batch_ack_are_counted() {
    let mut store =
        InMemoryRowStore::new(BackendKind::SkipLocked).with_lease(Duration::from_millis(500));
    store.submit(&sample_jobs(8)).await.unwrap();
    // First batch of four: one completion lands, the second call fails and
    // the last two stay locked until the lease lapses.
    store.fail_complete_after(1);

    let config = RowQueueConfig {
        batch_size: 4,
        ..fast_row_config()
    };
    let aggregator = Arc::new(MetricsAggregator::new());
    let pool = WorkerPool::spawn(
        row_queues(&store, 1, 1, &config).unwrap(),
        Arc::new(SimulatedProcessor::new(Duration::from_millis(1))),
        Arc::clone(&aggregator),
        ShutdownToken::new(),
    );

    assert!(wait_until(Duration::from_secs(5), || store.acknowledged() == 8).await);
    let report = pool.shutdown().await;

    assert!(store.duplicate_acks().is_empty());
    assert_eq!(store.in_flight(), 0);
    assert_eq!(aggregator.count(), store.acknowledged());
    assert_eq!(report.total_processed(), 8);
    assert_eq!(report.total_backend_errors(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backend_errors_back_off_and_recover() {
    let mut store = InMemoryRowStore::new(BackendKind::DeleteReturning);
    store.submit(&sample_jobs(50)).await.unwrap();
    store.fail_next_fetches(3);

    let backends = row_queues(&store, 1, 1, &fast_row_config()).unwrap();
    let pool = WorkerPool::spawn(
        backends,
        Arc::new(SimulatedProcessor::new(Duration::ZERO)),
        Arc::new(MetricsAggregator::new()),
        ShutdownToken::new(),
    );

    assert!(wait_until(Duration::from_secs(5), || store.acknowledged() == 50).await);
    let report = pool.shutdown().await;

    assert_eq!(report.total_backend_errors(), 3);
    assert_eq!(report.total_processed(), 50);
}

#[tokio::test(start_paused = true)]
async fn test_idle_workers_stop_promptly_on_shutdown() {
    let store = InMemoryStreamStore::new("bench_queue", "bench_workers");
    let pool = WorkerPool::spawn(
        stream_queues(&store, WORKERS, &fast_stream_config()),
        Arc::new(SimulatedProcessor::new(Duration::ZERO)),
        Arc::new(MetricsAggregator::new()),
        ShutdownToken::new(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = tokio::time::Instant::now();
    let report = pool.shutdown().await;

    assert!(started.elapsed() < Duration::from_secs(1));
    let ids: HashSet<_> = report.workers.iter().map(|w| w.worker_id.clone()).collect();
    assert_eq!(ids.len(), WORKERS);
    assert_eq!(report.total_processed(), 0);
}
