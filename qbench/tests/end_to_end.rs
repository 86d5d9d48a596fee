//! Full benchmark runs over the in-memory stores: producer, worker pool and
//! metrics emitter wired together the way the runner wires the live ones.

use std::sync::Arc;
use std::time::Duration;

use qbench::{
    emit_periodically, BackendKind, MetricsAggregator, MetricsSnapshot, RateLimitedProducer,
    ShutdownToken, SimulatedProcessor, StreamStore, WorkerPool,
};
use qbench_testkit::{
    bench_config, fast_row_config, fast_stream_config, row_queues, stream_queues, wait_until,
    InMemoryRowStore, InMemoryStreamStore,
};
use tokio::io::AsyncReadExt;

async fn read_snapshots(mut reader: tokio::io::DuplexStream) -> Vec<MetricsSnapshot> {
    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    out.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_stream_run_accounts_for_every_produced_job() {
    let config = bench_config(BackendKind::StreamGroup).with_rate(200).with_duration_secs(2);
    let mut sink = InMemoryStreamStore::new(&config.stream.stream, &config.stream.group);
    sink.create_group().await.unwrap();

    let aggregator = Arc::new(MetricsAggregator::new());
    let shutdown = ShutdownToken::new();
    let pool = WorkerPool::spawn(
        stream_queues(&sink, config.workers, &fast_stream_config()),
        Arc::new(SimulatedProcessor::new(config.processing_time())),
        Arc::clone(&aggregator),
        shutdown.clone(),
    );

    let (writer, reader) = tokio::io::duplex(1 << 20);
    let emitter = tokio::spawn(emit_periodically(
        Arc::clone(&aggregator),
        writer,
        config.metrics_interval(),
        shutdown.clone(),
    ));

    let mut producer = RateLimitedProducer::from_config(&config);
    let produced = producer
        .run(&mut sink, config.rate, config.production_duration(), &shutdown)
        .await;
    assert_eq!(produced.jobs_produced, config.total_jobs());

    let drained = wait_until(Duration::from_secs(10), || {
        aggregator.count() == produced.jobs_produced
    })
    .await;
    let report = pool.shutdown().await;
    let lines = emitter.await.unwrap();

    assert!(drained);
    assert_eq!(report.total_processed(), produced.jobs_produced);
    assert_eq!(sink.pending_len(), 0);

    let snapshots = read_snapshots(reader).await;
    assert_eq!(snapshots.len() as u64, lines);
    let last = snapshots.last().unwrap();
    assert_eq!(last.jobs_processed, produced.jobs_produced);
    assert!(snapshots
        .windows(2)
        .all(|w| w[0].jobs_processed <= w[1].jobs_processed));
}

#[tokio::test(start_paused = true)]
async fn test_row_run_under_lease_never_loses_jobs() {
    let config = bench_config(BackendKind::SkipLocked).with_rate(300).with_duration_secs(1);
    let mut sink = InMemoryRowStore::new(config.backend).with_lease(Duration::from_secs(30));

    let aggregator = Arc::new(MetricsAggregator::new());
    let shutdown = ShutdownToken::new();
    let pool = WorkerPool::spawn(
        row_queues(&sink, config.workers, config.partitions, &fast_row_config()).unwrap(),
        Arc::new(SimulatedProcessor::new(config.processing_time())),
        Arc::clone(&aggregator),
        shutdown.clone(),
    );

    let mut producer = RateLimitedProducer::from_config(&config);
    let produced = producer
        .run(&mut sink, config.rate, config.production_duration(), &shutdown)
        .await;

    assert!(wait_until(Duration::from_secs(10), || sink.is_empty()).await);
    let report = pool.shutdown().await;

    assert_eq!(sink.acknowledged(), produced.jobs_produced);
    assert!(sink.duplicate_acks().is_empty());
    assert_eq!(aggregator.count(), report.total_processed());
}

#[test]
fn test_aggregator_counts_every_concurrent_record() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 5_000;

    let aggregator = Arc::new(MetricsAggregator::new());
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let aggregator = Arc::clone(&aggregator);
            std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    aggregator.record((t * PER_THREAD + i) as f64);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = aggregator.snapshot().unwrap();
    assert_eq!(snapshot.jobs_processed, (THREADS * PER_THREAD) as u64);
    assert_eq!(snapshot.min, 0.0);
    assert_eq!(snapshot.max, (THREADS * PER_THREAD - 1) as f64);
}
