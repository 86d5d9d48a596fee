//! Live store clients and the startup wiring that selects one per worker.
//!
//! Every `connect_*` function opens a fresh private connection. Failures
//! here are fatal-startup errors: callers abort before spawning workers.

use anyhow::Context;

use crate::backend::{JobSink, QueueBackend};
use crate::config::BenchConfig;

/// PostgreSQL row-store client (feature `postgres`).
#[cfg(feature = "postgres")]
pub mod postgres;

/// Redis/Valkey stream-store client (feature `redis`).
#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "postgres")]
pub use postgres::PgRowStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStreamStore;

/// Connect the backend for worker `worker_index`.
pub async fn connect_backend(
    config: &BenchConfig,
    worker_index: usize,
) -> anyhow::Result<Box<dyn QueueBackend>> {
    let backend = if config.backend.is_row_store() {
        connect_row_backend(config, worker_index).await
    } else {
        connect_stream_backend(config, worker_index).await
    };
    backend.with_context(|| {
        format!(
            "failed to start {} backend for {}",
            config.backend,
            BenchConfig::worker_id(worker_index)
        )
    })
}

/// Connect one backend per configured worker, in worker order.
pub async fn connect_backends(config: &BenchConfig) -> anyhow::Result<Vec<Box<dyn QueueBackend>>> {
    let mut backends = Vec::with_capacity(config.workers);
    for index in 0..config.workers {
        backends.push(connect_backend(config, index).await?);
    }
    Ok(backends)
}

/// Connect the producer's sink. For the stream store the consumer group is
/// created up front so no entry is appended before the group exists.
pub async fn connect_sink(config: &BenchConfig) -> anyhow::Result<Box<dyn JobSink>> {
    let sink = if config.backend.is_row_store() {
        connect_row_sink(config).await
    } else {
        connect_stream_sink(config).await
    };
    sink.with_context(|| format!("failed to start {} producer", config.backend))
}

#[cfg(feature = "postgres")]
async fn connect_row_backend(
    config: &BenchConfig,
    worker_index: usize,
) -> anyhow::Result<Box<dyn QueueBackend>> {
    let store = PgRowStore::connect(&config.postgres, config.backend).await?;
    let queue = crate::backend::RowQueue::for_kind(
        config.backend,
        store,
        worker_index,
        config.workers,
        config.partitions,
        &config.row,
    )?;
    Ok(Box::new(queue))
}

#[cfg(not(feature = "postgres"))]
async fn connect_row_backend(
    config: &BenchConfig,
    _worker_index: usize,
) -> anyhow::Result<Box<dyn QueueBackend>> {
    anyhow::bail!("{} requires the `postgres` feature", config.backend)
}

#[cfg(feature = "postgres")]
async fn connect_row_sink(config: &BenchConfig) -> anyhow::Result<Box<dyn JobSink>> {
    let store = PgRowStore::connect(&config.postgres, config.backend).await?;
    Ok(Box::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn connect_row_sink(config: &BenchConfig) -> anyhow::Result<Box<dyn JobSink>> {
    anyhow::bail!("{} requires the `postgres` feature", config.backend)
}

#[cfg(feature = "redis")]
async fn connect_stream_backend(
    config: &BenchConfig,
    worker_index: usize,
) -> anyhow::Result<Box<dyn QueueBackend>> {
    let store = RedisStreamStore::connect(&config.stream_store, &config.stream).await?;
    let queue = crate::backend::StreamGroupQueue::new(
        store,
        BenchConfig::worker_id(worker_index),
        &config.stream,
    );
    Ok(Box::new(queue))
}

#[cfg(not(feature = "redis"))]
async fn connect_stream_backend(
    config: &BenchConfig,
    _worker_index: usize,
) -> anyhow::Result<Box<dyn QueueBackend>> {
    anyhow::bail!("{} requires the `redis` feature", config.backend)
}

#[cfg(feature = "redis")]
async fn connect_stream_sink(config: &BenchConfig) -> anyhow::Result<Box<dyn JobSink>> {
    use crate::backend::StreamStore;

    let mut store = RedisStreamStore::connect(&config.stream_store, &config.stream).await?;
    store.create_group().await?;
    Ok(Box::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_stream_sink(config: &BenchConfig) -> anyhow::Result<Box<dyn JobSink>> {
    anyhow::bail!("{} requires the `redis` feature", config.backend)
}
