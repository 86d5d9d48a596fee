//! qbench - throughput and latency benchmark for work-queue designs.
//!
//! A rate-limited producer pushes synthetic jobs into one queue variant while
//! a pool of workers drains it. Every acknowledged job's end-to-end latency is
//! recorded so the variants can be compared under identical load.
//!
//! # Core Concepts
//!
//! - **Backend**: [`QueueBackend`] is the fetch/acknowledge contract each
//!   worker holds privately. Four variants exist: three on a row store
//!   ([`RowQueue`]) and one on an append-only stream with a consumer group
//!   ([`StreamGroupQueue`]).
//!
//! - **Producer**: [`RateLimitedProducer`] submits batches at a fixed cadence
//!   through a [`JobSink`], independent of consumer speed.
//!
//! - **Workers**: [`WorkerPool`] runs one consume loop per backend and stops
//!   cooperatively through a [`ShutdownToken`].
//!
//! - **Reclaim**: [`PendingReclaimer`] lets stream consumers take over
//!   entries another consumer received but never acknowledged.
//!
//! - **Metrics**: [`MetricsAggregator`] keeps latency samples and renders
//!   [`MetricsSnapshot`]s for the periodic emitter.
//!
//! # Feature Flags
//!
//! - `postgres` - row-store client via sqlx
//! - `redis` - stream-store client via redis
//! - `metrics` - Prometheus metrics support

/// Latency aggregation and periodic snapshot emission.
pub mod aggregator;

/// Queue backend contracts and the four queue variants.
///
/// Includes:
/// - [`QueueBackend`] - per-worker fetch/acknowledge contract
/// - [`RowStore`] and [`StreamStore`] - storage seams under the variants
/// - [`JobSink`] - producer-side batch submission
/// - [`BackendKind`] - variant selector
pub mod backend;

/// Benchmark configuration.
pub mod config;

/// Fetched jobs and their acknowledgement receipts.
pub mod delivery;

/// Typed errors callers branch on.
pub mod error;

/// Benchmark jobs and the synthetic job generator.
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics for produced/acknowledged jobs and latencies.
pub mod metrics;

/// Live store clients and backend wiring.
pub mod persistence;

/// Open-loop batch producer.
pub mod producer;

/// Worker pool, worker loop and shutdown signalling.
pub mod runtime;

pub(crate) mod telemetry;

pub use aggregator::{emit_periodically, open_metrics_file, MetricsAggregator, MetricsSnapshot};
pub use backend::*;
pub use config::*;
pub use delivery::*;
pub use error::*;
pub use job::*;
pub use persistence::{connect_backend, connect_backends, connect_sink};
pub use producer::{ProducerReport, RateLimitedProducer};
pub use runtime::*;
