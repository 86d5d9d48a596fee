//! Queue backends and the protocol surfaces they drive.
//!
//! [`QueueBackend`] is the capability every worker consumes. The three
//! row-store variants share [`RowQueue`] over a [`RowStore`] client, the
//! stream variant is [`StreamGroupQueue`] over a [`StreamStore`] client.
//! Each worker owns its backend value, and with it a private connection.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::delivery::Delivery;
use crate::error::ParseBackendKindError;
use crate::job::Job;

/// Pending-entry sweep for the stream consumer group.
pub mod reclaim;
/// Row-store queue variants.
pub mod row;
/// Stream consumer-group queue variant.
pub mod stream;

pub use reclaim::PendingReclaimer;
pub use row::{assign_partitions, RowQueue};
pub use stream::{EntryFields, PendingEntry, StreamEntry, StreamGroupQueue};

/// The closed set of queue designs under test.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Row locked with `FOR UPDATE SKIP LOCKED` until completed.
    #[serde(rename = "skip_locked")]
    SkipLocked,
    /// Row removed and returned in one statement.
    #[serde(rename = "delete_returning")]
    DeleteReturning,
    /// Rows sharded by partition key, polled per owned partition.
    #[serde(rename = "partitioned")]
    Partitioned,
    /// Append-only stream consumed through a consumer group.
    #[serde(rename = "stream")]
    StreamGroup,
}

/// Names of the stored functions backing one row-store variant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RowProcedures {
    pub table: &'static str,
    pub get_next: &'static str,
    pub complete: &'static str,
    pub fail: &'static str,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::SkipLocked,
        BackendKind::DeleteReturning,
        BackendKind::Partitioned,
        BackendKind::StreamGroup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::SkipLocked => "skip_locked",
            BackendKind::DeleteReturning => "delete_returning",
            BackendKind::Partitioned => "partitioned",
            BackendKind::StreamGroup => "stream",
        }
    }

    pub fn is_row_store(&self) -> bool {
        !matches!(self, BackendKind::StreamGroup)
    }

    /// Stored functions for row-store variants; `None` for the stream.
    pub fn procedures(&self) -> Option<RowProcedures> {
        match self {
            BackendKind::SkipLocked => Some(RowProcedures {
                table: "queue_jobs",
                get_next: "get_next_job",
                complete: "complete_job",
                fail: "fail_job",
            }),
            BackendKind::DeleteReturning => Some(RowProcedures {
                table: "queue_jobs_dr",
                get_next: "get_next_job_dr",
                complete: "complete_job_dr",
                fail: "requeue_job_dr",
            }),
            BackendKind::Partitioned => Some(RowProcedures {
                table: "queue_jobs_part",
                get_next: "get_next_job_part",
                complete: "complete_job_part",
                fail: "fail_job_part",
            }),
            BackendKind::StreamGroup => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ParseBackendKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip_locked" => Ok(BackendKind::SkipLocked),
            "delete_returning" => Ok(BackendKind::DeleteReturning),
            "partitioned" => Ok(BackendKind::Partitioned),
            "stream" | "stream_group" | "valkey" | "redis" => Ok(BackendKind::StreamGroup),
            other => Err(ParseBackendKindError(other.to_string())),
        }
    }
}

/// Fetch/acknowledge capability shared by every queue variant.
///
/// Delivery is at-least-once: a job fetched but never acknowledged becomes
/// visible again (lease expiry, requeue, or pending-entry reclamation).
#[async_trait]
pub trait QueueBackend: Send {
    /// Which queue design this is.
    fn kind(&self) -> BackendKind;

    /// Consumer identity used for fetches and claims.
    fn worker_id(&self) -> &str;

    /// Fixed backoff after an empty or failed fetch.
    fn poll_interval(&self) -> Duration;

    /// Whether an empty [`fetch`](Self::fetch) has already waited for
    /// `poll_interval` inside the store, making a further sleep redundant.
    fn fetch_blocks(&self) -> bool {
        false
    }

    /// Take the next job(s) for this worker. An empty vec means nothing was
    /// available; it is not an error.
    async fn fetch(&mut self) -> anyhow::Result<Vec<Delivery>>;

    /// Acknowledge every delivery in one backend interaction where the
    /// backend supports it.
    ///
    /// Returns how many deliveries this call actually acknowledged, which is
    /// fewer than `deliveries.len()` when another consumer got there first.
    /// An error that interrupts the batch carries a
    /// [`PartialAck`](crate::error::PartialAck) when leading deliveries were
    /// already acknowledged.
    async fn acknowledge(&mut self, deliveries: &[Delivery]) -> anyhow::Result<usize>;

    /// Reject a delivery so it becomes visible again.
    async fn fail_or_requeue(&mut self, delivery: Delivery) -> anyhow::Result<()>;

    /// Release the backend connection.
    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<B: QueueBackend + ?Sized> QueueBackend for Box<B> {
    fn kind(&self) -> BackendKind {
        (**self).kind()
    }

    fn worker_id(&self) -> &str {
        (**self).worker_id()
    }

    fn poll_interval(&self) -> Duration {
        (**self).poll_interval()
    }

    fn fetch_blocks(&self) -> bool {
        (**self).fetch_blocks()
    }

    async fn fetch(&mut self) -> anyhow::Result<Vec<Delivery>> {
        (**self).fetch().await
    }

    async fn acknowledge(&mut self, deliveries: &[Delivery]) -> anyhow::Result<usize> {
        (**self).acknowledge(deliveries).await
    }

    async fn fail_or_requeue(&mut self, delivery: Delivery) -> anyhow::Result<()> {
        (**self).fail_or_requeue(delivery).await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        (**self).close().await
    }
}

/// Row-store protocol surface: the stored functions of one queue variant.
///
/// Implementations are bound to a single variant; `partition` is only
/// meaningful for [`BackendKind::Partitioned`].
#[async_trait]
pub trait RowStore: Send {
    /// Lock (or remove) and return the next job, if any.
    async fn get_next(
        &mut self,
        worker_id: &str,
        partition: Option<i32>,
    ) -> anyhow::Result<Option<Job>>;

    /// Mark a delivered job complete.
    async fn complete(&mut self, delivery: &Delivery) -> anyhow::Result<()>;

    /// Release a delivered job back to the queue.
    async fn fail(&mut self, delivery: &Delivery) -> anyhow::Result<()>;

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Stream-store protocol surface: consumer-group reads, acknowledgement and
/// pending-entry inspection for one stream and group.
#[async_trait]
pub trait StreamStore: Send {
    /// Create the consumer group (and the stream) if missing. Succeeds when
    /// the group already exists.
    async fn create_group(&mut self) -> anyhow::Result<()>;

    /// Read up to `count` entries never delivered to this group, waiting up
    /// to `block` when none are available. Fails with
    /// [`StreamError::MissingGroup`](crate::error::StreamError) when the
    /// group does not exist.
    async fn read_group(
        &mut self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> anyhow::Result<Vec<StreamEntry>>;

    /// Acknowledge entries in one call; returns how many were pending.
    async fn ack(&mut self, ids: &[String]) -> anyhow::Result<u64>;

    /// List up to `count` delivered-but-unacknowledged entries.
    async fn pending(&mut self, count: usize) -> anyhow::Result<Vec<PendingEntry>>;

    /// Transfer ownership of entries idle for at least `min_idle` to
    /// `consumer`, returning the entries actually claimed.
    async fn claim(
        &mut self,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> anyhow::Result<Vec<StreamEntry>>;

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Write side used by the producer.
#[async_trait]
pub trait JobSink: Send {
    /// Store a batch atomically: either every job is enqueued or none is.
    async fn submit(&mut self, jobs: &[Job]) -> anyhow::Result<()>;

    /// Release the connection.
    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<S: JobSink + ?Sized> JobSink for Box<S> {
    async fn submit(&mut self, jobs: &[Job]) -> anyhow::Result<()> {
        (**self).submit(jobs).await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        (**self).close().await
    }
}
