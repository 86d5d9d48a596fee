use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{BackendKind, PendingReclaimer, QueueBackend, StreamStore};
use crate::config::StreamQueueConfig;
use crate::delivery::{Delivery, Receipt};
use crate::error::StreamError;
use crate::job::{Job, JobId};

pub const FIELD_JOB_ID: &str = "job_id";
pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_PRIORITY: &str = "priority";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_PARTITION_KEY: &str = "partition_key";

/// Field map of one stream entry, as stored.
///
/// Every field is optional on the way in: entries written by other tools
/// may lack any of them, and [`EntryFields::decode`] decides which absences
/// are tolerable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryFields {
    pub job_id: Option<String>,
    pub payload: Option<String>,
    pub priority: Option<String>,
    pub created_at: Option<String>,
    pub partition_key: Option<String>,
}

impl EntryFields {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: Some(job.id.to_string()),
            payload: Some(String::from_utf8_lossy(&job.payload).into_owned()),
            priority: Some(job.priority.to_string()),
            created_at: Some(job.enqueued_at.to_rfc3339()),
            partition_key: job.partition_key.map(|key| key.to_string()),
        }
    }

    /// Field/value pairs in append order.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        [
            (FIELD_JOB_ID, &self.job_id),
            (FIELD_PAYLOAD, &self.payload),
            (FIELD_PRIORITY, &self.priority),
            (FIELD_CREATED_AT, &self.created_at),
            (FIELD_PARTITION_KEY, &self.partition_key),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.clone().map(|value| (name, value)))
        .collect()
    }

    /// Collect known fields from raw pairs; unknown fields are ignored.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut fields = Self::default();
        for (name, value) in pairs {
            let slot = match name.as_ref() {
                FIELD_JOB_ID => &mut fields.job_id,
                FIELD_PAYLOAD => &mut fields.payload,
                FIELD_PRIORITY => &mut fields.priority,
                FIELD_CREATED_AT => &mut fields.created_at,
                FIELD_PARTITION_KEY => &mut fields.partition_key,
                _ => continue,
            };
            *slot = Some(value.into());
        }
        fields
    }

    /// Rebuild the job carried by entry `id`.
    ///
    /// A missing `created_at` falls back to `delivered_at`, so the latency
    /// sample degrades to roughly the processing time instead of being lost.
    /// A missing `job_id` gets a fresh one; a missing priority reads as 0.
    pub fn decode(&self, id: &str, delivered_at: DateTime<Utc>) -> Result<Job, StreamError> {
        let malformed = |reason: String| StreamError::MalformedEntry {
            id: id.to_string(),
            reason,
        };

        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| malformed("missing payload".into()))?;

        let job_id = match &self.job_id {
            Some(raw) => Uuid::parse_str(raw)
                .map(JobId::from)
                .map_err(|err| malformed(format!("job_id {raw:?}: {err}")))?,
            None => JobId::new(),
        };

        let priority = match &self.priority {
            Some(raw) => raw
                .parse::<u8>()
                .map_err(|err| malformed(format!("priority {raw:?}: {err}")))?,
            None => 0,
        };

        let enqueued_at = match &self.created_at {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|err| malformed(format!("created_at {raw:?}: {err}")))?,
            None => delivered_at,
        };

        let partition_key = match &self.partition_key {
            Some(raw) => Some(
                raw.parse::<i32>()
                    .map_err(|err| malformed(format!("partition_key {raw:?}: {err}")))?,
            ),
            None => None,
        };

        let mut job = Job::new(payload.clone().into_bytes(), priority, partition_key)
            .with_enqueued_at(enqueued_at);
        job.id = job_id;
        Ok(job)
    }
}

/// One entry read from (or claimed in) the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: EntryFields,
}

impl StreamEntry {
    pub fn new(id: impl Into<String>, fields: EntryFields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// Summary of a delivered-but-unacknowledged entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    /// Consumer currently owning the entry.
    pub consumer: String,
    /// Time since the entry was last delivered.
    pub idle: Duration,
    pub deliveries: u64,
}

/// Consumer-group queue over an append-only stream.
///
/// Each instance is one consumer (`worker_id`) in the shared group and owns
/// the [`PendingReclaimer`] that recovers entries stranded by dead
/// consumers.
#[derive(Debug)]
pub struct StreamGroupQueue<S: StreamStore> {
    store: S,
    worker_id: String,
    batch_size: usize,
    block: Duration,
    reclaimer: PendingReclaimer,
    group_ready: bool,
}

impl<S: StreamStore> StreamGroupQueue<S> {
    pub fn new(store: S, worker_id: impl Into<String>, config: &StreamQueueConfig) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            batch_size: config.batch_size.max(1),
            block: Duration::from_millis(config.block_ms),
            reclaimer: PendingReclaimer::from_config(config),
            group_ready: false,
        }
    }

    pub fn with_reclaimer(mut self, reclaimer: PendingReclaimer) -> Self {
        self.reclaimer = reclaimer;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    fn push_decoded(&self, entries: Vec<StreamEntry>, out: &mut Vec<Delivery>) {
        let delivered_at = Utc::now();
        for entry in entries {
            match entry.fields.decode(&entry.id, delivered_at) {
                Ok(job) => out.push(Delivery::new(
                    job,
                    Receipt::Entry(entry.id),
                    &self.worker_id,
                )),
                // Left pending; nothing acknowledges it.
                Err(err) => warn!(
                    worker_id = %self.worker_id,
                    entry_id = %entry.id,
                    error = %err,
                    "skipping malformed stream entry"
                ),
            }
        }
    }
}

#[async_trait]
impl<S: StreamStore> QueueBackend for StreamGroupQueue<S> {
    fn kind(&self) -> BackendKind {
        BackendKind::StreamGroup
    }

    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn poll_interval(&self) -> Duration {
        self.block
    }

    fn fetch_blocks(&self) -> bool {
        true
    }

    async fn fetch(&mut self) -> anyhow::Result<Vec<Delivery>> {
        if !self.group_ready {
            self.store.create_group().await?;
            self.group_ready = true;
        }

        let mut out = Vec::with_capacity(self.batch_size);

        if self.reclaimer.tick() {
            match self.reclaimer.sweep(&mut self.store, &self.worker_id).await {
                Ok(claimed) => self.push_decoded(claimed, &mut out),
                Err(err) => warn!(
                    worker_id = %self.worker_id,
                    error = %err,
                    "pending entry sweep failed"
                ),
            }
        }

        // Reclaimed work is already in hand; don't wait for fresh entries.
        let block = if out.is_empty() { self.block } else { Duration::ZERO };
        let count = self.batch_size.saturating_sub(out.len()).max(1);

        match self.store.read_group(&self.worker_id, count, block).await {
            Ok(entries) => self.push_decoded(entries, &mut out),
            Err(err) if StreamError::is_missing_group(&err) => {
                warn!(
                    worker_id = %self.worker_id,
                    error = %err,
                    "consumer group missing, recreating"
                );
                if let Err(err) = self.store.create_group().await {
                    if out.is_empty() {
                        return Err(err);
                    }
                    // Keep the reclaimed entries; the next fetch retries.
                    warn!(
                        worker_id = %self.worker_id,
                        error = %err,
                        "failed to recreate consumer group"
                    );
                }
            }
            Err(err) if out.is_empty() => return Err(err),
            Err(err) => warn!(
                worker_id = %self.worker_id,
                error = %err,
                "group read failed after reclaim"
            ),
        }

        Ok(out)
    }

    async fn acknowledge(&mut self, deliveries: &[Delivery]) -> anyhow::Result<usize> {
        let ids: Vec<String> = deliveries
            .iter()
            .filter_map(|delivery| delivery.entry_id().map(str::to_string))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let acked = self.store.ack(&ids).await?;
        if acked < ids.len() as u64 {
            // Reclaimed and acknowledged by another consumer meanwhile.
            debug!(
                worker_id = %self.worker_id,
                requested = ids.len(),
                acked,
                "some entries were no longer pending"
            );
        }
        Ok(usize::try_from(acked).unwrap_or(usize::MAX).min(ids.len()))
    }

    async fn fail_or_requeue(&mut self, delivery: Delivery) -> anyhow::Result<()> {
        // Unacknowledged entries stay pending and are reclaimed once idle.
        debug!(
            worker_id = %self.worker_id,
            entry_id = delivery.entry_id().unwrap_or_default(),
            "leaving failed entry pending"
        );
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.store.close().await
    }
}
