//! Stream-store client speaking the Redis stream commands (Redis or Valkey).

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, RedisError};
use tracing::{debug, info};

use crate::backend::{EntryFields, JobSink, PendingEntry, StreamEntry, StreamStore};
use crate::config::{StreamQueueConfig, StreamStoreConfig};
use crate::error::StreamError;
use crate::job::Job;

/// One private connection to the stream store, bound to a stream and a
/// consumer group.
#[derive(Clone)]
pub struct RedisStreamStore {
    conn: MultiplexedConnection,
    stream: String,
    group: String,
}

impl std::fmt::Debug for RedisStreamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamStore")
            .field("stream", &self.stream)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

impl RedisStreamStore {
    pub async fn connect(
        config: &StreamStoreConfig,
        queue: &StreamQueueConfig,
    ) -> anyhow::Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .with_context(|| format!("invalid stream store url {}", config.url))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to the stream store")?;
        Ok(Self {
            conn,
            stream: queue.stream.clone(),
            group: queue.group.clone(),
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Map `NOGROUP` replies to [`StreamError::MissingGroup`].
    fn classify(&self, err: RedisError, op: &'static str) -> anyhow::Error {
        if err.code() == Some("NOGROUP") {
            anyhow::Error::new(StreamError::MissingGroup {
                stream: self.stream.clone(),
                group: self.group.clone(),
            })
            .context(op)
        } else {
            anyhow::Error::new(err).context(op)
        }
    }

    fn to_entry(raw: StreamId) -> StreamEntry {
        let pairs = raw.map.iter().filter_map(|(field, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|value| (field.as_str(), value))
        });
        let fields = EntryFields::from_pairs(pairs);
        StreamEntry::new(raw.id, fields)
    }
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn create_group(&mut self) -> anyhow::Result<()> {
        let result: Result<(), RedisError> = self
            .conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;
        match result {
            Ok(()) => {
                info!(stream = %self.stream, group = %self.group, "created consumer group");
                Ok(())
            }
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(anyhow::Error::new(err).context("XGROUP CREATE failed")),
        }
    }

    async fn read_group(
        &mut self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> anyhow::Result<Vec<StreamEntry>> {
        let mut options = StreamReadOptions::default()
            .group(&self.group, consumer)
            .count(count);
        // BLOCK 0 waits forever; a zero timeout means "don't block".
        if !block.is_zero() {
            options = options.block(block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream], &[">"], &options)
            .await
            .map_err(|err| self.classify(err, "XREADGROUP failed"))?;

        Ok(reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .map(Self::to_entry)
            .collect())
    }

    async fn ack(&mut self, ids: &[String]) -> anyhow::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let acked: u64 = self
            .conn
            .xack(&self.stream, &self.group, ids)
            .await
            .map_err(|err| self.classify(err, "XACK failed"))?;
        Ok(acked)
    }

    async fn pending(&mut self, count: usize) -> anyhow::Result<Vec<PendingEntry>> {
        let reply: StreamPendingCountReply = self
            .conn
            .xpending_count(&self.stream, &self.group, "-", "+", count)
            .await
            .map_err(|err| self.classify(err, "XPENDING failed"))?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                deliveries: p.times_delivered as u64,
            })
            .collect())
    }

    async fn claim(
        &mut self,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> anyhow::Result<Vec<StreamEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let reply: StreamClaimReply = self
            .conn
            .xclaim(
                &self.stream,
                &self.group,
                consumer,
                min_idle.as_millis() as u64,
                ids,
            )
            .await
            .map_err(|err| self.classify(err, "XCLAIM failed"))?;
        Ok(reply.ids.into_iter().map(Self::to_entry).collect())
    }
}

#[async_trait]
impl JobSink for RedisStreamStore {
    /// Append the batch inside one `MULTI`/`EXEC`.
    async fn submit(&mut self, jobs: &[Job]) -> anyhow::Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for job in jobs {
            pipe.xadd(&self.stream, "*", &EntryFields::from_job(job).to_pairs())
                .ignore();
        }
        let () = pipe
            .query_async(&mut self.conn)
            .await
            .context("XADD batch failed")?;
        debug!(stream = %self.stream, jobs = jobs.len(), "appended batch");
        Ok(())
    }
}
