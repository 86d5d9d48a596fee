//! Row-store client over the queue variants' stored functions.
//!
//! Each variant lives in its own table and exposes its own functions (see
//! [`BackendKind::procedures`]). The functions themselves are installed
//! separately; this client expects:
//!
//! - `get_next_job(worker)`, `get_next_job_dr(worker)` and
//!   `get_next_job_part(partition, worker)` returning zero or one row with
//!   `job_id UUID`, `job_created_at TIMESTAMPTZ` and, where available,
//!   `job_payload JSONB` and `job_priority SMALLINT`;
//! - `complete_job(id)`, `complete_job_dr(id, payload, priority,
//!   created_at, worker)` and `complete_job_part(partition, id)`;
//! - `fail_job(id)`, `requeue_job_dr(id, payload, priority, created_at)`
//!   and `fail_job_part(partition, id)`.
//!
//! Queue tables accept `(id, payload, priority, created_at)` inserts, plus
//! `partition_key` for the partitioned table.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;
use uuid::Uuid;

use crate::backend::{BackendKind, JobSink, RowProcedures, RowStore};
use crate::config::PostgresConfig;
use crate::delivery::{Delivery, Receipt};
use crate::job::{Job, JobId, MAX_PRIORITY};

/// Row-store client bound to one queue variant.
///
/// Backed by a pool capped at a single connection, so each worker that owns
/// one of these talks to the database over its own session.
#[derive(Debug)]
pub struct PgRowStore {
    pool: PgPool,
    kind: BackendKind,
    procs: RowProcedures,
}

impl PgRowStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool, kind: BackendKind) -> anyhow::Result<Self> {
        let procs = kind
            .procedures()
            .with_context(|| format!("{kind} is not a row-store queue"))?;
        Ok(Self { pool, kind, procs })
    }

    /// Open a private single-connection pool for one worker or producer.
    pub async fn connect(config: &PostgresConfig, kind: BackendKind) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await
            .context("failed to connect to the row store")?;
        Self::new(pool, kind)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    fn payload_json(job: &Job) -> serde_json::Value {
        serde_json::json!({ "data": String::from_utf8_lossy(&job.payload) })
    }

    fn payload_bytes(value: serde_json::Value) -> Vec<u8> {
        match value {
            serde_json::Value::String(s) => s.into_bytes(),
            serde_json::Value::Object(mut map) => match map.remove("data") {
                Some(serde_json::Value::String(s)) => s.into_bytes(),
                Some(other) => other.to_string().into_bytes(),
                None => serde_json::Value::Object(map).to_string().into_bytes(),
            },
            other => other.to_string().into_bytes(),
        }
    }

    fn job_from_row(row: &PgRow, partition: Option<i32>) -> anyhow::Result<Option<Job>> {
        // Some function variants return a single all-NULL row when empty.
        let Some(job_id) = row.try_get::<Option<Uuid>, _>("job_id")? else {
            return Ok(None);
        };
        let created_at: DateTime<Utc> = row.try_get("job_created_at")?;
        let payload = row
            .try_get::<Option<serde_json::Value>, _>("job_payload")
            .unwrap_or(None)
            .map(Self::payload_bytes)
            .unwrap_or_default();
        let priority = row
            .try_get::<Option<i16>, _>("job_priority")
            .unwrap_or(None)
            .unwrap_or(0)
            .clamp(0, i16::from(MAX_PRIORITY)) as u8;

        let mut job = Job::new(payload, priority, partition).with_enqueued_at(created_at);
        job.id = JobId(job_id);
        Ok(Some(job))
    }

    fn partition_of(delivery: &Delivery) -> anyhow::Result<i32> {
        match delivery.receipt {
            Receipt::Partition(p) => Ok(p),
            _ => delivery
                .job
                .partition_key
                .with_context(|| format!("job {} has no partition", delivery.job.id)),
        }
    }
}

#[async_trait]
impl RowStore for PgRowStore {
    async fn get_next(
        &mut self,
        worker_id: &str,
        partition: Option<i32>,
    ) -> anyhow::Result<Option<Job>> {
        let row = match (self.kind, partition) {
            (BackendKind::Partitioned, Some(partition)) => {
                sqlx::query(&format!("SELECT * FROM {}($1, $2)", self.procs.get_next))
                    .bind(partition)
                    .bind(worker_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            (BackendKind::Partitioned, None) => {
                anyhow::bail!("partitioned fetch requires a partition")
            }
            _ => {
                sqlx::query(&format!("SELECT * FROM {}($1)", self.procs.get_next))
                    .bind(worker_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        match row {
            Some(row) => Self::job_from_row(&row, partition),
            None => Ok(None),
        }
    }

    async fn complete(&mut self, delivery: &Delivery) -> anyhow::Result<()> {
        let job = &delivery.job;
        match self.kind {
            BackendKind::DeleteReturning => {
                sqlx::query(&format!(
                    "SELECT {}($1, $2, $3, $4, $5)",
                    self.procs.complete
                ))
                .bind(job.id.0)
                .bind(Self::payload_json(job))
                .bind(i16::from(job.priority))
                .bind(job.enqueued_at)
                .bind(&delivery.worker_id)
                .execute(&self.pool)
                .await?;
            }
            BackendKind::Partitioned => {
                sqlx::query(&format!("SELECT {}($1, $2)", self.procs.complete))
                    .bind(Self::partition_of(delivery)?)
                    .bind(job.id.0)
                    .execute(&self.pool)
                    .await?;
            }
            _ => {
                sqlx::query(&format!("SELECT {}($1)", self.procs.complete))
                    .bind(job.id.0)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn fail(&mut self, delivery: &Delivery) -> anyhow::Result<()> {
        let job = &delivery.job;
        match self.kind {
            // The row is already gone; put it back.
            BackendKind::DeleteReturning => {
                sqlx::query(&format!("SELECT {}($1, $2, $3, $4)", self.procs.fail))
                    .bind(job.id.0)
                    .bind(Self::payload_json(job))
                    .bind(i16::from(job.priority))
                    .bind(job.enqueued_at)
                    .execute(&self.pool)
                    .await?;
            }
            BackendKind::Partitioned => {
                sqlx::query(&format!("SELECT {}($1, $2)", self.procs.fail))
                    .bind(Self::partition_of(delivery)?)
                    .bind(job.id.0)
                    .execute(&self.pool)
                    .await?;
            }
            _ => {
                sqlx::query(&format!("SELECT {}($1)", self.procs.fail))
                    .bind(job.id.0)
                    .execute(&self.pool)
                    .await?;
            }
        }
        debug!(job_id = %job.id, backend = %self.kind, "job released");
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait]
impl JobSink for PgRowStore {
    /// Insert the batch in one transaction; any failure rolls back the whole
    /// batch.
    async fn submit(&mut self, jobs: &[Job]) -> anyhow::Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let partitioned = self.kind == BackendKind::Partitioned;
        let mut builder: QueryBuilder<Postgres> = if partitioned {
            QueryBuilder::new(format!(
                "INSERT INTO {} (id, payload, priority, created_at, partition_key) ",
                self.procs.table
            ))
        } else {
            QueryBuilder::new(format!(
                "INSERT INTO {} (id, payload, priority, created_at) ",
                self.procs.table
            ))
        };
        builder.push_values(jobs, |mut row, job| {
            row.push_bind(job.id.0)
                .push_bind(Self::payload_json(job))
                .push_bind(i16::from(job.priority))
                .push_bind(job.enqueued_at);
            if partitioned {
                row.push_bind(job.partition_key.unwrap_or(0));
            }
        });

        let mut tx = self.pool.begin().await?;
        builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
