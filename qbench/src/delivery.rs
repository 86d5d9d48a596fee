use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId};

/// Backend-specific handle needed to acknowledge or reject a delivery.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Receipt {
    /// Row is locked in place until completed or its lease lapses.
    Locked,
    /// Row was already removed from the queue table by the fetch.
    Removed,
    /// Row is locked inside the given partition.
    Partition(i32),
    /// Stream entry ID, pending in the consumer group until acknowledged.
    Entry(String),
}

/// A job handed to exactly one worker for the duration of a lease or
/// stream delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Delivery {
    /// The delivered job.
    pub job: Job,
    /// How the backend identifies this delivery on acknowledge.
    pub receipt: Receipt,
    /// Consumer identity the job was delivered to.
    pub worker_id: String,
    /// When the worker received the job.
    pub delivered_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(job: Job, receipt: Receipt, worker_id: impl Into<String>) -> Self {
        Self {
            job,
            receipt,
            worker_id: worker_id.into(),
            delivered_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    /// Stream entry ID, if this delivery came from a consumer group.
    pub fn entry_id(&self) -> Option<&str> {
        match &self.receipt {
            Receipt::Entry(id) => Some(id),
            _ => None,
        }
    }

    /// Milliseconds from enqueue to `completed_at`.
    ///
    /// Clock skew between producer and consumer can push this below zero;
    /// the raw value is kept so skew stays visible in the aggregate.
    pub fn latency_ms(&self, completed_at: DateTime<Utc>) -> f64 {
        let delta = completed_at - self.job.enqueued_at;
        match delta.num_microseconds() {
            Some(us) => us as f64 / 1000.0,
            None => delta.num_milliseconds() as f64,
        }
    }
}
