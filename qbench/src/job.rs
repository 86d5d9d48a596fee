use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

/// Highest priority a job may carry. Priorities span `0..=MAX_PRIORITY`.
pub const MAX_PRIORITY: u8 = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Immutable unit of benchmark work.
///
/// The payload is opaque filler; only `enqueued_at` matters for measurement,
/// since every latency sample is taken relative to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: Vec<u8>,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub partition_key: Option<i32>,
}

impl Job {
    pub fn new(payload: Vec<u8>, priority: u8, partition_key: Option<i32>) -> Self {
        Self {
            id: JobId::new(),
            payload,
            priority: priority.min(MAX_PRIORITY),
            enqueued_at: Utc::now(),
            partition_key,
        }
    }

    pub fn with_enqueued_at(mut self, enqueued_at: DateTime<Utc>) -> Self {
        self.enqueued_at = enqueued_at;
        self
    }
}

/// Generates synthetic jobs for the producer.
///
/// Seeded factories produce the same payload/priority/partition sequence on
/// every run, which keeps load shapes comparable between backends.
#[derive(Debug)]
pub struct JobFactory {
    rng: StdRng,
    payload_size: usize,
    partitions: Option<u32>,
}

impl JobFactory {
    pub fn new(payload_size: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            payload_size,
            partitions: None,
        }
    }

    /// Stamp every generated job with a partition key in `0..partitions`.
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = Some(partitions.max(1));
        self
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn next_job(&mut self) -> Job {
        let payload: Vec<u8> = (&mut self.rng)
            .sample_iter(&Alphanumeric)
            .take(self.payload_size)
            .collect();
        let priority = self.rng.gen_range(0..=MAX_PRIORITY);
        let partition_key = self
            .partitions
            .map(|partitions| self.rng.gen_range(0..partitions) as i32);
        Job::new(payload, priority, partition_key)
    }

    pub fn batch(&mut self, size: usize) -> Vec<Job> {
        (0..size).map(|_| self.next_job()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_is_clamped() {
        let job = Job::new(Vec::new(), 42, None);
        assert_eq!(job.priority, MAX_PRIORITY);
    }

    #[test]
    fn test_factory_respects_payload_size_and_ranges() {
        let mut factory = JobFactory::new(512, Some(7)).with_partitions(16);
        for job in factory.batch(200) {
            assert_eq!(job.payload.len(), 512);
            assert!(job.payload.iter().all(u8::is_ascii_alphanumeric));
            assert!(job.priority <= MAX_PRIORITY);
            let key = job.partition_key.expect("partition key");
            assert!((0..16).contains(&key));
        }
    }

    #[test]
    fn test_seeded_factories_repeat_the_same_load() {
        let mut a = JobFactory::new(32, Some(99));
        let mut b = JobFactory::new(32, Some(99));
        for (x, y) in a.batch(20).into_iter().zip(b.batch(20)) {
            assert_eq!(x.payload, y.payload);
            assert_eq!(x.priority, y.priority);
            assert_ne!(x.id, y.id);
        }
    }

    #[test]
    fn test_unpartitioned_factory_leaves_key_empty() {
        let mut factory = JobFactory::new(8, None);
        assert!(factory.next_job().partition_key.is_none());
    }
}
