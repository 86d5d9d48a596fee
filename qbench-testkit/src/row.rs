use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use qbench::{BackendKind, Delivery, Job, JobId, JobSink, RowStore};
use tokio::time::Instant;

/// Row-store double with the per-variant semantics of the stored functions.
///
/// - SkipLocked and Partitioned lock the row in place; a lock older than the
///   lease (when one is set) lapses and the row can be fetched again.
/// - DeleteReturning removes the row on fetch and re-inserts it on fail.
///
/// Rows are taken highest priority first, then oldest first.
#[derive(Clone)]
pub struct InMemoryRowStore {
    kind: BackendKind,
    state: Arc<Mutex<RowState>>,
}

#[derive(Default)]
struct RowState {
    rows: Vec<Row>,
    next_seq: u64,
    lease: Option<Duration>,
    taken: HashMap<JobId, Job>,
    acks: HashMap<JobId, u32>,
    submitted: u64,
    failed_fetches: u32,
    /// Completions left before the next one fails.
    complete_fails_after: Option<u32>,
}

struct Row {
    seq: u64,
    job: Job,
    locked: Option<(String, Instant)>,
}

impl RowState {
    fn available(&self, row: &Row, partition: Option<i32>, now: Instant) -> bool {
        if partition.is_some() && row.job.partition_key != partition {
            return false;
        }
        match (&row.locked, self.lease) {
            (None, _) => true,
            (Some((_, at)), Some(lease)) => now.duration_since(*at) >= lease,
            (Some(_), None) => false,
        }
    }

    fn push(&mut self, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.rows.push(Row {
            seq,
            job,
            locked: None,
        });
    }
}

impl InMemoryRowStore {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(RowState::default())),
        }
    }

    /// Locks older than `lease` lapse and their rows become fetchable again.
    pub fn with_lease(self, lease: Duration) -> Self {
        self.state.lock().lease = Some(lease);
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Make the next `n` fetches fail.
    pub fn fail_next_fetches(&self, n: u32) {
        self.state.lock().failed_fetches = n;
    }

    /// Let the next `n` completions succeed, then fail exactly one.
    pub fn fail_complete_after(&self, n: u32) {
        self.state.lock().complete_fails_after = Some(n);
    }

    /// Rows still in the queue table, locked or not.
    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows currently locked or removed-but-unacknowledged.
    pub fn in_flight(&self) -> usize {
        let state = self.state.lock();
        state.rows.iter().filter(|r| r.locked.is_some()).count() + state.taken.len()
    }

    pub fn submitted(&self) -> u64 {
        self.state.lock().submitted
    }

    /// Total completions, duplicates included.
    pub fn acknowledged(&self) -> u64 {
        self.state.lock().acks.values().map(|&n| u64::from(n)).sum()
    }

    /// Completions per job.
    pub fn ack_counts(&self) -> HashMap<JobId, u32> {
        self.state.lock().acks.clone()
    }

    /// Jobs completed more than once.
    pub fn duplicate_acks(&self) -> Vec<JobId> {
        let state = self.state.lock();
        state
            .acks
            .iter()
            .filter(|(_, &n)| n > 1)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[async_trait]
impl RowStore for InMemoryRowStore {
    async fn get_next(
        &mut self,
        worker_id: &str,
        partition: Option<i32>,
    ) -> anyhow::Result<Option<Job>> {
        let mut state = self.state.lock();
        if state.failed_fetches > 0 {
            state.failed_fetches -= 1;
            anyhow::bail!("connection reset by peer");
        }
        if self.kind == BackendKind::Partitioned && partition.is_none() {
            anyhow::bail!("partitioned fetch requires a partition");
        }

        let now = Instant::now();
        let best = state
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| state.available(row, partition, now))
            .max_by(|(_, a), (_, b)| {
                a.job
                    .priority
                    .cmp(&b.job.priority)
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|(index, _)| index);

        let Some(index) = best else {
            return Ok(None);
        };

        if self.kind == BackendKind::DeleteReturning {
            let row = state.rows.remove(index);
            state.taken.insert(row.job.id, row.job.clone());
            return Ok(Some(row.job));
        }

        let row = &mut state.rows[index];
        row.locked = Some((worker_id.to_string(), now));
        Ok(Some(row.job.clone()))
    }

    async fn complete(&mut self, delivery: &Delivery) -> anyhow::Result<()> {
        let id = delivery.job_id();
        let mut state = self.state.lock();
        match state.complete_fails_after {
            Some(0) => {
                state.complete_fails_after = None;
                anyhow::bail!("connection reset by peer");
            }
            Some(n) => state.complete_fails_after = Some(n - 1),
            None => {}
        }
        match self.kind {
            BackendKind::DeleteReturning => {
                state.taken.remove(&id);
            }
            _ => {
                let before = state.rows.len();
                state.rows.retain(|row| row.job.id != id);
                if state.rows.len() == before {
                    anyhow::bail!("job {id} is not in the queue");
                }
            }
        }
        *state.acks.entry(id).or_default() += 1;
        Ok(())
    }

    async fn fail(&mut self, delivery: &Delivery) -> anyhow::Result<()> {
        let id = delivery.job_id();
        let mut state = self.state.lock();
        match self.kind {
            BackendKind::DeleteReturning => {
                let job = state
                    .taken
                    .remove(&id)
                    .unwrap_or_else(|| delivery.job.clone());
                state.push(job);
            }
            _ => {
                if let Some(row) = state.rows.iter_mut().find(|row| row.job.id == id) {
                    row.locked = None;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobSink for InMemoryRowStore {
    async fn submit(&mut self, jobs: &[Job]) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        for job in jobs {
            state.push(job.clone());
        }
        state.submitted += jobs.len() as u64;
        Ok(())
    }
}
