use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use qbench::{EntryFields, Job, JobSink, PendingEntry, StreamEntry, StreamError, StreamStore};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Stream and consumer-group double with Redis stream semantics.
///
/// Entries are never removed; the group tracks a last-delivered position and
/// a pending list of delivered-but-unacknowledged entries with their owner
/// and idle clock. Idle time runs on the tokio clock so paused-time tests
/// can age entries with `tokio::time::advance`.
#[derive(Clone)]
pub struct InMemoryStreamStore {
    shared: Arc<Shared>,
}

struct Shared {
    stream: String,
    group: String,
    state: Mutex<StreamState>,
    appended: Notify,
}

#[derive(Default)]
struct StreamState {
    entries: BTreeMap<u64, EntryFields>,
    next_seq: u64,
    group: Option<GroupState>,
    acks: HashMap<String, u32>,
    failed_reads: u32,
}

#[derive(Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingInfo>,
}

struct PendingInfo {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

fn entry_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_id(id: &str) -> Option<u64> {
    id.split_once('-')
        .map_or(id, |(ms, _)| ms)
        .parse()
        .ok()
}

impl InMemoryStreamStore {
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                stream: stream.into(),
                group: group.into(),
                state: Mutex::new(StreamState {
                    next_seq: 1,
                    ..Default::default()
                }),
                appended: Notify::new(),
            }),
        }
    }

    pub fn stream(&self) -> &str {
        &self.shared.stream
    }

    pub fn group(&self) -> &str {
        &self.shared.group
    }

    /// Append raw fields, as another tool writing to the stream would.
    pub fn append_fields(&self, fields: EntryFields) -> String {
        let seq = {
            let mut state = self.shared.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.insert(seq, fields);
            seq
        };
        self.shared.appended.notify_waiters();
        entry_id(seq)
    }

    /// Destroy the consumer group, pending list included.
    pub fn drop_group(&self) {
        self.shared.state.lock().group = None;
    }

    pub fn has_group(&self) -> bool {
        self.shared.state.lock().group.is_some()
    }

    /// Make the next `n` group reads fail.
    pub fn fail_next_reads(&self, n: u32) {
        self.shared.state.lock().failed_reads = n;
    }

    /// Entries ever appended.
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries delivered but not yet acknowledged.
    pub fn pending_len(&self) -> usize {
        self.shared
            .state
            .lock()
            .group
            .as_ref()
            .map_or(0, |group| group.pending.len())
    }

    /// Owner of a pending entry.
    pub fn pending_owner(&self, id: &str) -> Option<String> {
        let seq = parse_id(id)?;
        let state = self.shared.state.lock();
        state
            .group
            .as_ref()?
            .pending
            .get(&seq)
            .map(|info| info.consumer.clone())
    }

    /// Entries acknowledged at least once.
    pub fn acknowledged(&self) -> u64 {
        self.shared.state.lock().acks.len() as u64
    }

    /// Acknowledge calls per entry ID, including ones for entries no longer
    /// pending.
    pub fn ack_counts(&self) -> HashMap<String, u32> {
        self.shared.state.lock().acks.clone()
    }

    fn missing_group(&self) -> anyhow::Error {
        StreamError::MissingGroup {
            stream: self.shared.stream.clone(),
            group: self.shared.group.clone(),
        }
        .into()
    }

    fn take_new(&self, consumer: &str, count: usize) -> anyhow::Result<Vec<StreamEntry>> {
        let mut state = self.shared.state.lock();
        if state.failed_reads > 0 {
            state.failed_reads -= 1;
            anyhow::bail!("connection reset by peer");
        }
        let state = &mut *state;
        let group = state.group.as_mut().ok_or_else(|| self.missing_group())?;

        let now = Instant::now();
        let mut out = Vec::new();
        for (&seq, fields) in state.entries.range(group.last_delivered + 1..).take(count) {
            group.last_delivered = seq;
            group.pending.insert(
                seq,
                PendingInfo {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            out.push(StreamEntry::new(entry_id(seq), fields.clone()));
        }
        Ok(out)
    }
}

#[async_trait]
impl StreamStore for InMemoryStreamStore {
    async fn create_group(&mut self) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock();
        if state.group.is_none() {
            state.group = Some(GroupState::default());
        }
        Ok(())
    }

    async fn read_group(
        &mut self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> anyhow::Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.take_new(consumer, count)?;
            if !entries.is_empty() || Instant::now() >= deadline {
                return Ok(entries);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&mut self, ids: &[String]) -> anyhow::Result<u64> {
        let mut state = self.shared.state.lock();
        let state = &mut *state;
        let group = state.group.as_mut().ok_or_else(|| self.missing_group())?;

        let mut acked = 0;
        for id in ids {
            *state.acks.entry(id.clone()).or_default() += 1;
            if parse_id(id).and_then(|seq| group.pending.remove(&seq)).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn pending(&mut self, count: usize) -> anyhow::Result<Vec<PendingEntry>> {
        let state = self.shared.state.lock();
        let group = state.group.as_ref().ok_or_else(|| self.missing_group())?;
        let now = Instant::now();
        Ok(group
            .pending
            .iter()
            .take(count)
            .map(|(&seq, info)| PendingEntry {
                id: entry_id(seq),
                consumer: info.consumer.clone(),
                idle: now.duration_since(info.delivered_at),
                deliveries: info.deliveries,
            })
            .collect())
    }

    async fn claim(
        &mut self,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> anyhow::Result<Vec<StreamEntry>> {
        let mut state = self.shared.state.lock();
        let state = &mut *state;
        let group = state.group.as_mut().ok_or_else(|| self.missing_group())?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        for id in ids {
            let Some(seq) = parse_id(id) else { continue };
            let Some(info) = group.pending.get_mut(&seq) else {
                continue;
            };
            // Idleness is re-checked here, so a racing claimer loses.
            if now.duration_since(info.delivered_at) < min_idle {
                continue;
            }
            info.consumer = consumer.to_string();
            info.delivered_at = now;
            info.deliveries += 1;
            if let Some(fields) = state.entries.get(&seq) {
                claimed.push(StreamEntry::new(entry_id(seq), fields.clone()));
            }
        }
        Ok(claimed)
    }
}

#[async_trait]
impl JobSink for InMemoryStreamStore {
    async fn submit(&mut self, jobs: &[Job]) -> anyhow::Result<()> {
        {
            let mut state = self.shared.state.lock();
            for job in jobs {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.entries.insert(seq, EntryFields::from_job(job));
            }
        }
        self.shared.appended.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_group() -> InMemoryStreamStore {
        let store = InMemoryStreamStore::new("bench_queue", "bench_workers");
        store.shared.state.lock().group = Some(GroupState::default());
        store
    }

    #[tokio::test]
    async fn test_read_without_group_is_missing_group() {
        let mut store = InMemoryStreamStore::new("s", "g");
        let err = store
            .read_group("worker_0", 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(StreamError::is_missing_group(&err));
    }

    #[tokio::test]
    async fn test_each_entry_is_delivered_once_to_the_group() {
        let mut store = store_with_group();
        store
            .submit(&[Job::new(vec![b'a'], 1, None), Job::new(vec![b'b'], 1, None)])
            .await
            .unwrap();

        let mut other = store.clone();
        let first = store.read_group("worker_0", 1, Duration::ZERO).await.unwrap();
        let second = other.read_group("worker_1", 10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].id, second[0].id);
        assert_eq!(store.pending_len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_wakes_on_append() {
        let mut store = store_with_group();
        let producer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut producer = producer;
            producer
                .submit(&[Job::new(vec![b'a'], 1, None)])
                .await
                .unwrap();
        });

        let start = Instant::now();
        let entries = store
            .read_group("worker_0", 10, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_requires_idle_time() {
        let mut store = store_with_group();
        store.submit(&[Job::new(vec![b'a'], 1, None)]).await.unwrap();
        let entries = store.read_group("crashed", 1, Duration::ZERO).await.unwrap();
        let ids = vec![entries[0].id.clone()];

        let early = store
            .claim("worker_1", Duration::from_secs(5), &ids)
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        let claimed = store
            .claim("worker_1", Duration::from_secs(5), &ids)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(store.pending_owner(&ids[0]).as_deref(), Some("worker_1"));

        // The claim reset the idle clock; a second claimer gets nothing.
        let again = store
            .claim("worker_2", Duration::from_secs(5), &ids)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_ack_counts_only_pending_entries() {
        let mut store = store_with_group();
        store.submit(&[Job::new(vec![b'a'], 1, None)]).await.unwrap();
        let entries = store.read_group("worker_0", 1, Duration::ZERO).await.unwrap();
        let ids = vec![entries[0].id.clone()];

        assert_eq!(store.ack(&ids).await.unwrap(), 1);
        assert_eq!(store.ack(&ids).await.unwrap(), 0);
        assert_eq!(store.pending_len(), 0);
        assert_eq!(store.ack_counts()[&ids[0]], 2);
    }
}
