use thiserror::Error;

/// Failures reported by a stream store that callers need to tell apart from
/// ordinary transport errors.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The consumer group is gone, typically because the stream was deleted
    /// and recreated. Recoverable by recreating the group.
    #[error("consumer group {group} does not exist on stream {stream}")]
    MissingGroup { stream: String, group: String },
    /// An entry's fields could not be turned back into a job.
    #[error("malformed stream entry {id}: {reason}")]
    MalformedEntry { id: String, reason: String },
}

impl StreamError {
    /// Whether `err` carries a [`StreamError::MissingGroup`].
    pub fn is_missing_group(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<StreamError>(),
            Some(StreamError::MissingGroup { .. })
        )
    }
}

/// Attached as context to an acknowledgement error when part of the batch
/// was already acknowledged before the failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("acknowledged {acknowledged} of {requested} deliveries before failing")]
pub struct PartialAck {
    pub acknowledged: usize,
    pub requested: usize,
}

impl PartialAck {
    /// Leading deliveries `err` reports as acknowledged; 0 when it carries
    /// no [`PartialAck`].
    pub fn acknowledged_before(err: &anyhow::Error) -> usize {
        err.downcast_ref::<PartialAck>()
            .map_or(0, |partial| partial.acknowledged)
    }
}

/// Returned when a backend name does not match any known queue variant.
#[derive(Debug, Error)]
#[error("unknown backend {0:?} (expected skip_locked, delete_returning, partitioned or stream)")]
pub struct ParseBackendKindError(pub String);
