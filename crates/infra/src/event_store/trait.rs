use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use chronicle_events::EventRecord;

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to
/// domain errors raised by aggregates.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Someone else appended to the stream since it was read.
    #[error("optimistic concurrency check failed for {aggregate_id}: expected version {expected}, found {actual}")]
    Concurrency {
        aggregate_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

impl EventStoreError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, EventStoreError::Concurrency { .. })
    }
}

/// Append-only store of aggregate histories.
///
/// Events are organized into **streams**, one per aggregate id. Within a
/// stream, record versions (`EventRecord::aggregate().version`) run 1, 2, 3...
/// without gaps.
///
/// `append()`:
/// - requires every record of the batch to target the same aggregate
/// - checks the stream is still at `expected_version`
/// - requires the batch to continue the stream at `expected_version + 1`
/// - persists the batch atomically (all or nothing)
///
/// `load()` returns the stream in version order, or an empty vector if the
/// aggregate has no history.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, records: Vec<EventRecord>, expected_version: u64) -> Result<(), EventStoreError>;

    async fn load(&self, aggregate_id: &str) -> Result<Vec<EventRecord>, EventStoreError>;

    /// Records of the stream with a version of at least `version`.
    async fn load_from(&self, aggregate_id: &str, version: u64) -> Result<Vec<EventRecord>, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(&self, records: Vec<EventRecord>, expected_version: u64) -> Result<(), EventStoreError> {
        (**self).append(records, expected_version).await
    }

    async fn load(&self, aggregate_id: &str) -> Result<Vec<EventRecord>, EventStoreError> {
        (**self).load(aggregate_id).await
    }

    async fn load_from(&self, aggregate_id: &str, version: u64) -> Result<Vec<EventRecord>, EventStoreError> {
        (**self).load_from(aggregate_id, version).await
    }
}
