use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use chronicle_events::EventRecord;

use super::r#trait::{EventStore, EventStoreError};

/// In-memory append-only event store.
///
/// Intended for tests/dev. Records keep their typed payloads, so no codec is
/// involved on the way in or out.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<String, Vec<EventRecord>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[EventRecord]) -> u64 {
        stream.last().map(|r| r.aggregate().version).unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, records: Vec<EventRecord>, expected_version: u64) -> Result<(), EventStoreError> {
        let Some(first) = records.first() else {
            return Ok(());
        };

        // All records must target the same stream and continue it without gaps.
        let aggregate_id = first.aggregate().id.clone();
        let aggregate_type = first.aggregate().name.clone();
        for (idx, record) in records.iter().enumerate() {
            let aggregate = record.aggregate();
            if aggregate.id != aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate ids (index {idx})"
                )));
            }
            if aggregate.name != aggregate_type {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate types (index {idx})"
                )));
            }
            let expected = expected_version + 1 + idx as u64;
            if aggregate.version != expected {
                return Err(EventStoreError::InvalidAppend(format!(
                    "record {idx} has version {}, expected {expected}",
                    aggregate.version
                )));
            }
        }

        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        let stream = streams.entry(aggregate_id.clone()).or_default();
        let current = Self::current_version(stream);

        if current != expected_version {
            return Err(EventStoreError::Concurrency {
                aggregate_id,
                expected: expected_version,
                actual: current,
            });
        }

        // Enforce aggregate type stability across the stream.
        if let Some(existing) = stream.first() {
            if existing.aggregate().name != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate type is '{}', attempted append with '{}'",
                    existing.aggregate().name,
                    aggregate_type
                )));
            }
        }

        stream.extend(records);
        Ok(())
    }

    async fn load(&self, aggregate_id: &str) -> Result<Vec<EventRecord>, EventStoreError> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        Ok(streams.get(aggregate_id).cloned().unwrap_or_default())
    }

    async fn load_from(&self, aggregate_id: &str, version: u64) -> Result<Vec<EventRecord>, EventStoreError> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        Ok(streams
            .get(aggregate_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|r| r.aggregate().version >= version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
