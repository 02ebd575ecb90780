//! Loads and saves event-sourced aggregates through an [`EventStore`].

use std::any::type_name;
use std::marker::PhantomData;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use chronicle_core::{
    Aggregate, AggregateError, AggregateKind, EntityId, Event, KindEvent, Metadata,
};
use chronicle_events::{BusError, EventRecord, PublishOptions, Publisher};

use super::r#trait::{EventStore, EventStoreError};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: &'static str, id: String },

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// A stored record does not carry this aggregate kind's payload.
    #[error("event {name} does not carry a {expected}")]
    Payload { name: String, expected: &'static str },

    #[error("optimistic locking failed for {entity_type} {id}: too many retries ({attempts})")]
    OptimisticLockExhausted {
        entity_type: &'static str,
        id: String,
        attempts: u32,
    },

    /// The events were stored but could not be handed to the publisher.
    #[error("events stored but not published")]
    Publish(#[source] BusError),
}

/// Event-sourced persistence for one aggregate kind.
///
/// Saving appends [`Aggregate::get_new_events`] at the version the aggregate
/// was loaded at, marks them saved, then publishes the stored records
/// (publish happens only after append succeeds).
pub struct AggregateRepository<K, S> {
    store: S,
    publisher: Option<Arc<dyn Publisher<EventRecord>>>,
    policy: RetryPolicy,
    _kind: PhantomData<fn() -> K>,
}

impl<K, S> AggregateRepository<K, S>
where
    K: AggregateKind,
    K::Snapshot: Default,
    S: EventStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            publisher: None,
            policy: RetryPolicy::default(),
            _kind: PhantomData,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher<EventRecord>>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Rebuild the aggregate from its full history.
    pub async fn load(&self, id: &K::Id) -> Result<Aggregate<K>, RepositoryError> {
        let records = self.store.load(&id.to_string()).await?;
        if records.is_empty() {
            return Err(RepositoryError::NotFound {
                entity_type: K::ENTITY_TYPE,
                id: id.to_string(),
            });
        }

        let events = records
            .iter()
            .map(to_event::<K>)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Aggregate::reify(events, K::Snapshot::default)?)
    }

    /// Persist the aggregate's new events, then publish them.
    pub async fn save(&self, aggregate: &mut Aggregate<K>) -> Result<(), RepositoryError> {
        if !aggregate.has_events_to_save() {
            return Ok(());
        }

        let records: Vec<EventRecord> = aggregate
            .get_new_events()
            .iter()
            .map(EventRecord::from_event)
            .collect();
        let expected = aggregate.version() - records.len() as u64;

        self.store.append(records.clone(), expected).await?;
        aggregate.mark_events_as_saved();

        if let Some(publisher) = &self.publisher {
            for record in records {
                publisher
                    .publish(record, PublishOptions::new())
                    .await
                    .map_err(RepositoryError::Publish)?;
            }
        }
        Ok(())
    }

    /// Load, run `command`, save; retried from scratch when another writer
    /// appended in between.
    pub async fn update<F>(&self, id: &K::Id, mut command: F) -> Result<Aggregate<K>, RepositoryError>
    where
        F: FnMut(&mut Aggregate<K>) -> Result<(), AggregateError>,
    {
        let attempts = self.policy.attempts();

        for attempt in 1..=attempts {
            let mut aggregate = self.load(id).await?;
            command(&mut aggregate)?;

            match self.save(&mut aggregate).await {
                Ok(()) => return Ok(aggregate),
                Err(RepositoryError::Store(err)) if err.is_concurrency() => {
                    debug!(
                        entity_type = K::ENTITY_TYPE,
                        id = %id,
                        attempt,
                        error = %err,
                        "concurrent append, retrying"
                    );
                    self.policy.backoff(attempt).await;
                }
                Err(err) => return Err(err),
            }
        }

        warn!(
            entity_type = K::ENTITY_TYPE,
            id = %id,
            attempts,
            "optimistic lock retries exhausted"
        );
        Err(RepositoryError::OptimisticLockExhausted {
            entity_type: K::ENTITY_TYPE,
            id: id.to_string(),
            attempts,
        })
    }
}

/// Rebuild a typed aggregate event from a stored record.
pub fn to_event<K: AggregateKind>(record: &EventRecord) -> Result<KindEvent<K>, RepositoryError> {
    let payload = record
        .data::<K::Payload>()
        .cloned()
        .ok_or_else(|| RepositoryError::Payload {
            name: record.name().to_string(),
            expected: type_name::<K::Payload>(),
        })?;

    let aggregate = record.aggregate();
    let entity_id = K::Id::parse_id(&aggregate.id).map_err(AggregateError::from)?;
    let metadata = Metadata::restore(
        record.id(),
        aggregate.name.clone(),
        entity_id,
        record.name(),
        aggregate.version,
        record.occurred_at(),
    );
    Ok(Event::new(metadata, payload))
}
