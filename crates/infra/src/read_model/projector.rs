//! Projectors turn event records into read models.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use chronicle_events::{BusError, EventHandler, EventRecord, Subscriber, SubscriptionId, handler_fn};

use super::{ReadModel, ReadModelError, ReadRepository, find_optional};
use crate::event_store::EventStoreError;

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The event does not directly follow the stored read model.
    #[error("incorrect entity version for {id}: expected {expected}, found {found}")]
    IncorrectEntityVersion { id: String, expected: u64, found: u64 },

    #[error("projecting event {event} failed: {source}")]
    Projector {
        event: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Repository(#[from] ReadModelError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error("no projectors registered for aggregate type {aggregate_type}")]
    NoProjectors { aggregate_type: String },

    #[error("mismatched event aggregate types: expected {expected}, found {found}")]
    MismatchedAggregateType { expected: String, found: String },
}

impl ProjectionError {
    pub fn projector(event: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Projector {
            event: event.into(),
            source: source.into(),
        }
    }

    pub fn is_incorrect_version(&self) -> bool {
        matches!(self, ProjectionError::IncorrectEntityVersion { .. })
    }
}

/// Pure projection logic of one read model.
pub trait Projector: Send + Sync + 'static {
    type Model: ReadModel;

    /// Aggregate type whose events this projector understands.
    fn aggregate_type(&self) -> &str;

    /// Names of the events to subscribe to.
    fn events(&self) -> &[&'static str];

    /// Apply `record` to the current model (`None` if there is none yet).
    /// Returning `None` deletes the model.
    ///
    /// The returned model must carry the record's aggregate version.
    fn project(&self, record: &EventRecord, current: Option<Self::Model>) -> Result<Option<Self::Model>, ProjectionError>;
}

/// Object-safe face of a projection, as seen by buses, the healer and the
/// regenerator.
#[async_trait]
pub trait ProjectionHandler: Send + Sync {
    fn aggregate_type(&self) -> &str;

    async fn handle_event(&self, record: &EventRecord) -> Result<(), ProjectionError>;

    /// Drop the read model of `id`; a missing model is not an error.
    async fn remove(&self, id: &str) -> Result<(), ProjectionError>;
}

#[async_trait]
impl<H: ProjectionHandler + ?Sized> ProjectionHandler for Arc<H> {
    fn aggregate_type(&self) -> &str {
        (**self).aggregate_type()
    }

    async fn handle_event(&self, record: &EventRecord) -> Result<(), ProjectionError> {
        (**self).handle_event(record).await
    }

    async fn remove(&self, id: &str) -> Result<(), ProjectionError> {
        (**self).remove(id).await
    }
}

/// Runs a [`Projector`] against a [`ReadRepository`].
///
/// Records at or below the stored version were already applied (at-least-once
/// delivery) and are skipped. A record further ahead than the next version
/// fails with [`ProjectionError::IncorrectEntityVersion`].
pub struct ProjectorHandler<P, R> {
    projector: P,
    repository: R,
}

impl<P, R> ProjectorHandler<P, R>
where
    P: Projector,
    R: ReadRepository<P::Model>,
{
    pub fn new(projector: P, repository: R) -> Self {
        Self { projector, repository }
    }

    pub fn projector(&self) -> &P {
        &self.projector
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }
}

#[async_trait]
impl<P, R> ProjectionHandler for ProjectorHandler<P, R>
where
    P: Projector,
    R: ReadRepository<P::Model>,
{
    fn aggregate_type(&self) -> &str {
        self.projector.aggregate_type()
    }

    async fn handle_event(&self, record: &EventRecord) -> Result<(), ProjectionError> {
        let aggregate = record.aggregate();
        if aggregate.name != self.projector.aggregate_type() {
            return Err(ProjectionError::MismatchedAggregateType {
                expected: self.projector.aggregate_type().to_string(),
                found: aggregate.name.clone(),
            });
        }

        let current = find_optional(&self.repository, &aggregate.id).await?;
        let current_version = current.as_ref().map(ReadModel::version).unwrap_or(0);

        if aggregate.version <= current_version {
            debug!(
                event = record.name(),
                id = %aggregate.id,
                version = aggregate.version,
                current_version,
                "event already projected, skipping"
            );
            return Ok(());
        }
        if aggregate.version != current_version + 1 {
            return Err(ProjectionError::IncorrectEntityVersion {
                id: aggregate.id.clone(),
                expected: current_version + 1,
                found: aggregate.version,
            });
        }

        let existed = current.is_some();
        match self.projector.project(record, current)? {
            Some(model) => self.repository.save(model).await?,
            None if existed => self.repository.remove(&aggregate.id).await?,
            None => {}
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), ProjectionError> {
        match self.repository.remove(id).await {
            Err(err) if !err.is_not_found() => Err(err.into()),
            _ => Ok(()),
        }
    }
}

/// Adapt a projection into a bus handler.
pub fn event_handler<H>(handler: Arc<H>) -> EventHandler<EventRecord>
where
    H: ProjectionHandler + ?Sized + 'static,
{
    handler_fn(move |record: EventRecord| {
        let handler = handler.clone();
        async move {
            handler.handle_event(&record).await?;
            Ok(())
        }
    })
}

/// Subscribe a projection to each of `events`.
pub fn subscribe_projection<S, H>(
    subscriber: &S,
    events: &[&str],
    handler: Arc<H>,
) -> Result<Vec<SubscriptionId>, BusError>
where
    S: Subscriber<EventRecord> + ?Sized,
    H: ProjectionHandler + ?Sized + 'static,
{
    events
        .iter()
        .map(|name| subscriber.subscribe(name, event_handler(handler.clone())))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::read_model::InMemoryReadRepository;
    use crate::read_model::in_memory::tests::{Tally, tally};
    use chronicle_events::AggregateRef;

    /// Appends each event name to a [`Tally`].
    pub(crate) struct TallyProjector;

    impl Projector for TallyProjector {
        type Model = Tally;

        fn aggregate_type(&self) -> &str {
            "loans"
        }

        fn events(&self) -> &[&'static str] {
            &["tally.bump", "tally.reset"]
        }

        fn project(&self, record: &EventRecord, current: Option<Tally>) -> Result<Option<Tally>, ProjectionError> {
            let aggregate = record.aggregate();
            if record.name() == "tally.reset" {
                return Ok(None);
            }
            let mut model = current.unwrap_or_else(|| tally(&aggregate.id, 0));
            model.version = aggregate.version;
            model.events.push(record.name().to_string());
            Ok(Some(model))
        }
    }

    pub(crate) type TallyHandler = ProjectorHandler<TallyProjector, Arc<InMemoryReadRepository<Tally>>>;

    pub(crate) fn tally_handler() -> (Arc<TallyHandler>, Arc<InMemoryReadRepository<Tally>>) {
        let repository = Arc::new(InMemoryReadRepository::new());
        (Arc::new(ProjectorHandler::new(TallyProjector, repository.clone())), repository)
    }

    pub(crate) fn bump(id: &str, version: u64) -> EventRecord {
        EventRecord::new("tally.bump", AggregateRef::new(id, "loans", version), ())
    }

    #[tokio::test]
    async fn contiguous_events_are_projected_and_duplicates_skipped() {
        let (handler, repository) = tally_handler();
        handler.handle_event(&bump("a", 1)).await.unwrap();
        handler.handle_event(&bump("a", 2)).await.unwrap();
        handler.handle_event(&bump("a", 2)).await.unwrap();

        let model = repository.find("a").await.unwrap();
        assert_eq!(model.version, 2);
        assert_eq!(model.events.len(), 2);
    }

    #[tokio::test]
    async fn gaps_are_reported_as_incorrect_versions() {
        let (handler, repository) = tally_handler();
        handler.handle_event(&bump("a", 1)).await.unwrap();

        let err = handler.handle_event(&bump("a", 3)).await.unwrap_err();
        assert!(matches!(
            err,
            ProjectionError::IncorrectEntityVersion { expected: 2, found: 3, .. }
        ));
        assert_eq!(repository.find("a").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn projectors_can_delete_models_and_removal_tolerates_missing_ones() {
        let (handler, repository) = tally_handler();
        handler.handle_event(&bump("a", 1)).await.unwrap();
        handler
            .handle_event(&EventRecord::new("tally.reset", AggregateRef::new("a", "loans", 2), ()))
            .await
            .unwrap();
        assert!(repository.is_empty());

        handler.remove("a").await.unwrap();
    }

    #[tokio::test]
    async fn foreign_aggregate_types_are_rejected() {
        let (handler, _) = tally_handler();
        let record = EventRecord::new("tally.bump", AggregateRef::new("a", "cards", 1), ());
        assert!(matches!(
            handler.handle_event(&record).await,
            Err(ProjectionError::MismatchedAggregateType { .. })
        ));
    }

    #[tokio::test]
    async fn subscribed_projections_run_from_the_bus() {
        use chronicle_events::{Broker, PublishOptions, Publisher};

        let (handler, repository) = tally_handler();
        let broker = Broker::<EventRecord>::new();
        let events = handler.projector().events().to_vec();
        let ids = subscribe_projection(&broker, &events, handler).unwrap();
        assert_eq!(ids.len(), 2);

        broker.publish(bump("a", 1), PublishOptions::new()).await.unwrap();
        let err = broker.publish(bump("a", 5), PublishOptions::new()).await.unwrap_err();
        assert!(matches!(err, BusError::Broker(_)));
        assert_eq!(repository.find("a").await.unwrap().version, 1);
    }
}
