use async_trait::async_trait;
use tracing::{error, info, warn};

use chronicle_events::EventRecord;

use super::projector::{ProjectionError, ProjectionHandler};
use crate::event_store::EventStore;

/// Repairs read models that fell out of step with their aggregate.
///
/// When the wrapped projection reports an incorrect entity version (a missed
/// or reordered event), the read model of that aggregate is dropped, rebuilt
/// from the full history, and the event is projected again. If the rebuild
/// fails, the original error is returned.
pub struct EntityHealer<H, S> {
    inner: H,
    events: S,
}

impl<H, S> EntityHealer<H, S>
where
    H: ProjectionHandler,
    S: EventStore,
{
    pub fn new(inner: H, events: S) -> Self {
        Self { inner, events }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    async fn heal(&self, id: &str) -> Result<usize, ProjectionError> {
        self.inner.remove(id).await?;

        let records = self.events.load(id).await?;
        for record in &records {
            if record.aggregate().name != self.inner.aggregate_type() {
                return Err(ProjectionError::MismatchedAggregateType {
                    expected: self.inner.aggregate_type().to_string(),
                    found: record.aggregate().name.clone(),
                });
            }
            self.inner.handle_event(record).await?;
        }
        Ok(records.len())
    }
}

#[async_trait]
impl<H, S> ProjectionHandler for EntityHealer<H, S>
where
    H: ProjectionHandler,
    S: EventStore,
{
    fn aggregate_type(&self) -> &str {
        self.inner.aggregate_type()
    }

    async fn handle_event(&self, record: &EventRecord) -> Result<(), ProjectionError> {
        let err = match self.inner.handle_event(record).await {
            Err(err) if err.is_incorrect_version() => err,
            other => return other,
        };

        let id = &record.aggregate().id;
        warn!(
            aggregate_type = self.inner.aggregate_type(),
            id = %id,
            event = record.name(),
            error = %err,
            "regenerating read model"
        );

        match self.heal(id).await {
            Ok(replayed) => {
                info!(id = %id, replayed, "read model regenerated");
                self.inner.handle_event(record).await
            }
            Err(heal_err) => {
                error!(id = %id, error = %heal_err, "read model regeneration failed");
                Err(err)
            }
        }
    }

    async fn remove(&self, id: &str) -> Result<(), ProjectionError> {
        self.inner.remove(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::read_model::ReadRepository;
    use crate::read_model::projector::tests::{bump, tally_handler};
    use chronicle_events::AggregateRef;
    use std::sync::Arc;

    #[tokio::test]
    async fn gaps_are_healed_from_the_history() {
        let store = Arc::new(InMemoryEventStore::new());
        store
            .append((1..=3).map(|v| bump("a", v)).collect(), 0)
            .await
            .unwrap();

        let (inner, repository) = tally_handler();
        let healer = EntityHealer::new(inner, store);

        healer.handle_event(&bump("a", 1)).await.unwrap();
        // Version 2 never arrived.
        healer.handle_event(&bump("a", 3)).await.unwrap();

        let model = repository.find("a").await.unwrap();
        assert_eq!(model.version, 3);
        assert_eq!(model.events.len(), 3);
    }

    #[tokio::test]
    async fn failed_healing_returns_the_original_error() {
        let store = Arc::new(InMemoryEventStore::new());
        store
            .append(
                vec![EventRecord::new("tally.bump", AggregateRef::new("a", "cards", 1), ())],
                0,
            )
            .await
            .unwrap();

        let (inner, _) = tally_handler();
        let healer = EntityHealer::new(inner, store);

        let err = healer.handle_event(&bump("a", 2)).await.unwrap_err();
        assert!(err.is_incorrect_version());
    }

    #[tokio::test]
    async fn other_errors_pass_through_untouched() {
        let (inner, _) = tally_handler();
        let healer = EntityHealer::new(inner, Arc::new(InMemoryEventStore::new()));

        let record = EventRecord::new("tally.bump", AggregateRef::new("a", "cards", 1), ());
        assert!(matches!(
            healer.handle_event(&record).await,
            Err(ProjectionError::MismatchedAggregateType { .. })
        ));
    }
}
