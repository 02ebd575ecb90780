use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use super::projector::{ProjectionError, ProjectionHandler};
use crate::event_store::EventStore;

/// Rebuilds the read models of one aggregate on demand.
///
/// Projections register under their aggregate type; `regenerate` drops every
/// read model registered for that type and replays the aggregate's history
/// through each of them.
pub struct ReadModelRegenerator<S> {
    events: S,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn ProjectionHandler>>>>,
}

impl<S: EventStore> ReadModelRegenerator<S> {
    pub fn new(events: S) -> Self {
        Self {
            events,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, handler: Arc<dyn ProjectionHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers
            .entry(handler.aggregate_type().to_string())
            .or_default()
            .push(handler);
    }

    /// Returns the number of events replayed.
    pub async fn regenerate(&self, aggregate_type: &str, id: &str) -> Result<usize, ProjectionError> {
        let handlers = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            handlers.get(aggregate_type).cloned().unwrap_or_default()
        };
        if handlers.is_empty() {
            return Err(ProjectionError::NoProjectors {
                aggregate_type: aggregate_type.to_string(),
            });
        }

        let records = self.events.load(id).await?;
        if let Some(foreign) = records.iter().find(|r| r.aggregate().name != aggregate_type) {
            return Err(ProjectionError::MismatchedAggregateType {
                expected: aggregate_type.to_string(),
                found: foreign.aggregate().name.clone(),
            });
        }

        for handler in &handlers {
            handler.remove(id).await?;
        }
        for record in &records {
            for handler in &handlers {
                handler.handle_event(record).await?;
            }
        }

        info!(
            aggregate_type,
            id,
            events = records.len(),
            read_models = handlers.len(),
            "read models regenerated"
        );
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::read_model::ReadRepository;
    use crate::read_model::in_memory::tests::tally;
    use crate::read_model::projector::tests::{bump, tally_handler};

    #[tokio::test]
    async fn rebuilds_every_registered_read_model() {
        let store = Arc::new(InMemoryEventStore::new());
        store
            .append((1..=2).map(|v| bump("a", v)).collect(), 0)
            .await
            .unwrap();

        let regenerator = ReadModelRegenerator::new(store);
        let (first, first_models) = tally_handler();
        let (second, second_models) = tally_handler();
        regenerator.register(first);
        regenerator.register(second);

        // A corrupted model is replaced.
        first_models.save(tally("a", 7)).await.unwrap();

        assert_eq!(regenerator.regenerate("loans", "a").await.unwrap(), 2);
        assert_eq!(first_models.find("a").await.unwrap().events.len(), 2);
        assert_eq!(second_models.find("a").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn unknown_types_and_foreign_histories_are_rejected() {
        let store = Arc::new(InMemoryEventStore::new());
        store.append(vec![bump("a", 1)], 0).await.unwrap();

        let regenerator = ReadModelRegenerator::new(store);
        assert!(matches!(
            regenerator.regenerate("loans", "a").await,
            Err(ProjectionError::NoProjectors { .. })
        ));

        let (handler, _) = tally_handler();
        regenerator.register(handler);
        let cards: Arc<dyn ProjectionHandler> = Arc::new(CardsOnly);
        regenerator.register(cards);
        assert!(matches!(
            regenerator.regenerate("cards", "a").await,
            Err(ProjectionError::MismatchedAggregateType { .. })
        ));
    }

    struct CardsOnly;

    #[async_trait::async_trait]
    impl ProjectionHandler for CardsOnly {
        fn aggregate_type(&self) -> &str {
            "cards"
        }

        async fn handle_event(&self, _: &chronicle_events::EventRecord) -> Result<(), ProjectionError> {
            Ok(())
        }

        async fn remove(&self, _: &str) -> Result<(), ProjectionError> {
            Ok(())
        }
    }
}
