//! Concurrent fan-out of one event to every subscribed handler.
//!
//! Unlike the [`crate::LocalBus`] worker, [`Broker::handle`] runs all handlers
//! for an event at the same time and waits for every one of them. Failures do
//! not short-circuit: each handler runs to completion and all errors come back
//! together in [`BrokerError::Handlers`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::warn;

use crate::bus::{BusEvent, Publisher, Subscriber, SubscriptionId};
use crate::envelope::PublishOptions;
use crate::error::{BrokerError, BusError};
use crate::handler::{EventHandler, invoke};
use crate::registry::HandlerRegistry;

pub struct Broker<E> {
    registry: Arc<HandlerRegistry<E>>,
}

impl<E> Default for Broker<E> {
    fn default() -> Self {
        Self {
            registry: Arc::new(HandlerRegistry::new()),
        }
    }
}

/// Undoes one [`Broker::subscribe_many`] call.
#[must_use = "dropping an Unsubscriber keeps the subscriptions active"]
pub struct Unsubscriber<E> {
    registry: Arc<HandlerRegistry<E>>,
    subscriptions: Vec<(String, SubscriptionId)>,
}

impl<E> Unsubscriber<E> {
    pub fn subscriptions(&self) -> &[(String, SubscriptionId)] {
        &self.subscriptions
    }

    pub fn unsubscribe(self) {
        for (name, id) in &self.subscriptions {
            self.registry.unsubscribe(name, *id);
        }
    }
}

impl<E: BusEvent> Broker<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under every name in `names`, atomically.
    ///
    /// Duplicate names are rejected up front. If any single registration
    /// fails, the ones already made by this call are removed again.
    pub fn subscribe_many(
        &self,
        handler: EventHandler<E>,
        names: &[&str],
    ) -> Result<Unsubscriber<E>, BrokerError> {
        let unique: HashSet<&str> = names.iter().map(|n| n.trim()).collect();
        if unique.len() != names.len() {
            return Err(BrokerError::DuplicateNames(
                names.iter().map(|n| n.to_string()).collect(),
            ));
        }

        let mut made = Unsubscriber {
            registry: self.registry.clone(),
            subscriptions: Vec::with_capacity(names.len()),
        };

        for name in names {
            match self.registry.subscribe(name, handler.clone()) {
                Ok(id) => made.subscriptions.push((name.trim().to_string(), id)),
                Err(err) => {
                    made.unsubscribe();
                    return Err(BrokerError::Subscribe(err));
                }
            }
        }

        Ok(made)
    }

    /// Run every handler subscribed to the event concurrently.
    ///
    /// An event nobody subscribed to is not an error here.
    pub async fn handle(&self, event: &E) -> Result<(), BrokerError> {
        let handlers = self.registry.handlers(event.event_name());

        let outcomes = join_all(handlers.iter().map(|handler| invoke(handler, event.clone()))).await;

        let errors: Vec<BusError> = outcomes.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            return Ok(());
        }

        warn!(
            event = event.event_name(),
            id = %event.event_id(),
            failed = errors.len(),
            total = handlers.len(),
            "errors while processing event"
        );
        Err(BrokerError::Handlers {
            event: event.event_name().to_string(),
            errors,
        })
    }
}

/// Publishing through a broker handles the event inline.
///
/// The outcome goes to the acknowledgment if one was supplied. Events with no
/// subscriber report [`BusError::UnhandledEvent`], like the local bus does.
#[async_trait]
impl<E: BusEvent> Publisher<E> for Broker<E> {
    async fn publish(&self, event: E, options: PublishOptions) -> Result<(), BusError> {
        let outcome = if self.registry.has_handlers(event.event_name()) {
            self.handle(&event).await.map_err(BusError::from)
        } else {
            Err(BusError::UnhandledEvent {
                name: event.event_name().to_string(),
                id: event.event_id(),
            })
        };
        options.settle(outcome)
    }
}

impl<E: BusEvent> Subscriber<E> for Broker<E> {
    fn subscribe(&self, name: &str, handler: EventHandler<E>) -> Result<SubscriptionId, BusError> {
        self.registry.subscribe(name, handler)
    }

    fn unsubscribe(&self, name: &str, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(name, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::record::{AggregateRef, EventRecord};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn event(name: &str) -> EventRecord {
        EventRecord::new(name, AggregateRef::default(), ())
    }

    fn counting(counter: &Arc<AtomicUsize>) -> EventHandler<EventRecord> {
        let counter = counter.clone();
        handler_fn(move |_: EventRecord| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn every_handler_runs_despite_failures() {
        let broker = Broker::<EventRecord>::new();
        let ok = Arc::new(AtomicUsize::new(0));

        broker
            .subscribe("settled", handler_fn(|_: EventRecord| async { Err::<(), _>(anyhow::anyhow!("first failed")) }))
            .unwrap();
        broker
            .subscribe(
                "settled",
                handler_fn(|_: EventRecord| async {
                    let missing: Option<()> = None;
                    missing.expect("second panicked");
                    Ok(())
                }),
            )
            .unwrap();
        broker.subscribe("settled", counting(&ok)).unwrap();

        let err = broker.handle(&event("settled")).await.unwrap_err();
        match err {
            BrokerError::Handlers { event, errors } => {
                assert_eq!(event, "settled");
                assert_eq!(errors.len(), 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(ok.load(Ordering::SeqCst), 1);

        // The broker keeps working afterwards.
        assert!(broker.handle(&event("settled")).await.is_err());
        assert_eq!(ok.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handlers_run_concurrently() {
        let broker = Broker::<EventRecord>::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            broker
                .subscribe(
                    "tick",
                    handler_fn(move |_: EventRecord| {
                        let in_flight = in_flight.clone();
                        let peak = peak.clone();
                        async move {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                )
                .unwrap();
        }

        broker.handle(&event("tick")).await.unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn subscribe_many_registers_under_each_name() {
        let broker = Broker::<EventRecord>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let unsubscriber = broker
            .subscribe_many(counting(&calls), &["opened", "closed"])
            .unwrap();
        broker.handle(&event("opened")).await.unwrap();
        broker.handle(&event("closed")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        unsubscriber.unsubscribe();
        broker.handle(&event("opened")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_subscription_rolls_back_earlier_names() {
        let broker = Broker::<EventRecord>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let err = broker
            .subscribe_many(counting(&calls), &["opened", "  "])
            .err()
            .unwrap();
        assert!(matches!(err, BrokerError::Subscribe(BusError::EmptyEventName)));
        assert!(!broker.registry.has_handlers("opened"));

        let err = broker
            .subscribe_many(counting(&calls), &["opened", "opened"])
            .err()
            .unwrap();
        assert!(matches!(err, BrokerError::DuplicateNames(_)));
        assert!(!broker.registry.has_handlers("opened"));
    }

    #[tokio::test]
    async fn publish_reports_through_the_ack() {
        let broker = Broker::<EventRecord>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        broker
            .publish(
                event("nobody"),
                PublishOptions::new().with_ack(move |o| sink.lock().unwrap().push(o.is_ok())),
            )
            .await
            .unwrap();

        broker
            .subscribe("known", handler_fn(|_: EventRecord| async { Ok(()) }))
            .unwrap();
        let sink = seen.clone();
        broker
            .publish(
                event("known"),
                PublishOptions::new().with_ack(move |o| sink.lock().unwrap().push(o.is_ok())),
            )
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
        assert!(broker.publish(event("nobody"), PublishOptions::new()).await.is_err());
    }
}
