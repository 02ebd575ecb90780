//! In-process asynchronous event bus.
//!
//! A [`LocalBus`] owns a bounded queue and a single dispatch task:
//!
//! - `publish` enqueues and returns (it only blocks while the queue is full)
//! - the worker takes one envelope at a time and runs the handlers subscribed
//!   to its name, in registration order
//! - the first failing handler stops the chain for that event (the remaining
//!   handlers are skipped) and its error is what the acknowledgment receives
//! - handler panics are contained; the worker always moves on to the next
//!   event
//!
//! The bus starts stopped. `start`/`stop` flip an atomic flag with
//! compare-and-swap, so a second `start` fails with `AlreadyRunning` and a
//! second `stop` with `NotRunning`. A stopped bus can be started again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{BusEvent, EventBus, Publisher, Subscriber, SubscriptionId};
use crate::envelope::{AckCallback, DeliveryResult, Envelope, PublishOptions};
use crate::error::BusError;
use crate::handler::{EventHandler, invoke};
use crate::registry::HandlerRegistry;

/// Default queue capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LocalBusConfig {
    /// Capacity of the dispatch queue; `publish` waits when it is full.
    pub buffer_size: usize,
}

impl Default for LocalBusConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl LocalBusConfig {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

struct Worker<E> {
    sender: mpsc::Sender<Envelope<E>>,
    handle: JoinHandle<()>,
}

pub struct LocalBus<E: BusEvent> {
    config: LocalBusConfig,
    registry: Arc<HandlerRegistry<E>>,
    running: AtomicBool,
    worker: Mutex<Option<Worker<E>>>,
}

impl<E: BusEvent> LocalBus<E> {
    pub fn new(config: LocalBusConfig) -> Self {
        Self {
            config,
            registry: Arc::new(HandlerRegistry::new()),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LocalBusConfig {
        &self.config
    }

    fn sender(&self) -> Option<mpsc::Sender<Envelope<E>>> {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        worker.as_ref().map(|w| w.sender.clone())
    }
}

impl<E: BusEvent> Default for LocalBus<E> {
    fn default() -> Self {
        Self::new(LocalBusConfig::default())
    }
}

#[async_trait]
impl<E: BusEvent> Publisher<E> for LocalBus<E> {
    async fn publish(&self, event: E, mut options: PublishOptions) -> Result<(), BusError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(options.reject(|| BusError::NotRunning));
        }
        let Some(sender) = self.sender() else {
            return Err(options.reject(|| BusError::NotRunning));
        };

        // Reserve room first: the envelope only exists once the event is
        // guaranteed to enter the queue. Before that, failures settle the
        // acknowledgment directly.
        let deadline = options.deadline;
        let reserved = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, sender.reserve()).await {
                Ok(reserved) => reserved,
                Err(_) => {
                    debug!(?deadline, "no room in the event queue before the deadline");
                    return Err(options.reject(|| BusError::Cancelled));
                }
            },
            None => sender.reserve().await,
        };
        let Ok(permit) = reserved else {
            return Err(options.reject(|| BusError::NotRunning));
        };

        let user_ack = options.take_ack();
        let (ack, waiter): (Option<AckCallback>, _) = if options.wait {
            let (tx, rx) = oneshot::channel::<DeliveryResult>();
            let ack: AckCallback = match user_ack {
                Some(user_ack) => Box::new(move |outcome| {
                    user_ack(outcome);
                    let _ = tx.send(Ok(()));
                }),
                None => Box::new(move |outcome| {
                    let _ = tx.send(outcome);
                }),
            };
            (Some(ack), Some(rx))
        } else {
            (user_ack, None)
        };

        permit.send(Envelope::new(event, ack));

        match waiter {
            Some(rx) => rx.await.unwrap_or(Err(BusError::Cancelled)),
            None => Ok(()),
        }
    }
}

impl<E: BusEvent> Subscriber<E> for LocalBus<E> {
    fn subscribe(&self, name: &str, handler: EventHandler<E>) -> Result<SubscriptionId, BusError> {
        self.registry.subscribe(name, handler)
    }

    fn unsubscribe(&self, name: &str, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(name, id)
    }
}

#[async_trait]
impl<E: BusEvent> EventBus<E> for LocalBus<E> {
    fn start(&self) -> Result<(), BusError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BusError::AlreadyRunning);
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.running.store(false, Ordering::Release);
            return Err(BusError::NoRuntime);
        };

        let (sender, receiver) = mpsc::channel(self.config.buffer_size.max(1));
        let handle = runtime.spawn(run(self.registry.clone(), receiver));

        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        *worker = Some(Worker { sender, handle });
        info!(buffer_size = self.config.buffer_size, "local event bus started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BusError::NotRunning);
        }

        let worker = {
            let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            worker.take()
        };

        if let Some(Worker { sender, handle }) = worker {
            // Closing our sender lets the worker drain the queue and exit.
            drop(sender);
            if let Err(err) = handle.await {
                error!(error = %err, "local event bus worker terminated abnormally");
            }
        }

        info!("local event bus stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

async fn run<E: BusEvent>(registry: Arc<HandlerRegistry<E>>, mut receiver: mpsc::Receiver<Envelope<E>>) {
    while let Some(envelope) = receiver.recv().await {
        let outcome = dispatch(&registry, &envelope.event).await;
        envelope.acknowledge(outcome);
    }
    debug!("local event bus queue closed");
}

async fn dispatch<E: BusEvent>(registry: &HandlerRegistry<E>, event: &E) -> DeliveryResult {
    let handlers = registry.handlers(event.event_name());
    if handlers.is_empty() {
        warn!(
            event = event.event_name(),
            id = %event.event_id(),
            "no handlers subscribed to event"
        );
        return Err(BusError::UnhandledEvent {
            name: event.event_name().to_string(),
            id: event.event_id(),
        });
    }

    debug!(event = event.event_name(), id = %event.event_id(), handlers = handlers.len(), "dispatching event");
    for handler in &handlers {
        invoke(handler, event.clone()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::record::{AggregateRef, EventRecord};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn event(name: &str, seq: u32) -> EventRecord {
        EventRecord::new(name, AggregateRef::default(), seq)
    }

    fn started() -> LocalBus<EventRecord> {
        let bus = LocalBus::new(LocalBusConfig::default().with_buffer_size(8));
        bus.start().unwrap();
        bus
    }

    #[tokio::test]
    async fn publish_fails_when_not_running() {
        let bus = LocalBus::<EventRecord>::default();
        let err = bus.publish(event("a", 1), PublishOptions::new()).await.unwrap_err();
        assert!(matches!(err, BusError::NotRunning));

        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let err = bus
            .publish(
                event("a", 2),
                PublishOptions::new().with_ack(move |outcome| sink.lock().unwrap().push(outcome)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotRunning));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Err(BusError::NotRunning)));
    }

    #[tokio::test]
    async fn lifecycle_is_guarded() {
        let bus = started();
        assert!(matches!(bus.start(), Err(BusError::AlreadyRunning)));
        bus.stop().await.unwrap();
        assert!(matches!(bus.stop().await, Err(BusError::NotRunning)));

        // Restartable.
        bus.start().unwrap();
        assert!(bus.is_running());
        bus.stop().await.unwrap();
    }

    #[test]
    fn start_requires_a_runtime() {
        let bus = LocalBus::<EventRecord>::default();
        assert!(matches!(bus.start(), Err(BusError::NoRuntime)));
        assert!(!bus.is_running());
    }

    #[tokio::test]
    async fn events_are_dispatched_one_at_a_time_in_order() {
        let bus = started();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        bus.subscribe(
            "step",
            handler_fn(move |record: EventRecord| {
                let sink = sink.clone();
                async move {
                    let seq = *record.data::<u32>().unwrap();
                    sink.lock().unwrap().push(format!("begin {seq}"));
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    sink.lock().unwrap().push(format!("end {seq}"));
                    Ok(())
                }
            }),
        )
        .unwrap();

        bus.publish(event("step", 1), PublishOptions::new()).await.unwrap();
        bus.publish(event("step", 2), PublishOptions::new()).await.unwrap();
        bus.stop().await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["begin 1", "end 1", "begin 2", "end 2"]
        );
    }

    #[tokio::test]
    async fn unhandled_event_is_reported_once_to_the_ack() {
        let bus = started();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();

        let published = event("nobody.listens", 1);
        let id = published.id();
        bus.publish(
            published,
            PublishOptions::new().with_ack(move |outcome| sink.lock().unwrap().push(outcome)),
        )
        .await
        .unwrap();

        // Without an ack nothing is observable.
        bus.publish(event("nobody.listens", 2), PublishOptions::new())
            .await
            .unwrap();
        bus.stop().await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            Err(BusError::UnhandledEvent { name, id: got }) => {
                assert_eq!(name, "nobody.listens");
                assert_eq!(*got, id);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_failure_skips_remaining_handlers_but_not_next_events() {
        let bus = started();
        let later = Arc::new(AtomicUsize::new(0));

        let first_calls = Arc::new(AtomicUsize::new(0));
        let counter = first_calls.clone();
        bus.subscribe(
            "work",
            handler_fn(move |record: EventRecord| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::ensure!(*record.data::<u32>().unwrap() != 1, "rejecting first");
                    Ok(())
                }
            }),
        )
        .unwrap();
        let counter = later.clone();
        bus.subscribe(
            "work",
            handler_fn(move |_: EventRecord| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

        let first = bus
            .publish(event("work", 1), PublishOptions::new().with_wait())
            .await;
        assert!(matches!(first, Err(BusError::Handler { .. })));

        let second = bus
            .publish(event("work", 2), PublishOptions::new().with_wait())
            .await;
        assert!(second.is_ok());

        bus.stop().await.unwrap();
        assert_eq!(first_calls.load(Ordering::SeqCst), 2);
        assert_eq!(later.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_bus() {
        let bus = started();
        let survived = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            "fragile",
            handler_fn(|record: EventRecord| async move {
                if *record.data::<u32>().unwrap() == 1 {
                    panic!("handler blew up");
                }
                Ok(())
            }),
        )
        .unwrap();
        let counter = survived.clone();
        bus.subscribe(
            "other",
            handler_fn(move |_: EventRecord| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

        let (tx, rx) = oneshot::channel();
        bus.publish(event("fragile", 1), PublishOptions::new().with_ack_channel(tx))
            .await
            .unwrap();
        assert!(matches!(rx.await.unwrap(), Err(BusError::HandlerPanicked { .. })));

        bus.publish(event("fragile", 2), PublishOptions::new().with_wait())
            .await
            .unwrap();
        bus.publish(event("other", 3), PublishOptions::new().with_wait())
            .await
            .unwrap();
        bus.stop().await.unwrap();

        assert_eq!(survived.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_with_ack_reports_through_the_callback() {
        let bus = started();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();

        let result = bus
            .publish(
                event("unknown", 1),
                PublishOptions::new()
                    .with_wait()
                    .with_ack(move |outcome| *sink.lock().unwrap() = Some(outcome.is_err())),
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(*seen.lock().unwrap(), Some(true));
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn deadline_bounds_the_wait_for_queue_space() {
        let bus = LocalBus::new(LocalBusConfig::default().with_buffer_size(1));
        bus.start().unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        bus.subscribe(
            "slow",
            handler_fn(move |_: EventRecord| {
                let release_rx = release_rx.clone();
                async move {
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                    Ok(())
                }
            }),
        )
        .unwrap();

        // First event occupies the worker, second fills the queue.
        bus.publish(event("slow", 1), PublishOptions::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.publish(event("slow", 2), PublishOptions::new()).await.unwrap();

        let err = bus
            .publish(
                event("slow", 3),
                PublishOptions::new().with_deadline(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Cancelled));

        let _ = release_tx.send(());
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn deadline_hit_still_acknowledges_once() {
        let bus = LocalBus::new(LocalBusConfig::default().with_buffer_size(1));
        bus.start().unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        bus.subscribe(
            "slow",
            handler_fn(move |_: EventRecord| {
                let release_rx = release_rx.clone();
                async move {
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                    Ok(())
                }
            }),
        )
        .unwrap();

        bus.publish(event("slow", 1), PublishOptions::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.publish(event("slow", 2), PublishOptions::new()).await.unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let err = bus
            .publish(
                event("slow", 3),
                PublishOptions::new()
                    .with_deadline(Duration::from_millis(20))
                    .with_ack(move |outcome| sink.lock().unwrap().push(outcome)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Cancelled));

        let _ = release_tx.send(());
        bus.stop().await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Err(BusError::Cancelled)));
    }
}
