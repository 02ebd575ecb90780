//! In-process pub/sub emulator with ordering keys, ack/nack and redelivery.
//!
//! Behaves like a managed ordered broker, close enough for tests and local
//! development:
//!
//! - a subscription only receives messages published after it was created
//! - ordering keys are honored only on topics with ordering enabled; while a
//!   message of a key is outstanding, later messages of that key are held back
//! - a nacked (or dropped) message goes back to the front of the queue and is
//!   redelivered with its delivery attempt incremented

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::transport::{
    InboundMessage, OutboundMessage, PubSubClient, PullSubscription, Topic, TransportError,
};

#[derive(Default)]
pub struct InMemoryPubSub {
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    topics: HashMap<String, Arc<EmulatorTopic>>,
    subscriptions: HashMap<String, Arc<EmulatorSubscription>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, name: &str) -> Result<Arc<EmulatorTopic>, TransportError> {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if registry.topics.contains_key(name) {
            return Err(TransportError::AlreadyExists {
                kind: "topic",
                name: name.to_string(),
            });
        }
        let topic = Arc::new(EmulatorTopic {
            name: name.to_string(),
            ordering: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });
        registry.topics.insert(name.to_string(), topic.clone());
        Ok(topic)
    }

    pub fn create_subscription(&self, name: &str, topic: &str) -> Result<Arc<EmulatorSubscription>, TransportError> {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if registry.subscriptions.contains_key(name) {
            return Err(TransportError::AlreadyExists {
                kind: "subscription",
                name: name.to_string(),
            });
        }
        let topic = registry
            .topics
            .get(topic)
            .cloned()
            .ok_or_else(|| TransportError::TopicNotFound(topic.to_string()))?;

        let queue = Arc::new(Queue::default());
        topic
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(queue.clone());

        let subscription = Arc::new(EmulatorSubscription {
            name: name.to_string(),
            queue,
        });
        registry.subscriptions.insert(name.to_string(), subscription.clone());
        Ok(subscription)
    }

    /// Close every subscription; pending pulls return `None`.
    pub fn close(&self) {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        for subscription in registry.subscriptions.values() {
            subscription.queue.close();
        }
    }
}

impl PubSubClient for InMemoryPubSub {
    fn topic(&self, name: &str) -> Result<Arc<dyn Topic>, TransportError> {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry
            .topics
            .get(name)
            .map(|topic| topic.clone() as Arc<dyn Topic>)
            .ok_or_else(|| TransportError::TopicNotFound(name.to_string()))
    }

    fn subscription(&self, name: &str) -> Result<Arc<dyn PullSubscription>, TransportError> {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry
            .subscriptions
            .get(name)
            .map(|subscription| subscription.clone() as Arc<dyn PullSubscription>)
            .ok_or_else(|| TransportError::SubscriptionNotFound(name.to_string()))
    }
}

pub struct EmulatorTopic {
    name: String,
    ordering: AtomicBool,
    subscriptions: Mutex<Vec<Arc<Queue>>>,
    next_id: AtomicU64,
}

impl EmulatorTopic {
    pub fn ordering_enabled(&self) -> bool {
        self.ordering.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Topic for EmulatorTopic {
    fn name(&self) -> &str {
        &self.name
    }

    fn enable_message_ordering(&self) {
        self.ordering.store(true, Ordering::Release);
    }

    async fn publish(&self, message: OutboundMessage) -> Result<String, TransportError> {
        let id = format!("{}-{}", self.name, self.next_id.fetch_add(1, Ordering::Relaxed));
        let ordered_key = (self.ordering_enabled() && !message.ordering_key.is_empty())
            .then(|| message.ordering_key.clone());

        let subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        for queue in subscriptions.iter() {
            queue.push(Pending {
                id: id.clone(),
                message: message.clone(),
                ordered_key: ordered_key.clone(),
                attempts: 0,
            });
        }
        Ok(id)
    }
}

pub struct EmulatorSubscription {
    name: String,
    queue: Arc<Queue>,
}

impl EmulatorSubscription {
    /// Messages not yet acked: queued plus delivered-but-unsettled.
    pub fn backlog(&self) -> usize {
        let state = self.queue.lock();
        state.pending.len() + state.in_flight
    }
}

#[async_trait]
impl PullSubscription for EmulatorSubscription {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull(&self) -> Result<Option<InboundMessage>, TransportError> {
        loop {
            // Registered before checking, so a push in between still wakes us.
            let notified = self.queue.notify.notified();
            {
                let mut state = self.queue.lock();
                if state.closed {
                    return Ok(None);
                }
                if let Some(pending) = state.take_next() {
                    drop(state);
                    return Ok(Some(self.queue.deliver(pending)));
                }
            }
            notified.await;
        }
    }
}

#[derive(Clone)]
struct Pending {
    id: String,
    message: OutboundMessage,
    ordered_key: Option<String>,
    attempts: u32,
}

#[derive(Default)]
struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    outstanding_keys: HashSet<String>,
    in_flight: usize,
    closed: bool,
}

impl QueueState {
    /// First message whose ordering key is not held by an outstanding one.
    fn take_next(&mut self) -> Option<Pending> {
        let index = self.pending.iter().position(|p| match &p.ordered_key {
            Some(key) => !self.outstanding_keys.contains(key),
            None => true,
        })?;
        let mut pending = self.pending.remove(index)?;
        if let Some(key) = &pending.ordered_key {
            self.outstanding_keys.insert(key.clone());
        }
        pending.attempts += 1;
        self.in_flight += 1;
        Some(pending)
    }
}

impl Queue {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, pending: Pending) {
        self.lock().pending.push_back(pending);
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn deliver(self: &Arc<Self>, pending: Pending) -> InboundMessage {
        let queue = Arc::clone(self);
        let id = pending.id.clone();
        let message = pending.message.clone();
        let attempt = pending.attempts;
        InboundMessage::new(
            id,
            message,
            attempt,
            Box::new(move |acked| queue.settle(pending, acked)),
        )
    }

    fn settle(&self, pending: Pending, acked: bool) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if let Some(key) = &pending.ordered_key {
                state.outstanding_keys.remove(key);
            }
            if !acked {
                state.pending.push_front(pending);
            }
        }
        self.notify.notify_waiters();
    }
}
