//! Ordered pub/sub transport boundary.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub type Attributes = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("topic {0} not found")]
    TopicNotFound(String),

    #[error("subscription {0} not found")]
    SubscriptionNotFound(String),

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("transport closed")]
    Closed,

    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// A message handed to the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub data: Vec<u8>,
    /// Messages sharing a non-empty key are delivered in publish order, if
    /// ordering is enabled on the topic.
    pub ordering_key: String,
    pub attributes: Attributes,
}

/// Settles a delivered message: `true` acks, `false` nacks.
pub type Settle = Box<dyn FnOnce(bool) + Send + Sync + 'static>;

/// A delivered message awaiting ack or nack.
///
/// Dropping it unsettled counts as a nack, so the transport redelivers.
pub struct InboundMessage {
    id: String,
    message: OutboundMessage,
    delivery_attempt: u32,
    settle: Option<Settle>,
}

impl InboundMessage {
    pub fn new(id: impl Into<String>, message: OutboundMessage, delivery_attempt: u32, settle: Settle) -> Self {
        Self {
            id: id.into(),
            message,
            delivery_attempt,
            settle: Some(settle),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.message.data
    }

    pub fn ordering_key(&self) -> &str {
        &self.message.ordering_key
    }

    pub fn attributes(&self) -> &Attributes {
        &self.message.attributes
    }

    /// 1 on first delivery, incremented on every redelivery.
    pub fn delivery_attempt(&self) -> u32 {
        self.delivery_attempt
    }

    /// The message as it was published, e.g. to forward it elsewhere.
    pub fn to_outbound(&self) -> OutboundMessage {
        self.message.clone()
    }

    /// Processing succeeded; the transport forgets the message.
    pub fn ack(mut self) {
        if let Some(settle) = self.settle.take() {
            settle(true);
        }
    }

    /// Processing failed; the transport redelivers the message.
    pub fn nack(mut self) {
        if let Some(settle) = self.settle.take() {
            settle(false);
        }
    }
}

impl Drop for InboundMessage {
    fn drop(&mut self) {
        if let Some(settle) = self.settle.take() {
            settle(false);
        }
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("id", &self.id)
            .field("ordering_key", &self.message.ordering_key)
            .field("attributes", &self.message.attributes)
            .field("delivery_attempt", &self.delivery_attempt)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    /// Honor ordering keys on this topic from now on.
    fn enable_message_ordering(&self);

    /// Publish and wait for the transport to accept the message. Returns the
    /// transport-assigned message id.
    async fn publish(&self, message: OutboundMessage) -> Result<String, TransportError>;
}

#[async_trait]
pub trait PullSubscription: Send + Sync {
    fn name(&self) -> &str;

    /// Wait for the next deliverable message. `None` once the subscription
    /// is closed.
    ///
    /// Cancel-safe: dropping the future never loses a message.
    async fn pull(&self) -> Result<Option<InboundMessage>, TransportError>;
}

/// Looks up topics and subscriptions by name.
pub trait PubSubClient: Send + Sync {
    fn topic(&self, name: &str) -> Result<Arc<dyn Topic>, TransportError>;

    fn subscription(&self, name: &str) -> Result<Arc<dyn PullSubscription>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorded() -> (Arc<Mutex<Vec<bool>>>, Settle) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (log, Box::new(move |acked| sink.lock().unwrap().push(acked)))
    }

    #[test]
    fn settles_exactly_once() {
        let (log, settle) = recorded();
        InboundMessage::new("1", OutboundMessage::default(), 1, settle).ack();

        let (dropped, settle) = recorded();
        drop(InboundMessage::new("2", OutboundMessage::default(), 1, settle));

        assert_eq!(*log.lock().unwrap(), vec![true]);
        assert_eq!(*dropped.lock().unwrap(), vec![false]);
    }
}
