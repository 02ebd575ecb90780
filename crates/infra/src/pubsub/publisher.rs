use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, info};

use chronicle_events::{BusError, Codec, EventRecord, PublishOptions, Publisher};

use super::attributes;
use super::transport::{OutboundMessage, PubSubClient, Topic, TransportError};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub topic_name: String,
    /// Log every published message with its publish latency.
    pub log_messages: bool,
}

impl PublisherConfig {
    pub fn new(topic_name: impl Into<String>) -> Self {
        Self {
            topic_name: topic_name.into(),
            log_messages: false,
        }
    }

    pub fn with_log_messages(mut self) -> Self {
        self.log_messages = true;
        self
    }
}

/// Publishes event records to a pub/sub topic.
///
/// The payload goes through the codec, the rest of the record travels as
/// attributes. The ordering key is the aggregate id, so the events of one
/// aggregate reach subscribers in the order they were published.
pub struct PubSubPublisher {
    topic: Arc<dyn Topic>,
    codec: Arc<dyn Codec>,
    config: PublisherConfig,
}

impl PubSubPublisher {
    /// Look up the configured topic and turn on message ordering for it.
    pub fn connect(
        client: &dyn PubSubClient,
        codec: Arc<dyn Codec>,
        config: PublisherConfig,
    ) -> Result<Self, TransportError> {
        let topic = client.topic(&config.topic_name)?;
        topic.enable_message_ordering();
        Ok(Self { topic, codec, config })
    }

    pub fn topic(&self) -> &str {
        self.topic.name()
    }

    async fn send(&self, record: &EventRecord) -> Result<String, BusError> {
        let data = self
            .codec
            .marshal_record(record)
            .map_err(|err| BusError::publish_failed(record.name(), err))?;
        let message = OutboundMessage {
            data,
            ordering_key: record.aggregate().id.clone(),
            attributes: attributes::encode(record),
        };
        self.topic
            .publish(message)
            .await
            .map_err(|err| BusError::publish_failed(record.name(), err))
    }
}

#[async_trait]
impl Publisher<EventRecord> for PubSubPublisher {
    /// Returns once the transport accepted the message. An acknowledgment
    /// callback in `options` receives the same outcome.
    async fn publish(&self, record: EventRecord, options: PublishOptions) -> Result<(), BusError> {
        let started = Instant::now();
        let outcome = match self.send(&record).await {
            Ok(message_id) => {
                if self.config.log_messages {
                    info!(
                        topic = self.topic.name(),
                        event = record.name(),
                        id = %record.id(),
                        aggregate_id = %record.aggregate().id,
                        message_id = %message_id,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "event published"
                    );
                } else {
                    debug!(topic = self.topic.name(), event = record.name(), message_id = %message_id, "event published");
                }
                Ok(())
            }
            Err(err) => {
                error!(topic = self.topic.name(), event = record.name(), error = %err, "publish failed");
                Err(err)
            }
        };
        options.settle(outcome)
    }
}
