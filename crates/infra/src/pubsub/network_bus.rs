use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use chronicle_events::{
    BusError, Codec, EventBus, EventHandler, EventRecord, LocalBus, LocalBusConfig, PublishOptions, Publisher,
    Subscriber, SubscriptionId,
};

use super::publisher::{PubSubPublisher, PublisherConfig};
use super::pull_adapter::{PullAdapter, PullAdapterConfig};
use super::transport::{PubSubClient, TransportError};

/// Event bus spanning processes.
///
/// Publishing goes to the pub/sub topic. Subscriptions live on a local bus,
/// which the pull adapter feeds from the subscription, so handlers see every
/// event published to the topic, including this process's own.
pub struct NetworkEventBus {
    publisher: PubSubPublisher,
    local: Arc<LocalBus<EventRecord>>,
    adapter: PullAdapter,
}

impl NetworkEventBus {
    pub fn connect(
        client: &dyn PubSubClient,
        codec: Arc<dyn Codec>,
        publisher: PublisherConfig,
        adapter: PullAdapterConfig,
        local: LocalBusConfig,
    ) -> Result<Self, TransportError> {
        let local = Arc::new(LocalBus::new(local));
        let adapter = PullAdapter::connect(client, local.clone(), codec.clone(), adapter)?;
        let publisher = PubSubPublisher::connect(client, codec, publisher)?;
        Ok(Self {
            publisher,
            local,
            adapter,
        })
    }
}

#[async_trait]
impl Publisher<EventRecord> for NetworkEventBus {
    async fn publish(&self, record: EventRecord, options: PublishOptions) -> Result<(), BusError> {
        if !self.is_running() {
            return Err(options.reject(|| BusError::NotRunning));
        }
        self.publisher.publish(record, options).await
    }
}

impl Subscriber<EventRecord> for NetworkEventBus {
    fn subscribe(&self, name: &str, handler: EventHandler<EventRecord>) -> Result<SubscriptionId, BusError> {
        self.local.subscribe(name, handler)
    }

    fn unsubscribe(&self, name: &str, id: SubscriptionId) -> bool {
        self.local.unsubscribe(name, id)
    }
}

#[async_trait]
impl EventBus<EventRecord> for NetworkEventBus {
    /// Local bus first, then the pull adapter. Nothing is left running when
    /// this fails.
    fn start(&self) -> Result<(), BusError> {
        self.adapter.start_after(|| self.local.start())?;
        info!(topic = self.publisher.topic(), "network event bus started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        self.adapter.stop().await?;
        self.local.stop().await?;
        info!(topic = self.publisher.topic(), "network event bus stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.local.is_running() && self.adapter.is_running()
    }
}
