//! Pulls events from a subscription and feeds them to a local publisher.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Semaphore, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use chronicle_events::{BusError, Codec, CodecError, EventRecord, PublishOptions, Publisher};

use super::attributes::{self, ParseError};
use super::transport::{InboundMessage, PubSubClient, PullSubscription, Topic, TransportError};

const PULL_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PullAdapterConfig {
    pub subscription_name: String,
    /// Messages processed concurrently. Messages sharing an ordering key are
    /// still processed one at a time, since the transport holds back the next
    /// one until the current one is settled.
    pub max_outstanding: usize,
    /// Delivery attempt from which a failing message is dead-lettered.
    /// `0` disables dead-lettering.
    pub max_delivery_attempts: u32,
    pub dead_letter_topic: Option<String>,
}

impl Default for PullAdapterConfig {
    fn default() -> Self {
        Self {
            subscription_name: String::new(),
            max_outstanding: 16,
            max_delivery_attempts: 5,
            dead_letter_topic: None,
        }
    }
}

impl PullAdapterConfig {
    pub fn new(subscription_name: impl Into<String>) -> Self {
        Self {
            subscription_name: subscription_name.into(),
            ..Self::default()
        }
    }

    pub fn with_max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.max_outstanding = max_outstanding;
        self
    }

    pub fn with_dead_letter_topic(mut self, topic_name: impl Into<String>, max_delivery_attempts: u32) -> Self {
        self.dead_letter_topic = Some(topic_name.into());
        self.max_delivery_attempts = max_delivery_attempts;
        self
    }
}

#[derive(Debug, Error)]
enum PullError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Bridges a pull subscription into a local [`Publisher`].
///
/// Every message is decoded back into an [`EventRecord`] and published with
/// an acknowledgment channel; the message is acked once the local handlers
/// succeeded and nacked otherwise. Events nobody subscribed to locally are
/// acked.
pub struct PullAdapter {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

struct Inner {
    subscription: Arc<dyn PullSubscription>,
    publisher: Arc<dyn Publisher<EventRecord>>,
    codec: Arc<dyn Codec>,
    dead_letter: Option<Arc<dyn Topic>>,
    config: PullAdapterConfig,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PullAdapter {
    pub fn connect(
        client: &dyn PubSubClient,
        publisher: Arc<dyn Publisher<EventRecord>>,
        codec: Arc<dyn Codec>,
        config: PullAdapterConfig,
    ) -> Result<Self, TransportError> {
        let subscription = client.subscription(&config.subscription_name)?;
        let dead_letter = config
            .dead_letter_topic
            .as_deref()
            .map(|name| client.topic(name))
            .transpose()?;

        Ok(Self {
            inner: Arc::new(Inner {
                subscription,
                publisher,
                codec,
                dead_letter,
                config,
            }),
            running: Mutex::new(None),
        })
    }

    pub fn start(&self) -> Result<(), BusError> {
        self.start_after(|| Ok(()))
    }

    /// Start pulling once `upstream` has started.
    ///
    /// Every check that can fail runs before `upstream`, and the adapter stays
    /// locked until it is spawned, so once `upstream` succeeded the adapter
    /// starts too.
    pub fn start_after(&self, upstream: impl FnOnce() -> Result<(), BusError>) -> Result<(), BusError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Err(BusError::AlreadyRunning);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;
        upstream()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = runtime.spawn(receive(self.inner.clone(), shutdown_rx));
        *running = Some(Running { shutdown, handle });

        info!(
            subscription = self.inner.subscription.name(),
            max_outstanding = self.inner.config.max_outstanding,
            "pull adapter started"
        );
        Ok(())
    }

    /// Stop pulling and wait for in-flight messages to settle.
    pub async fn stop(&self) -> Result<(), BusError> {
        let running = {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            running.take()
        };
        let Some(Running { shutdown, handle }) = running else {
            return Err(BusError::NotRunning);
        };

        let _ = shutdown.send(true);
        if let Err(err) = handle.await {
            error!(error = %err, "pull adapter terminated abnormally");
        }
        info!(subscription = self.inner.subscription.name(), "pull adapter stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

async fn receive(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let max_outstanding = inner.config.max_outstanding.max(1);
    let permits = Arc::new(Semaphore::new(max_outstanding));

    loop {
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let pulled = tokio::select! {
            _ = shutdown.changed() => break,
            pulled = inner.subscription.pull() => pulled,
        };

        match pulled {
            Ok(Some(message)) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    inner.process(message).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                info!(subscription = inner.subscription.name(), "subscription closed");
                break;
            }
            Err(err) => {
                error!(subscription = inner.subscription.name(), error = %err, "pull failed");
                tokio::time::sleep(PULL_ERROR_BACKOFF).await;
            }
        }
    }

    // Wait for every spawned message to settle.
    let _ = permits.acquire_many(max_outstanding as u32).await;
    debug!(subscription = inner.subscription.name(), "pull loop finished");
}

impl Inner {
    async fn process(&self, message: InboundMessage) {
        match self.deliver(&message).await {
            Ok(()) => message.ack(),
            Err(PullError::Bus(BusError::UnhandledEvent { name, id })) => {
                debug!(event = %name, id = %id, "no local subscriber, acking");
                message.ack();
            }
            Err(err) => self.reject(message, err).await,
        }
    }

    async fn deliver(&self, message: &InboundMessage) -> Result<(), PullError> {
        let header = attributes::decode(message.attributes())?;
        let data = self.codec.unmarshal(&header.name, message.data())?;
        let record = EventRecord::restore(header.id, header.name, header.occurred_at, header.aggregate, data);

        debug!(
            event = record.name(),
            id = %record.id(),
            aggregate_id = %record.aggregate().id,
            version = record.aggregate().version,
            attempt = message.delivery_attempt(),
            "event received"
        );

        let (tx, rx) = oneshot::channel();
        self.publisher
            .publish(record, PublishOptions::new().with_ack_channel(tx))
            .await?;
        rx.await.unwrap_or(Err(BusError::Cancelled))?;
        Ok(())
    }

    async fn reject(&self, message: InboundMessage, err: PullError) {
        let attempt = message.delivery_attempt();
        let limit = self.config.max_delivery_attempts;

        if let Some(dead_letter) = &self.dead_letter {
            if limit > 0 && attempt >= limit {
                match dead_letter.publish(message.to_outbound()).await {
                    Ok(_) => {
                        warn!(
                            message_id = message.id(),
                            attempt,
                            dead_letter_topic = dead_letter.name(),
                            error = %err,
                            "event processing keeps failing, message dead-lettered"
                        );
                        message.ack();
                        return;
                    }
                    Err(dead_letter_err) => {
                        error!(
                            message_id = message.id(),
                            error = %dead_letter_err,
                            "failed to dead-letter message"
                        );
                    }
                }
            }
        }

        warn!(
            message_id = message.id(),
            attempt,
            error = %err,
            "event processing failed, message will be redelivered"
        );
        message.nack();
    }
}
