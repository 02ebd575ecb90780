//! Event distribution across processes over an ordered pub/sub transport.
//!
//! - [`transport`]: the topic/subscription boundary and message types
//! - [`InMemoryPubSub`]: in-process emulator of an ordered broker
//! - [`PubSubPublisher`]: publishes event records, ordered per aggregate
//! - [`PullAdapter`]: feeds pulled messages into a local publisher, acking
//!   or nacking from the handler outcome
//! - [`NetworkEventBus`]: the two combined behind [`chronicle_events::EventBus`]

pub mod attributes;
pub mod emulator;
pub mod network_bus;
pub mod publisher;
pub mod pull_adapter;
pub mod transport;

pub use attributes::{EventHeader, ParseError};
pub use emulator::{EmulatorSubscription, EmulatorTopic, InMemoryPubSub};
pub use network_bus::NetworkEventBus;
pub use publisher::{PubSubPublisher, PublisherConfig};
pub use pull_adapter::{PullAdapter, PullAdapterConfig};
pub use transport::{
    Attributes, InboundMessage, OutboundMessage, PubSubClient, PullSubscription, Topic, TransportError,
};
