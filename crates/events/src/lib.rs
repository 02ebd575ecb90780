//! `chronicle-events`: in-process event distribution.
//!
//! - [`LocalBus`]: queued, ordered, fail-fast dispatch with a single worker
//! - [`Broker`]: concurrent fan-out with aggregated errors
//! - [`EventRecord`]: the type-erased event every bus and transport carries
//! - [`CodecRegistry`]: payload (de)serialization by event name

pub mod broker;
pub mod bus;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod local_bus;
pub mod record;
pub mod registry;

pub use broker::{Broker, Unsubscriber};
pub use bus::{BusEvent, EventBus, Publisher, Subscriber, SubscriptionId};
pub use codec::{Codec, CodecRegistry, CodecRegistryBuilder};
pub use envelope::{AckCallback, DeliveryResult, PublishOptions};
pub use error::{BrokerError, BusError, CodecError};
pub use handler::{EventHandler, handler_fn, typed_handler};
pub use local_bus::{LocalBus, LocalBusConfig};
pub use record::{AggregateRef, EventRecord};
pub use registry::HandlerRegistry;
