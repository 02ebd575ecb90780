//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern**: a pub/sub mechanism for
//! distributing events to consumers (projections, process managers, transport
//! adapters) after they have been persisted.
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: events may be delivered more than once; handlers must
//!   be idempotent.
//! - **Ordered per bus**: a [`crate::LocalBus`] dispatches in publish order,
//!   one event at a time. Network transports only order events that share an
//!   ordering key (the aggregate id).
//! - **Consumer-driven progress**: a publisher that needs to know the outcome
//!   of the handler chain asks for it through
//!   [`PublishOptions::with_ack`](crate::PublishOptions::with_ack) or
//!   [`PublishOptions::with_wait`](crate::PublishOptions::with_wait).
//!
//! ## Thread Safety
//!
//! All traits require `Send + Sync`; buses are shared behind `Arc` and used
//! from many tasks concurrently.

use std::sync::Arc;

use async_trait::async_trait;

use chronicle_core::EventId;

use crate::envelope::PublishOptions;
use crate::error::BusError;
use crate::handler::EventHandler;

/// What a bus needs to know about an event to route it.
pub trait BusEvent: Clone + Send + Sync + 'static {
    fn event_id(&self) -> EventId;

    /// Routing key: handlers subscribe by this name.
    fn event_name(&self) -> &str;
}

/// Identifies one handler registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl core::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[async_trait]
pub trait Publisher<E: BusEvent>: Send + Sync {
    /// Hand an event to the bus.
    ///
    /// Returns once the event has been accepted, unless the options ask to
    /// wait for the handler chain.
    async fn publish(&self, event: E, options: PublishOptions) -> Result<(), BusError>;
}

pub trait Subscriber<E: BusEvent>: Send + Sync {
    /// Register `handler` for events named `name`.
    ///
    /// Handlers registered under the same name run in registration order.
    fn subscribe(&self, name: &str, handler: EventHandler<E>) -> Result<SubscriptionId, BusError>;

    /// Remove one registration. Returns `false` if it was not found.
    fn unsubscribe(&self, name: &str, id: SubscriptionId) -> bool;
}

/// A bus with an explicit lifecycle: `stopped -> running -> stopped`.
#[async_trait]
pub trait EventBus<E: BusEvent>: Publisher<E> + Subscriber<E> {
    fn start(&self) -> Result<(), BusError>;

    /// Stop accepting events and wait for the queued ones to be dispatched.
    async fn stop(&self) -> Result<(), BusError>;

    fn is_running(&self) -> bool;
}

#[async_trait]
impl<E, P> Publisher<E> for Arc<P>
where
    E: BusEvent,
    P: Publisher<E> + ?Sized,
{
    async fn publish(&self, event: E, options: PublishOptions) -> Result<(), BusError> {
        (**self).publish(event, options).await
    }
}

impl<E, S> Subscriber<E> for Arc<S>
where
    E: BusEvent,
    S: Subscriber<E> + ?Sized,
{
    fn subscribe(&self, name: &str, handler: EventHandler<E>) -> Result<SubscriptionId, BusError> {
        (**self).subscribe(name, handler)
    }

    fn unsubscribe(&self, name: &str, id: SubscriptionId) -> bool {
        (**self).unsubscribe(name, id)
    }
}
