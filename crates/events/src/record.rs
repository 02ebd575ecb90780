//! The event record that travels through buses, stores and transports.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chronicle_core::{Event, EventId};

use crate::bus::BusEvent;

/// Aggregate an event belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateRef {
    pub id: String,
    pub name: String,
    pub version: u64,
}

impl AggregateRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version,
        }
    }
}

/// Type-erased event: identity, routing data and an opaque payload.
///
/// Cloning is cheap (the payload is shared). Consumers recover the typed
/// payload with [`EventRecord::data`].
#[derive(Clone)]
pub struct EventRecord {
    id: EventId,
    name: String,
    occurred_at: DateTime<Utc>,
    aggregate: AggregateRef,
    data: Arc<dyn Any + Send + Sync>,
}

impl EventRecord {
    /// A fresh record with a new id, stamped now.
    pub fn new<T>(name: impl Into<String>, aggregate: AggregateRef, data: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            id: EventId::new(),
            name: name.into(),
            occurred_at: Utc::now(),
            aggregate,
            data: Arc::new(data),
        }
    }

    /// Rebuild a record from stored or received parts.
    pub fn restore(
        id: EventId,
        name: impl Into<String>,
        occurred_at: DateTime<Utc>,
        aggregate: AggregateRef,
        data: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            occurred_at,
            aggregate,
            data,
        }
    }

    /// Wrap an aggregate event; the payload becomes the record data.
    pub fn from_event<Id, P>(event: &Event<Id, P>) -> Self
    where
        Id: fmt::Display,
        P: Clone + Send + Sync + 'static,
    {
        let metadata = event.metadata();
        Self {
            id: metadata.event_id(),
            name: metadata.event_type().to_string(),
            occurred_at: metadata.occurred_at(),
            aggregate: AggregateRef::new(
                metadata.entity_id().to_string(),
                metadata.entity_type(),
                metadata.version(),
            ),
            data: Arc::new(event.payload().clone()),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn aggregate(&self) -> &AggregateRef {
        &self.aggregate
    }

    /// The typed payload, if it is a `T`.
    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    pub fn raw_data(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.data
    }
}

impl fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("occurred_at", &self.occurred_at)
            .field("aggregate", &self.aggregate)
            .finish_non_exhaustive()
    }
}

impl BusEvent for EventRecord {
    fn event_id(&self) -> EventId {
        self.id
    }

    fn event_name(&self) -> &str {
        &self.name
    }
}
