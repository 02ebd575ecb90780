//! Immutable, versioned facts and the capability contracts that connect them
//! to aggregate snapshots.
//!
//! An [`Event`] is a [`Metadata`] envelope plus a typed payload. The payload
//! knows how to apply itself to one snapshot type ([`Applyable`]); the snapshot
//! only needs to track its own version ([`Versioned`]). Aggregate kinds wire the
//! two together for their concrete types, usually with a closed enum payload so
//! every event type is matched exhaustively at compile time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainResult;
use crate::id::EventId;

/// Capability of a snapshot: it mirrors the version of its owning aggregate.
pub trait Versioned {
    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);
}

/// Capability of an event payload: it can evolve a snapshot of type `S`.
///
/// `apply_to` must be deterministic and free of side effects. On error the
/// aggregate discards whatever the payload did to the snapshot.
pub trait Applyable<S> {
    /// Stable discriminator of the fact, e.g. `loan.flow.started`.
    fn event_type(&self) -> &'static str;

    fn apply_to(&self, snapshot: &mut S) -> DomainResult<()>;
}

/// Common envelope carried by every event.
///
/// Fresh metadata is only produced by the aggregate (see
/// `Aggregate::new_metadata`), which is what keeps versions gap-free. Stores
/// rebuild persisted envelopes through [`Metadata::restore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata<Id> {
    event_id: EventId,
    entity_type: String,
    entity_id: Id,
    event_type: String,
    version: u64,
    occurred_at: DateTime<Utc>,
}

impl<Id> Metadata<Id> {
    pub(crate) fn next(
        entity_type: &str,
        entity_id: Id,
        event_type: &str,
        version: u64,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            entity_type: entity_type.to_string(),
            entity_id,
            event_type: event_type.to_string(),
            version,
            occurred_at: Utc::now(),
        }
    }

    /// Rebuild an envelope loaded from storage or received over the wire.
    pub fn restore(
        event_id: EventId,
        entity_type: impl Into<String>,
        entity_id: Id,
        event_type: impl Into<String>,
        version: u64,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            entity_type: entity_type.into(),
            entity_id,
            event_type: event_type.into(),
            version,
            occurred_at,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn entity_id(&self) -> &Id {
        &self.entity_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// A fact that happened to one aggregate instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<Id, P> {
    metadata: Metadata<Id>,
    payload: P,
}

impl<Id, P> Event<Id, P> {
    pub fn new(metadata: Metadata<Id>, payload: P) -> Self {
        Self { metadata, payload }
    }

    pub fn metadata(&self) -> &Metadata<Id> {
        &self.metadata
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    pub fn entity_id(&self) -> &Id {
        &self.metadata.entity_id
    }

    pub fn entity_type(&self) -> &str {
        &self.metadata.entity_type
    }

    pub fn event_type(&self) -> &str {
        &self.metadata.event_type
    }

    pub fn into_parts(self) -> (Metadata<Id>, P) {
        (self.metadata, self.payload)
    }
}
