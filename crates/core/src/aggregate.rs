//! Event-sourced aggregate root.
//!
//! An [`Aggregate`] owns one snapshot and the ordered list of every event
//! applied to it. It enforces three rules on each event before touching state:
//!
//! - the event's version is exactly `version + 1`
//! - the event belongs to the same entity type
//! - once the aggregate has an id, the event carries that same id
//!
//! New facts only enter through [`Aggregate::raise`] (or its convenience
//! wrapper [`Aggregate::record`]). Stores persist whatever
//! [`Aggregate::get_new_events`] returns and then call
//! [`Aggregate::mark_events_as_saved`].
//!
//! Aggregates do no IO and have no internal synchronization; one logical owner
//! mutates an instance per update cycle.

use core::fmt::Debug;

use crate::error::{AggregateError, Mismatch};
use crate::event::{Applyable, Event, Metadata, Versioned};
use crate::id::EntityId;

/// Ties the concrete types of one aggregate kind together.
pub trait AggregateKind: Send + Sync + 'static {
    /// Constant tag shared by every instance of this kind.
    const ENTITY_TYPE: &'static str;

    type Id: EntityId;
    type Snapshot: Versioned + Clone + Debug + Send + Sync + 'static;
    type Payload: Applyable<Self::Snapshot> + Clone + Debug + Send + Sync + 'static;
}

/// Event type of an aggregate kind.
pub type KindEvent<K> = Event<<K as AggregateKind>::Id, <K as AggregateKind>::Payload>;

pub struct Aggregate<K: AggregateKind> {
    entity_id: K::Id,
    version: u64,
    events: Vec<KindEvent<K>>,
    next_to_save: usize,
    snapshot: K::Snapshot,
}

impl<K: AggregateKind> Clone for Aggregate<K> {
    fn clone(&self) -> Self {
        Self {
            entity_id: self.entity_id.clone(),
            version: self.version,
            events: self.events.clone(),
            next_to_save: self.next_to_save,
            snapshot: self.snapshot.clone(),
        }
    }
}

impl<K: AggregateKind> Debug for Aggregate<K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Aggregate")
            .field("entity_type", &K::ENTITY_TYPE)
            .field("entity_id", &self.entity_id)
            .field("version", &self.version)
            .field("pending", &(self.events.len() - self.next_to_save))
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

impl<K: AggregateKind> Aggregate<K> {
    /// A fresh aggregate with no history.
    pub fn new(entity_id: K::Id, snapshot: K::Snapshot) -> Self {
        Self {
            entity_id,
            version: 0,
            events: Vec::new(),
            next_to_save: 0,
            snapshot,
        }
    }

    /// Rebuild an aggregate from its persisted history.
    ///
    /// The id is taken from the first event; every event is then replayed onto
    /// a snapshot produced by `snapshot_factory`. The history counts as saved.
    pub fn reify(
        prior_events: Vec<KindEvent<K>>,
        snapshot_factory: impl FnOnce() -> K::Snapshot,
    ) -> Result<Self, AggregateError> {
        let Some(first) = prior_events.first() else {
            return Err(AggregateError::EmptyHistory);
        };

        if first.entity_type() != K::ENTITY_TYPE {
            return Err(AggregateError::SequenceMismatch(Mismatch::EntityType {
                expected: K::ENTITY_TYPE.to_string(),
                found: first.entity_type().to_string(),
            }));
        }

        let mut aggregate = Self {
            entity_id: first.entity_id().clone(),
            version: 0,
            next_to_save: prior_events.len(),
            events: prior_events,
            snapshot: snapshot_factory(),
        };
        aggregate.replay()?;
        Ok(aggregate)
    }

    pub fn entity_type(&self) -> &'static str {
        K::ENTITY_TYPE
    }

    pub fn entity_id(&self) -> &K::Id {
        &self.entity_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self) -> &K::Snapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> K::Snapshot {
        self.snapshot
    }

    /// Every event known to this aggregate, historical and new, in order.
    pub fn events(&self) -> &[KindEvent<K>] {
        &self.events
    }

    /// Apply an event to the snapshot without recording it.
    ///
    /// On any error the version and the snapshot are left untouched.
    pub fn apply(&mut self, event: &KindEvent<K>) -> Result<(), AggregateError> {
        self.check_sequence(event)?;

        let mut next = self.snapshot.clone();
        event.payload().apply_to(&mut next)?;

        if EntityId::is_empty(&self.entity_id) {
            self.entity_id = event.entity_id().clone();
        }
        self.version = event.version();
        next.set_version(self.version);
        self.snapshot = next;
        Ok(())
    }

    /// Apply an event and append it to the history.
    pub fn raise(&mut self, event: KindEvent<K>) -> Result<(), AggregateError> {
        self.apply(&event)?;
        self.events.push(event);
        Ok(())
    }

    /// Build the metadata for the next event of this aggregate.
    pub fn new_metadata(&self, event_type: &str) -> Metadata<K::Id> {
        Metadata::next(
            K::ENTITY_TYPE,
            self.entity_id.clone(),
            event_type,
            self.version + 1,
        )
    }

    /// Raise a payload at the next version.
    pub fn record(&mut self, payload: K::Payload) -> Result<&KindEvent<K>, AggregateError> {
        let metadata = self.new_metadata(payload.event_type());
        self.raise(Event::new(metadata, payload))?;
        // `raise` succeeded, so the history is non-empty.
        Ok(&self.events[self.events.len() - 1])
    }

    /// Re-apply every historical event the snapshot has not seen yet.
    ///
    /// Events at or below the current version are skipped, so calling this
    /// repeatedly never applies an event twice.
    pub fn replay(&mut self) -> Result<(), AggregateError> {
        let pending: Vec<KindEvent<K>> = self
            .events
            .iter()
            .filter(|event| event.version() > self.version)
            .cloned()
            .collect();

        for event in &pending {
            self.apply(event)?;
        }
        Ok(())
    }

    /// Events raised since the last successful save.
    pub fn get_new_events(&self) -> &[KindEvent<K>] {
        &self.events[self.next_to_save..]
    }

    pub fn has_events_to_save(&self) -> bool {
        self.next_to_save < self.events.len()
    }

    pub fn mark_events_as_saved(&mut self) {
        self.next_to_save = self.events.len();
    }

    fn check_sequence(&self, event: &KindEvent<K>) -> Result<(), AggregateError> {
        let expected = self.version + 1;
        if event.version() != expected {
            return Err(AggregateError::SequenceMismatch(Mismatch::Version {
                expected,
                found: event.version(),
            }));
        }

        if event.entity_type() != K::ENTITY_TYPE {
            return Err(AggregateError::SequenceMismatch(Mismatch::EntityType {
                expected: K::ENTITY_TYPE.to_string(),
                found: event.entity_type().to_string(),
            }));
        }

        if !EntityId::is_empty(&self.entity_id) && event.entity_id() != &self.entity_id {
            return Err(AggregateError::SequenceMismatch(Mismatch::EntityId {
                expected: self.entity_id.to_string(),
                found: event.entity_id().to_string(),
            }));
        }

        Ok(())
    }
}
