//! `chronicle-core`: event-sourcing building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the event envelope, the capability traits tying payloads to
//! snapshots, and the version-checked [`Aggregate`].

pub mod aggregate;
pub mod error;
pub mod event;
pub mod id;

pub use aggregate::{Aggregate, AggregateKind, KindEvent};
pub use error::{AggregateError, DomainError, DomainResult, Mismatch};
pub use event::{Applyable, Event, Metadata, Versioned};
pub use id::{AggregateId, EntityId, EventId};
