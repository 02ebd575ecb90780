//! Append-only event history.
//!
//! [`EventStore`] keeps one stream of [`chronicle_events::EventRecord`]s per
//! aggregate id; [`AggregateRepository`] turns those streams back into typed
//! aggregates and saves new events with optimistic concurrency.

pub mod in_memory;
pub mod repository;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use repository::{AggregateRepository, RepositoryError};
pub use r#trait::{EventStore, EventStoreError};
