//! Infrastructure layer: storage, transport and read side of the event-sourcing core.

pub mod document_store;
pub mod event_store;
pub mod projections;
pub mod pubsub;
pub mod read_model;
pub mod retry;


pub use retry::RetryPolicy;
