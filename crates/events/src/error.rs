//! Bus, broker and codec errors.

use chronicle_core::EventId;
use thiserror::Error;

/// Failure of a bus operation or of the handler chain behind it.
///
/// Lifecycle misuse (`NotRunning`, `AlreadyRunning`) and blank subscription
/// names are returned synchronously. Everything that happens during dispatch
/// is reported through the publisher's acknowledgment.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("event name cannot be empty")]
    EmptyEventName,

    #[error("bus is not running")]
    NotRunning,

    #[error("bus is already running")]
    AlreadyRunning,

    /// `start` was called outside of a tokio runtime.
    #[error("no async runtime available to run the bus")]
    NoRuntime,

    /// Nobody subscribed to the event.
    #[error("unhandled event: {name} {id}")]
    UnhandledEvent { name: String, id: EventId },

    #[error("handler for event {event} failed: {source}")]
    Handler {
        event: String,
        #[source]
        source: anyhow::Error,
    },

    /// A handler panicked; the panic was contained and turned into this error.
    #[error("handler for event {event} panicked: {message}")]
    HandlerPanicked { event: String, message: String },

    /// Delivery was abandoned: the publish deadline passed while the queue was
    /// full, or the envelope was dropped unacknowledged at shutdown.
    #[error("event delivery was cancelled")]
    Cancelled,

    /// A downstream publisher (e.g. a network transport) rejected the event.
    #[error("failed to publish event {event}: {source}")]
    PublishFailed {
        event: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Broker(Box<BrokerError>),
}

impl BusError {
    pub fn is_unhandled(&self) -> bool {
        matches!(self, BusError::UnhandledEvent { .. })
    }

    pub fn publish_failed(event: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::PublishFailed {
            event: event.into(),
            source: source.into(),
        }
    }
}

impl From<BrokerError> for BusError {
    fn from(value: BrokerError) -> Self {
        Self::Broker(Box::new(value))
    }
}

/// Errors produced by the fan-out [`crate::Broker`].
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("duplicate event names in subscription: {0:?}")]
    DuplicateNames(Vec<String>),

    #[error("subscription failed: {0}")]
    Subscribe(#[source] BusError),

    /// One or more handlers failed; every handler still ran to completion.
    #[error("errors while processing event {event}: {}", join_errors(.errors))]
    Handlers { event: String, errors: Vec<BusError> },
}

fn join_errors(errors: &[BusError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures of the payload codec registry.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no codec registered for event {0}")]
    UnknownEvent(String),

    #[error("a codec is already registered for event {0}")]
    DuplicateEvent(String),

    #[error("payload of event {name} is not a {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("failed to encode event {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode event {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_error_lists_every_failure() {
        let err = BrokerError::Handlers {
            event: "loan.flow.started".into(),
            errors: vec![
                BusError::HandlerPanicked {
                    event: "loan.flow.started".into(),
                    message: "boom".into(),
                },
                BusError::Handler {
                    event: "loan.flow.started".into(),
                    source: anyhow::anyhow!("db down"),
                },
            ],
        };

        let text = err.to_string();
        assert!(text.contains("boom"));
        assert!(text.contains("db down"));
    }
}
