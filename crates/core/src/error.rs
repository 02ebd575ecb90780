//! Domain and aggregate error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Returned by snapshot mutations and command methods. Keep this focused on
/// deterministic, business failures; infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// Which part of an event failed the sequence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    Version { expected: u64, found: u64 },
    EntityType { expected: String, found: String },
    EntityId { expected: String, found: String },
}

impl core::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Mismatch::Version { expected, found } => {
                write!(f, "invalid version {found}, expected {expected}")
            }
            Mismatch::EntityType { expected, found } => {
                write!(f, "invalid entity type {found}, expected {expected}")
            }
            Mismatch::EntityId { expected, found } => {
                write!(f, "invalid entity id {found}, expected {expected}")
            }
        }
    }
}

/// Errors raised while applying, raising or reconstituting an aggregate.
///
/// None of these are retried internally; they are fatal to the current
/// command and surfaced to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AggregateError {
    /// The event does not belong at the aggregate's next position.
    #[error("sequence mismatch: {0}")]
    SequenceMismatch(Mismatch),

    /// `reify` was called without any prior events.
    #[error("cannot reify an aggregate from an empty history")]
    EmptyHistory,

    /// The payload refused to apply itself to the snapshot.
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl AggregateError {
    pub fn is_sequence_mismatch(&self) -> bool {
        matches!(self, AggregateError::SequenceMismatch(_))
    }
}
