//! Strongly-typed identifiers used across the domain.
//!
//! Aggregates are generic over their identifier type. Anything that is
//! comparable, printable and has a notion of "not assigned yet" can serve as an
//! entity id through the [`EntityId`] capability.

use core::fmt::{Debug, Display};
use core::hash::Hash;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Capability required from an aggregate identifier.
///
/// An empty id means "not assigned yet": an aggregate created without an id
/// adopts whatever id its first applied event carries.
pub trait EntityId: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static {
    fn is_empty(&self) -> bool;

    /// Parse the textual form produced by `Display`.
    fn parse_id(raw: &str) -> Result<Self, DomainError>;
}

impl EntityId for String {
    fn is_empty(&self) -> bool {
        self.trim().is_empty()
    }

    fn parse_id(raw: &str) -> Result<Self, DomainError> {
        Ok(raw.to_string())
    }
}

/// Identifier of an aggregate root.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(Uuid);

/// Identifier of a single event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// The all-zero identifier.
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(AggregateId, "AggregateId");
impl_uuid_newtype!(EventId, "EventId");

impl EntityId for AggregateId {
    fn is_empty(&self) -> bool {
        self.0.is_nil()
    }

    fn parse_id(raw: &str) -> Result<Self, DomainError> {
        raw.parse()
    }
}
