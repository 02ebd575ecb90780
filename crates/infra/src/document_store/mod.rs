//! Versioned document storage.
//!
//! A document store keeps one current document per id together with its
//! version. Writers never lock: [`DocumentStore::update_if_version`] only
//! replaces a document whose stored version still equals the version the
//! writer read, and reports how many documents matched. Zero matched is the
//! optimistic-conflict signal consumed by [`OptimisticRepository`].
//!
//! Backends translate their driver errors into the closed [`StoreError`]
//! taxonomy, falling back to [`classify_driver_error`] on the error text.

pub mod in_memory;
pub mod optimistic;
pub mod postgres;

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tracing::error;

use chronicle_core::{EntityId, Versioned};

pub use in_memory::InMemoryDocumentStore;
pub use optimistic::{OptimisticRepository, UpdateError};
pub use postgres::PostgresDocumentStore;

/// A storable entity: an id, a version, and a collection it lives in.
pub trait Document: Versioned + Clone + Send + Sync + 'static {
    type Id: EntityId;

    /// Collection (table) name, also used in error messages.
    const COLLECTION: &'static str;

    fn id(&self) -> &Self::Id;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: String, key: String },

    #[error("{entity} already exists: {details}")]
    Duplicate { entity: String, details: String },

    #[error("{entity} is in an invalid state: {details}")]
    InvalidState { entity: String, details: String },

    #[error("found many {entity} where one was expected: {key}")]
    FoundMany { entity: String, key: String },

    #[error("timed out accessing {entity}: {key}")]
    Timeout { entity: String, key: String },

    #[error("cancelled while accessing {entity}: {key}")]
    Cancelled { entity: String, key: String },

    #[error("unexpected error accessing {entity}: {message}")]
    Unknown { entity: String, message: String },
}

impl StoreError {
    pub fn not_found(entity: &str, key: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

#[async_trait]
pub trait DocumentStore<D: Document>: Send + Sync {
    async fn find_by_id(&self, id: &D::Id) -> Result<D, StoreError>;

    /// Store a new document; fails with `Duplicate` if the id is taken.
    async fn insert(&self, document: &D) -> Result<(), StoreError>;

    /// Replace the document only if its stored version equals
    /// `expected_version`. Returns the number of documents matched.
    async fn update_if_version(&self, document: &D, expected_version: u64) -> Result<u64, StoreError>;

    async fn remove(&self, id: &D::Id) -> Result<(), StoreError>;
}

#[async_trait]
impl<D, S> DocumentStore<D> for std::sync::Arc<S>
where
    D: Document,
    S: DocumentStore<D> + ?Sized,
{
    async fn find_by_id(&self, id: &D::Id) -> Result<D, StoreError> {
        (**self).find_by_id(id).await
    }

    async fn insert(&self, document: &D) -> Result<(), StoreError> {
        (**self).insert(document).await
    }

    async fn update_if_version(&self, document: &D, expected_version: u64) -> Result<u64, StoreError> {
        (**self).update_if_version(document, expected_version).await
    }

    async fn remove(&self, id: &D::Id) -> Result<(), StoreError> {
        (**self).remove(id).await
    }
}

static DUPLICATE_DETAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Key \((?P<columns>[^)]+)\)=\((?P<values>[^)]*)\) already exists")
        .expect("valid regex")
});

static DUPLICATE_CONSTRAINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"unique constraint "(?P<constraint>[^"]+)""#)
        .expect("valid regex")
});

/// Map a driver error message onto the [`StoreError`] taxonomy.
///
/// Matching is on well-known fragments of the message text. Anything not
/// recognized is logged and returned as [`StoreError::Unknown`].
pub fn classify_driver_error(message: &str, entity: &str, key: &str) -> StoreError {
    let lower = message.to_lowercase();
    let entity = entity.to_string();
    let key = key.to_string();

    if lower.contains("not found")
        || lower.contains("no rows returned")
        || lower.contains("no documents in result")
        || lower.contains("invalid key")
    {
        return StoreError::NotFound { entity, key };
    }

    if lower.contains("duplicate key") {
        error!(entity = %entity, error = message, "duplicate key");
        return StoreError::Duplicate {
            details: duplicate_details(message),
            entity,
        };
    }

    if lower.contains("found many") || lower.contains("more than one row") {
        error!(entity = %entity, error = message, "found many where one was expected");
        return StoreError::FoundMany { entity, key };
    }

    if lower.contains("violates check constraint")
        || lower.contains("violates not-null constraint")
        || lower.contains("invalid input syntax")
    {
        return StoreError::InvalidState {
            entity,
            details: message.to_string(),
        };
    }

    if lower.contains("deadline exceeded") || lower.contains("timed out") || lower.contains("timeout") {
        return StoreError::Timeout { entity, key };
    }

    if lower.contains("canceled") || lower.contains("cancelled") || lower.contains("canceling statement") {
        return StoreError::Cancelled { entity, key };
    }

    error!(entity = %entity, error = message, "unexpected store error");
    StoreError::Unknown {
        entity,
        message: message
            .trim_start_matches("error returned from database: ")
            .to_string(),
    }
}

fn duplicate_details(message: &str) -> String {
    if let Some(caps) = DUPLICATE_DETAIL.captures(message) {
        return format!(
            "duplicate key {}='{}'",
            &caps["columns"],
            caps["values"].replace('"', "'")
        );
    }
    if let Some(caps) = DUPLICATE_CONSTRAINT.captures(message) {
        return format!("duplicate key on {}", &caps["constraint"]);
    }
    message.to_string()
}
