//! Read side: disposable, queryable views built from event records.
//!
//! A read model is keyed by the id of the aggregate it was built from and
//! carries the version of the last event applied to it. Projections keep that
//! version contiguous with the aggregate history, which is what lets the
//! version-wait read and the entity healer detect lag and gaps.

pub mod healer;
pub mod in_memory;
pub mod projector;
pub mod regenerator;
pub mod versioned;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::event_store::EventStoreError;

pub use healer::EntityHealer;
pub use in_memory::InMemoryReadRepository;
pub use projector::{
    ProjectionError, ProjectionHandler, Projector, ProjectorHandler, event_handler, subscribe_projection,
};
pub use regenerator::ReadModelRegenerator;
pub use versioned::{ReadContext, VersionedReadRepository};

pub trait ReadModel: Clone + Send + Sync + 'static {
    /// Id of the aggregate the model was built from.
    fn entity_id(&self) -> &str;

    /// Version of the last event applied.
    fn version(&self) -> u64;
}

#[derive(Debug, Error)]
pub enum ReadModelError {
    #[error("read model {id} not found")]
    NotFound { id: String },

    #[error("read model {id} did not reach version {min_version} (found {found:?})")]
    MinVersionNotReached {
        id: String,
        min_version: u64,
        found: Option<u64>,
    },

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error("read model storage failed: {0}")]
    Storage(String),
}

impl ReadModelError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReadModelError::NotFound { .. })
    }
}

#[async_trait]
pub trait ReadRepository<M: ReadModel>: Send + Sync {
    async fn find(&self, id: &str) -> Result<M, ReadModelError>;

    async fn find_all(&self) -> Result<Vec<M>, ReadModelError>;

    /// Insert or replace the model stored under its entity id.
    async fn save(&self, model: M) -> Result<(), ReadModelError>;

    async fn remove(&self, id: &str) -> Result<(), ReadModelError>;
}

#[async_trait]
impl<M, R> ReadRepository<M> for Arc<R>
where
    M: ReadModel,
    R: ReadRepository<M> + ?Sized,
{
    async fn find(&self, id: &str) -> Result<M, ReadModelError> {
        (**self).find(id).await
    }

    async fn find_all(&self) -> Result<Vec<M>, ReadModelError> {
        (**self).find_all().await
    }

    async fn save(&self, model: M) -> Result<(), ReadModelError> {
        (**self).save(model).await
    }

    async fn remove(&self, id: &str) -> Result<(), ReadModelError> {
        (**self).remove(id).await
    }
}

/// `find`, with a missing model as `None`.
pub(crate) async fn find_optional<M, R>(repository: &R, id: &str) -> Result<Option<M>, ReadModelError>
where
    M: ReadModel,
    R: ReadRepository<M> + ?Sized,
{
    match repository.find(id).await {
        Ok(model) => Ok(Some(model)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}
