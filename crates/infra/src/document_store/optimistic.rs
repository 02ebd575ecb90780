//! Optimistic load-update-write loop over a [`DocumentStore`].

use std::marker::PhantomData;

use thiserror::Error;
use tracing::{debug, warn};

use super::{Document, DocumentStore, StoreError};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum UpdateError<E> {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("optimistic locking failed for {entity} {id}: too many retries ({attempts})")]
    OptimisticLockExhausted {
        entity: &'static str,
        id: String,
        attempts: u32,
    },

    /// The updater rejected the change; never retried.
    #[error("update rejected: {0}")]
    Updater(E),
}

impl<E> UpdateError<E> {
    pub fn is_lock_exhausted(&self) -> bool {
        matches!(self, UpdateError::OptimisticLockExhausted { .. })
    }
}

/// Reconciles concurrent writers of the same document without locking.
///
/// ```ignore
/// repository
///     .update(&id, |mut account| {
///         account.deposit(amount)?;
///         Ok(account)
///     })
///     .await?;
/// ```
pub struct OptimisticRepository<D, S> {
    store: S,
    policy: RetryPolicy,
    _document: PhantomData<fn() -> D>,
}

impl<D, S> OptimisticRepository<D, S>
where
    D: Document,
    S: DocumentStore<D>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            policy: RetryPolicy::default(),
            _document: PhantomData,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn find_by_id(&self, id: &D::Id) -> Result<D, StoreError> {
        self.store.find_by_id(id).await
    }

    /// Load the document, let `updater` change it, and write it back only if
    /// nobody else wrote in between.
    ///
    /// A conflicting write restarts the whole cycle, up to the policy's
    /// attempt bound. Store errors and updater errors end the loop at once.
    /// If the updater leaves the version alone, the stored version becomes
    /// `version + 1`.
    pub async fn update<F, E>(&self, id: &D::Id, mut updater: F) -> Result<D, UpdateError<E>>
    where
        F: FnMut(D) -> Result<D, E>,
    {
        let attempts = self.policy.attempts();

        for attempt in 1..=attempts {
            let current = self.store.find_by_id(id).await?;
            let expected = current.version();

            let mut updated = updater(current).map_err(UpdateError::Updater)?;
            if updated.version() <= expected {
                updated.set_version(expected + 1);
            }

            if self.store.update_if_version(&updated, expected).await? > 0 {
                return Ok(updated);
            }

            debug!(
                entity = D::COLLECTION,
                id = %id,
                attempt,
                expected_version = expected,
                "optimistic lock conflict, retrying"
            );
            self.policy.backoff(attempt).await;
        }

        warn!(
            entity = D::COLLECTION,
            id = %id,
            attempts,
            "optimistic lock retries exhausted"
        );
        Err(UpdateError::OptimisticLockExhausted {
            entity: D::COLLECTION,
            id: id.to_string(),
            attempts,
        })
    }
}
