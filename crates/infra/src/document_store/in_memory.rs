use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{Document, DocumentStore, StoreError};

/// In-memory versioned document store.
///
/// Intended for tests/dev. The conditional update has the same semantics as
/// the database backends.
#[derive(Debug)]
pub struct InMemoryDocumentStore<D: Document> {
    documents: RwLock<HashMap<D::Id, D>>,
}

impl<D: Document> Default for InMemoryDocumentStore<D> {
    fn default() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
        }
    }
}

impl<D: Document> InMemoryDocumentStore<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<D: Document> DocumentStore<D> for InMemoryDocumentStore<D> {
    async fn find_by_id(&self, id: &D::Id) -> Result<D, StoreError> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        documents
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(D::COLLECTION, id))
    }

    async fn insert(&self, document: &D) -> Result<(), StoreError> {
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        if documents.contains_key(document.id()) {
            return Err(StoreError::Duplicate {
                entity: D::COLLECTION.to_string(),
                details: format!("duplicate key id='{}'", document.id()),
            });
        }
        documents.insert(document.id().clone(), document.clone());
        Ok(())
    }

    async fn update_if_version(&self, document: &D, expected_version: u64) -> Result<u64, StoreError> {
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        match documents.get_mut(document.id()) {
            Some(stored) if stored.version() == expected_version => {
                *stored = document.clone();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn remove(&self, id: &D::Id) -> Result<(), StoreError> {
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        documents
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(D::COLLECTION, id))
    }
}
