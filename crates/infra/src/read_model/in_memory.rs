use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{ReadModel, ReadModelError, ReadRepository};

/// In-memory read model storage for tests/dev.
#[derive(Debug)]
pub struct InMemoryReadRepository<M> {
    models: RwLock<HashMap<String, M>>,
}

impl<M> InMemoryReadRepository<M> {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.models.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M> Default for InMemoryReadRepository<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<M: ReadModel> ReadRepository<M> for InMemoryReadRepository<M> {
    async fn find(&self, id: &str) -> Result<M, ReadModelError> {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        models
            .get(id)
            .cloned()
            .ok_or_else(|| ReadModelError::NotFound { id: id.to_string() })
    }

    async fn find_all(&self) -> Result<Vec<M>, ReadModelError> {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<M> = models.values().cloned().collect();
        all.sort_by(|a, b| a.entity_id().cmp(b.entity_id()));
        Ok(all)
    }

    async fn save(&self, model: M) -> Result<(), ReadModelError> {
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        models.insert(model.entity_id().to_string(), model);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), ReadModelError> {
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        models
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ReadModelError::NotFound { id: id.to_string() })
    }
}
