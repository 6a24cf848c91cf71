use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{ReadModel, ReadModelError, ReadModelStore};

/// In-memory read model store for tests/dev.
#[derive(Debug)]
pub struct InMemoryReadModelStore<T> {
    rows: RwLock<BTreeMap<String, T>>,
}

impl<T> InMemoryReadModelStore<T> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T> Default for InMemoryReadModelStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> ReadModelError {
    ReadModelError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl<T: ReadModel> ReadModelStore<T> for InMemoryReadModelStore<T> {
    async fn save(&self, model: T) -> Result<(), ReadModelError> {
        self.rows
            .write()
            .map_err(|_| poisoned())?
            .insert(model.id().to_string(), model);
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<T>, ReadModelError> {
        Ok(self.rows.read().map_err(|_| poisoned())?.get(id).cloned())
    }

    async fn find_all(&self) -> Result<Vec<T>, ReadModelError> {
        Ok(self
            .rows
            .read()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<bool, ReadModelError> {
        Ok(self
            .rows
            .write()
            .map_err(|_| poisoned())?
            .remove(id)
            .is_some())
    }

    async fn size(&self) -> Result<usize, ReadModelError> {
        Ok(self.rows.read().map_err(|_| poisoned())?.len())
    }

    async fn clear(&self) -> Result<(), ReadModelError> {
        self.rows.write().map_err(|_| poisoned())?.clear();
        Ok(())
    }
}
