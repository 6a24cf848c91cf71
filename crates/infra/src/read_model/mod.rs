//! Disposable read-model storage.
//!
//! Read models are rebuilt from events at any time, so stores only need
//! keyed upsert, lookup and wholesale clearing. Every read returns an owned
//! copy; callers never observe later writes through a returned value.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use in_memory::InMemoryReadModelStore;
pub use postgres::PostgresReadModelStore;

/// A row of a read model, keyed by `id`.
pub trait ReadModel: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Version of the last event folded into this row.
    fn version(&self) -> u64;

    fn updated_at(&self) -> DateTime<Utc>;
}

#[derive(Debug, Error)]
pub enum ReadModelError {
    #[error("read model serialization failed: {0}")]
    Serialization(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

#[async_trait]
pub trait ReadModelStore<T: ReadModel>: Send + Sync {
    /// Insert or replace the row with `model.id()`.
    async fn save(&self, model: T) -> Result<(), ReadModelError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<T>, ReadModelError>;

    /// Every row, ordered by id.
    async fn find_all(&self) -> Result<Vec<T>, ReadModelError>;

    /// Returns whether a row was removed.
    async fn delete(&self, id: &str) -> Result<bool, ReadModelError>;

    async fn size(&self) -> Result<usize, ReadModelError>;

    async fn clear(&self) -> Result<(), ReadModelError>;
}

#[async_trait]
impl<S, T> ReadModelStore<T> for Arc<S>
where
    S: ReadModelStore<T> + ?Sized,
    T: ReadModel,
{
    async fn save(&self, model: T) -> Result<(), ReadModelError> {
        (**self).save(model).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<T>, ReadModelError> {
        (**self).find_by_id(id).await
    }

    async fn find_all(&self) -> Result<Vec<T>, ReadModelError> {
        (**self).find_all().await
    }

    async fn delete(&self, id: &str) -> Result<bool, ReadModelError> {
        (**self).delete(id).await
    }

    async fn size(&self) -> Result<usize, ReadModelError> {
        (**self).size().await
    }

    async fn clear(&self) -> Result<(), ReadModelError> {
        (**self).clear().await
    }
}
