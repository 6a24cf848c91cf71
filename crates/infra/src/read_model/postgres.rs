//! Postgres-backed read model store.
//!
//! All read models share the `read_models` table, partitioned by a
//! `collection` name. Rows are stored as JSONB alongside the version and
//! update time so rebuild tooling can inspect them without decoding.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use super::{ReadModel, ReadModelError, ReadModelStore};

pub struct PostgresReadModelStore<T> {
    pool: Arc<PgPool>,
    collection: String,
    _model: PhantomData<fn() -> T>,
}

impl<T> PostgresReadModelStore<T> {
    pub fn new(pool: PgPool, collection: impl Into<String>) -> Self {
        Self {
            pool: Arc::new(pool),
            collection: collection.into(),
            _model: PhantomData,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl<T> Clone for PostgresReadModelStore<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            collection: self.collection.clone(),
            _model: PhantomData,
        }
    }
}

impl<T> core::fmt::Debug for PostgresReadModelStore<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresReadModelStore")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

fn model_from_row<T: DeserializeOwned>(row: &PgRow) -> Result<T, ReadModelError> {
    let data: serde_json::Value = row.try_get("data").map_err(storage_error)?;
    serde_json::from_value(data).map_err(|e| ReadModelError::Serialization(e.to_string()))
}

fn storage_error(err: sqlx::Error) -> ReadModelError {
    ReadModelError::Storage(err.to_string())
}

#[async_trait]
impl<T> ReadModelStore<T> for PostgresReadModelStore<T>
where
    T: ReadModel + Serialize + DeserializeOwned,
{
    #[instrument(skip(self, model), fields(collection = %self.collection, id = model.id()), err)]
    async fn save(&self, model: T) -> Result<(), ReadModelError> {
        let data =
            serde_json::to_value(&model).map_err(|e| ReadModelError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO read_models (collection, id, version, updated_at, data)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (collection, id)
            DO UPDATE SET version = EXCLUDED.version,
                          updated_at = EXCLUDED.updated_at,
                          data = EXCLUDED.data
            "#,
        )
        .bind(&self.collection)
        .bind(model.id())
        .bind(i64::try_from(model.version()).unwrap_or(i64::MAX))
        .bind(model.updated_at())
        .bind(data)
        .execute(&*self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    #[instrument(skip(self), fields(collection = %self.collection), err)]
    async fn find_by_id(&self, id: &str) -> Result<Option<T>, ReadModelError> {
        let row = sqlx::query("SELECT data FROM read_models WHERE collection = $1 AND id = $2")
            .bind(&self.collection)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage_error)?;

        row.as_ref().map(model_from_row).transpose()
    }

    #[instrument(skip(self), fields(collection = %self.collection), err)]
    async fn find_all(&self) -> Result<Vec<T>, ReadModelError> {
        let rows = sqlx::query("SELECT data FROM read_models WHERE collection = $1 ORDER BY id ASC")
            .bind(&self.collection)
            .fetch_all(&*self.pool)
            .await
            .map_err(storage_error)?;

        rows.iter().map(model_from_row).collect()
    }

    #[instrument(skip(self), fields(collection = %self.collection), err)]
    async fn delete(&self, id: &str) -> Result<bool, ReadModelError> {
        let result = sqlx::query("DELETE FROM read_models WHERE collection = $1 AND id = $2")
            .bind(&self.collection)
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(storage_error)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(collection = %self.collection), err)]
    async fn size(&self) -> Result<usize, ReadModelError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM read_models WHERE collection = $1")
            .bind(&self.collection)
            .fetch_one(&*self.pool)
            .await
            .map_err(storage_error)?
            .try_get("n")
            .map_err(storage_error)?;

        Ok(count.max(0) as usize)
    }

    #[instrument(skip(self), fields(collection = %self.collection), err)]
    async fn clear(&self) -> Result<(), ReadModelError> {
        sqlx::query("DELETE FROM read_models WHERE collection = $1")
            .bind(&self.collection)
            .execute(&*self.pool)
            .await
            .map_err(storage_error)?;

        Ok(())
    }
}
