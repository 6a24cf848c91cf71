//! Postgres-backed snapshot store. State is stored as JSONB.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use eventide_core::StreamId;

use super::{Snapshot, SnapshotError, SnapshotStore};

pub struct PostgresSnapshotStore<S> {
    pool: Arc<PgPool>,
    _state: PhantomData<fn() -> S>,
}

impl<S> PostgresSnapshotStore<S> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            _state: PhantomData,
        }
    }
}

impl<S> Clone for PostgresSnapshotStore<S> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _state: PhantomData,
        }
    }
}

impl<S> core::fmt::Debug for PostgresSnapshotStore<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresSnapshotStore").finish_non_exhaustive()
    }
}

fn snapshot_from_row<S: DeserializeOwned>(
    aggregate_id: &StreamId,
    row: &PgRow,
) -> Result<Snapshot<S>, SnapshotError> {
    let version: i64 = row.try_get("version").map_err(storage_error)?;
    let state: serde_json::Value = row.try_get("state").map_err(storage_error)?;

    Ok(Snapshot {
        aggregate_id: aggregate_id.clone(),
        version: version as u64,
        state: serde_json::from_value(state)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?,
        taken_at: row.try_get("taken_at").map_err(storage_error)?,
    })
}

fn storage_error(err: sqlx::Error) -> SnapshotError {
    SnapshotError::Storage(err.to_string())
}

#[async_trait]
impl<S> SnapshotStore<S> for PostgresSnapshotStore<S>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    #[instrument(
        skip(self, snapshot),
        fields(aggregate_id = %snapshot.aggregate_id, version = snapshot.version),
        err
    )]
    async fn save(&self, snapshot: Snapshot<S>) -> Result<(), SnapshotError> {
        let state = serde_json::to_value(&snapshot.state)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, version, state, taken_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_id, version)
            DO UPDATE SET state = EXCLUDED.state, taken_at = EXCLUDED.taken_at
            "#,
        )
        .bind(snapshot.aggregate_id.as_str())
        .bind(snapshot.version as i64)
        .bind(state)
        .bind(snapshot.taken_at)
        .execute(&*self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    async fn find_latest(&self, aggregate_id: &StreamId) -> Result<Option<Snapshot<S>>, SnapshotError> {
        let row = sqlx::query(
            r#"
            SELECT version, state, taken_at
            FROM snapshots
            WHERE aggregate_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage_error)?;

        row.map(|r| snapshot_from_row(aggregate_id, &r)).transpose()
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    async fn find_by_version(
        &self,
        aggregate_id: &StreamId,
        version: u64,
    ) -> Result<Option<Snapshot<S>>, SnapshotError> {
        let row = sqlx::query(
            "SELECT version, state, taken_at FROM snapshots WHERE aggregate_id = $1 AND version = $2",
        )
        .bind(aggregate_id.as_str())
        .bind(version as i64)
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage_error)?;

        row.map(|r| snapshot_from_row(aggregate_id, &r)).transpose()
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    async fn delete(&self, aggregate_id: &StreamId) -> Result<(), SnapshotError> {
        sqlx::query("DELETE FROM snapshots WHERE aggregate_id = $1")
            .bind(aggregate_id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}
