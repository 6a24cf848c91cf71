//! Postgres-backed outbox store.
//!
//! Rows are written by [`PostgresEventStore`](crate::event_store::PostgresEventStore)
//! inside the append transaction; this store reads and transitions them.
//! State transitions are guarded in SQL so a published row is never touched
//! again.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use eventide_core::MessageId;

use super::store::{OutboxStats, OutboxStore, OutboxStoreError};
use super::types::{OutboxMessage, OutboxStatus};
use crate::db::is_unique_violation;

const SELECT_COLUMNS: &str = r#"
    SELECT id, envelope, created_at, published_at, attempts,
           last_attempt_at, error, dead_lettered_at
    FROM outbox_messages
"#;

#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch(&self, sql: String, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(storage_error)?;

        rows.iter().map(message_from_row).collect()
    }

    /// Explain a transition that matched no row.
    async fn transition_error(&self, id: MessageId) -> OutboxStoreError {
        match self.get(id).await {
            Ok(Some(message)) => OutboxStoreError::InvalidTransition {
                id,
                status: message.status(),
            },
            Ok(None) => OutboxStoreError::NotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self, message), fields(message_id = %message.id), err)]
    async fn save(&self, message: OutboxMessage) -> Result<MessageId, OutboxStoreError> {
        let envelope = serde_json::to_value(&message.envelope)
            .map_err(|e| OutboxStoreError::Storage(format!("envelope serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id, event_id, envelope, created_at, published_at, attempts,
                last_attempt_at, error, dead_lettered_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(message.envelope.event_id().as_uuid())
        .bind(envelope)
        .bind(message.created_at)
        .bind(message.published_at)
        .bind(message.attempts as i32)
        .bind(message.last_attempt_at)
        .bind(&message.error)
        .bind(message.dead_lettered_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                OutboxStoreError::AlreadyExists(message.id)
            } else {
                storage_error(e)
            }
        })?;

        Ok(message.id)
    }

    #[instrument(skip(self), err)]
    async fn get_unpublished(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        self.fetch(
            format!(
                "{SELECT_COLUMNS} WHERE published_at IS NULL AND dead_lettered_at IS NULL ORDER BY seq ASC LIMIT $1"
            ),
            limit,
        )
        .await
    }

    #[instrument(skip(self), fields(message_id = %id), err)]
    async fn mark_as_published(
        &self,
        id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET published_at = $2, error = NULL
            WHERE id = $1 AND published_at IS NULL AND dead_lettered_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.transition_error(id).await {
            OutboxStoreError::InvalidTransition {
                status: OutboxStatus::Published,
                ..
            } => Ok(()),
            other => Err(other),
        }
    }

    #[instrument(skip(self, error), fields(message_id = %id), err)]
    async fn mark_as_failed(
        &self,
        id: MessageId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET attempts = attempts + 1, last_attempt_at = $2, error = $3
            WHERE id = $1 AND published_at IS NULL AND dead_lettered_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(self.transition_error(id).await)
        }
    }

    #[instrument(skip(self, reason), fields(message_id = %id), err)]
    async fn mark_as_dead_lettered(
        &self,
        id: MessageId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET dead_lettered_at = $2, error = $3
            WHERE id = $1 AND published_at IS NULL AND dead_lettered_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .bind(reason)
        .execute(&*self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.transition_error(id).await {
            OutboxStoreError::InvalidTransition {
                status: OutboxStatus::DeadLettered,
                ..
            } => Ok(()),
            other => Err(other),
        }
    }

    #[instrument(skip(self), fields(message_id = %id), err)]
    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage_error)?;

        row.as_ref().map(message_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        self.fetch(
            format!("{SELECT_COLUMNS} WHERE dead_lettered_at IS NOT NULL ORDER BY seq ASC LIMIT $1"),
            limit,
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE published_at IS NULL AND dead_lettered_at IS NULL AND attempts = 0) AS pending,
                COUNT(*) FILTER (WHERE published_at IS NULL AND dead_lettered_at IS NULL AND attempts > 0) AS retrying,
                COUNT(*) FILTER (WHERE published_at IS NOT NULL) AS published,
                COUNT(*) FILTER (WHERE published_at IS NULL AND dead_lettered_at IS NOT NULL) AS dead_lettered
            FROM outbox_messages
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(storage_error)?;

        let count = |name: &str| -> Result<usize, OutboxStoreError> {
            let n: i64 = row.try_get(name).map_err(storage_error)?;
            Ok(n as usize)
        };

        Ok(OutboxStats {
            pending: count("pending")?,
            retrying: count("retrying")?,
            published: count("published")?,
            dead_lettered: count("dead_lettered")?,
        })
    }
}

fn message_from_row(row: &PgRow) -> Result<OutboxMessage, OutboxStoreError> {
    let envelope: serde_json::Value = row.try_get("envelope").map_err(storage_error)?;
    let attempts: i32 = row.try_get("attempts").map_err(storage_error)?;

    Ok(OutboxMessage {
        id: MessageId::from_uuid(row.try_get("id").map_err(storage_error)?),
        envelope: serde_json::from_value(envelope)
            .map_err(|e| OutboxStoreError::Storage(format!("envelope decode: {e}")))?,
        created_at: row.try_get("created_at").map_err(storage_error)?,
        published_at: row.try_get("published_at").map_err(storage_error)?,
        attempts: attempts.max(0) as u32,
        last_attempt_at: row.try_get("last_attempt_at").map_err(storage_error)?,
        error: row.try_get("error").map_err(storage_error)?,
        dead_lettered_at: row.try_get("dead_lettered_at").map_err(storage_error)?,
    })
}

fn storage_error(err: sqlx::Error) -> OutboxStoreError {
    OutboxStoreError::Storage(err.to_string())
}
