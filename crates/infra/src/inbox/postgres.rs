//! Postgres-backed inbox store. Duplicate detection is
//! `INSERT … ON CONFLICT (event_id) DO NOTHING`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use eventide_core::{EventId, MessageId};

use super::store::{InboxError, InboxMessage, InboxSave, InboxStore};

#[derive(Debug, Clone)]
pub struct PostgresInboxStore {
    pool: Arc<PgPool>,
}

impl PostgresInboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl InboxStore for PostgresInboxStore {
    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn is_duplicate(&self, event_id: EventId) -> Result<bool, InboxError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM inbox_messages WHERE event_id = $1)")
            .bind(event_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(storage_error)
    }

    #[instrument(skip(self, message), fields(event_id = %message.event_id()), err)]
    async fn save(&self, message: InboxMessage) -> Result<InboxSave, InboxError> {
        let envelope = serde_json::to_value(&message.envelope)
            .map_err(|e| InboxError::Storage(format!("envelope serialization: {e}")))?;

        let result = sqlx::query(
            r#"
            INSERT INTO inbox_messages (event_id, id, envelope, received_at, processed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(message.event_id().as_uuid())
        .bind(message.id.as_uuid())
        .bind(envelope)
        .bind(message.received_at)
        .bind(message.processed_at)
        .execute(&*self.pool)
        .await
        .map_err(storage_error)?;

        Ok(if result.rows_affected() == 1 {
            InboxSave::Recorded
        } else {
            InboxSave::Duplicate
        })
    }

    #[instrument(skip(self), fields(message_id = %id), err)]
    async fn mark_as_processed(&self, id: MessageId, at: DateTime<Utc>) -> Result<(), InboxError> {
        let result = sqlx::query(
            "UPDATE inbox_messages SET processed_at = COALESCE(processed_at, $2) WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(InboxError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn release(&self, event_id: EventId) -> Result<(), InboxError> {
        sqlx::query("DELETE FROM inbox_messages WHERE event_id = $1 AND processed_at IS NULL")
            .bind(event_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn get(&self, event_id: EventId) -> Result<Option<InboxMessage>, InboxError> {
        let row = sqlx::query(
            "SELECT id, envelope, received_at, processed_at FROM inbox_messages WHERE event_id = $1",
        )
        .bind(event_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage_error)?;

        row.as_ref().map(message_from_row).transpose()
    }
}

fn message_from_row(row: &PgRow) -> Result<InboxMessage, InboxError> {
    let envelope: serde_json::Value = row.try_get("envelope").map_err(storage_error)?;
    Ok(InboxMessage {
        id: MessageId::from_uuid(row.try_get("id").map_err(storage_error)?),
        envelope: serde_json::from_value(envelope)
            .map_err(|e| InboxError::Storage(format!("envelope decode: {e}")))?,
        received_at: row.try_get("received_at").map_err(storage_error)?,
        processed_at: row.try_get("processed_at").map_err(storage_error)?,
    })
}

fn storage_error(err: sqlx::Error) -> InboxError {
    InboxError::Storage(err.to_string())
}
