//! Postgres-backed event store implementation.
//!
//! ## Append
//!
//! One transaction per append:
//!
//! 1. ensure the `event_streams` head row exists
//! 2. advance the head with a compare-and-swap
//!    (`UPDATE event_streams … WHERE version = $expected`)
//! 3. insert the events with their assigned versions
//! 4. insert one `outbox_messages` row per event
//! 5. commit
//!
//! A CAS that matches no row means another writer moved the stream first.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | EventStoreError |
//! |------------|-----------------|-----------------|
//! | Database (unique violation on `(stream_id, version)`) | `23505` | `Concurrency` |
//! | Database (any other unique violation, e.g. event id) | `23505` | `InvalidAppend` |
//! | Database (check violation) | `23514` | `InvalidAppend` |
//! | Any other | – | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use eventide_core::{Clock, EventId, ExpectedVersion, StreamId, SystemClock, TenantId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
use crate::db::schema::EVENTS_STREAM_VERSION_KEY;
use crate::db::{is_unique_violation, violated_constraint};
use crate::outbox::OutboxMessage;

/// Postgres-backed append-only event store.
///
/// Writes the transactional outbox in the same transaction as the events
/// unless built with [`without_outbox`](Self::without_outbox).
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    write_outbox: bool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: Arc::new(SystemClock),
            write_outbox: true,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Skip outbox rows (bulk imports whose events must not be re-published).
    pub fn without_outbox(mut self) -> Self {
        self.write_outbox = false;
        self
    }

    async fn concurrency_error(
        &self,
        tx: Transaction<'_, Postgres>,
        stream_id: &StreamId,
        expected: ExpectedVersion,
    ) -> EventStoreError {
        // Report the version seen by a fresh read, outside the failed CAS.
        let _ = tx.rollback().await;
        let actual = self.stream_version(stream_id).await.unwrap_or_default();
        EventStoreError::Concurrency {
            stream_id: stream_id.clone(),
            expected,
            actual,
        }
    }
}

impl core::fmt::Debug for PostgresEventStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresEventStore")
            .field("write_outbox", &self.write_outbox)
            .finish()
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, events),
        fields(
            stream_id = %stream_id,
            event_count = events.len(),
            expected_version = ?expected_version,
            committed_events = tracing::field::Empty
        ),
        err
    )]
    async fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            let current = self.stream_version(stream_id).await?;
            if !expected_version.matches(current) {
                return Err(EventStoreError::Concurrency {
                    stream_id: stream_id.clone(),
                    expected: expected_version,
                    actual: current,
                });
            }
            return Ok(vec![]);
        }

        let count = events.len() as i64;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            "INSERT INTO event_streams (stream_id, version) VALUES ($1, 0) ON CONFLICT (stream_id) DO NOTHING",
        )
        .bind(stream_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("ensure_stream", e))?;

        let start: Option<i64> = match expected_version {
            ExpectedVersion::Exact(expected) => sqlx::query_scalar(
                r#"
                UPDATE event_streams
                SET version = version + $2, updated_at = NOW()
                WHERE stream_id = $1 AND version = $3
                RETURNING version - $2
                "#,
            )
            .bind(stream_id.as_str())
            .bind(count)
            .bind(expected as i64)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advance_stream", e))?,
            ExpectedVersion::Any => sqlx::query_scalar(
                r#"
                UPDATE event_streams
                SET version = version + $2, updated_at = NOW()
                WHERE stream_id = $1
                RETURNING version - $2
                "#,
            )
            .bind(stream_id.as_str())
            .bind(count)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advance_stream", e))?,
        };

        let Some(start) = start else {
            return Err(self
                .concurrency_error(tx, stream_id, expected_version)
                .await);
        };
        let start = start as u64;

        let mut committed = Vec::with_capacity(events.len());
        for (i, event) in events.into_iter().enumerate() {
            let stored = event.commit(stream_id.clone(), start + i as u64);

            let inserted = sqlx::query(
                r#"
                INSERT INTO events (
                    event_id, stream_id, version, event_type, occurred_at, payload,
                    correlation_id, causation_id, tenant_id, metadata
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(stored.event_id.as_uuid())
            .bind(stream_id.as_str())
            .bind(stored.version as i64)
            .bind(&stored.event_type)
            .bind(stored.occurred_at)
            .bind(&stored.payload)
            .bind(stored.correlation_id)
            .bind(stored.causation_id)
            .bind(stored.tenant_id.map(|t| *t.as_uuid()))
            .bind(stored.metadata.clone().map(serde_json::Value::Object))
            .execute(&mut *tx)
            .await;

            if let Err(e) = inserted {
                if is_unique_violation(&e) {
                    if is_version_conflict(violated_constraint(&e)) {
                        return Err(self
                            .concurrency_error(tx, stream_id, expected_version)
                            .await);
                    }
                    return Err(EventStoreError::InvalidAppend(format!(
                        "event {} violates {}",
                        stored.event_id,
                        violated_constraint(&e).unwrap_or("a unique constraint")
                    )));
                }
                return Err(map_sqlx_error("insert_event", e));
            }

            committed.push(stored);
        }

        if self.write_outbox {
            let now = self.clock.now();
            for stored in &committed {
                let message = OutboxMessage::new(stored.to_envelope(), now);
                let envelope = serde_json::to_value(&message.envelope)
                    .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

                sqlx::query(
                    r#"
                    INSERT INTO outbox_messages (id, event_id, envelope, created_at)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(message.id.as_uuid())
                .bind(stored.event_id.as_uuid())
                .bind(envelope)
                .bind(message.created_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_outbox", e))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("committed_events", committed.len());
        Ok(committed)
    }

    #[instrument(skip(self), fields(stream_id = %stream_id), err)]
    async fn get_events(
        &self,
        stream_id: &StreamId,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id, stream_id, version, event_type, occurred_at, payload,
                correlation_id, causation_id, tenant_id, metadata
            FROM events
            WHERE stream_id = $1 AND version >= $2
            ORDER BY version ASC
            "#,
        )
        .bind(stream_id.as_str())
        .bind(from_version as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_events", e))?;

        rows.iter()
            .map(|row| {
                stored_event_from_row(row).map_err(|e| {
                    EventStoreError::Storage(format!("failed to decode event row: {e}"))
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(stream_id = %stream_id), err)]
    async fn stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM event_streams WHERE stream_id = $1")
                .bind(stream_id.as_str())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("stream_version", e))?;

        Ok(version.unwrap_or(0) as u64)
    }
}

fn stored_event_from_row(row: &PgRow) -> Result<StoredEvent, sqlx::Error> {
    let stream_id: String = row.try_get("stream_id")?;
    let version: i64 = row.try_get("version")?;
    let tenant_id: Option<Uuid> = row.try_get("tenant_id")?;
    let metadata: Option<serde_json::Value> = row.try_get("metadata")?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at")?;

    Ok(StoredEvent {
        event_id: EventId::from_uuid(row.try_get("event_id")?),
        stream_id: StreamId::new(stream_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        version: version as u64,
        event_type: row.try_get("event_type")?,
        occurred_at,
        payload: row.try_get("payload")?,
        correlation_id: row.try_get("correlation_id")?,
        causation_id: row.try_get("causation_id")?,
        tenant_id: tenant_id.map(TenantId::from_uuid),
        metadata: metadata.and_then(|m| match m {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        }),
    })
}

/// Only a clash on `(stream_id, version)` means another writer won the race.
fn is_version_conflict(constraint: Option<&str>) -> bool {
    constraint == Some(EVENTS_STREAM_VERSION_KEY)
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => EventStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_stream_version_key_is_a_concurrency_conflict() {
        assert!(is_version_conflict(Some(EVENTS_STREAM_VERSION_KEY)));
        assert!(!is_version_conflict(Some("events_pkey")));
        assert!(!is_version_conflict(None));
    }
}
