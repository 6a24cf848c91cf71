use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

use eventide_core::{EventId, ExpectedVersion, StreamId, TenantId};
use eventide_events::{Event, EventEnvelope};

/// An event ready to be appended to a stream (not yet assigned a version).
///
/// ## Event Lifecycle
///
/// 1. **Domain event**: raised by an aggregate command method
/// 2. **UncommittedEvent**: serialized payload + optional tracing metadata
/// 3. **StoredEvent**: persisted with its assigned stream version
/// 4. **EventEnvelope**: staged in the outbox and published to consumers
///
/// Use [`UncommittedEvent::from_typed`] to build one from a typed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,

    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub tenant_id: Option<TenantId>,
    pub metadata: Option<Map<String, JsonValue>>,
}

impl UncommittedEvent {
    pub fn new(
        event_type: impl Into<String>,
        occurred_at: DateTime<Utc>,
        payload: JsonValue,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            occurred_at,
            payload,
            correlation_id: None,
            causation_id: None,
            tenant_id: None,
            metadata: None,
        }
    }

    /// Serialize a typed event, capturing the type tag and business time.
    pub fn from_typed<E>(event: &E) -> Result<Self, EventStoreError>
    where
        E: Event,
    {
        let payload = event
            .to_payload()
            .map_err(|e| EventStoreError::Serialization(format!("{}: {e}", event.event_type())))?;

        Ok(Self::new(event.event_type(), event.occurred_at(), payload))
    }

    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, JsonValue>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Stamp the stream position assigned by the store.
    pub(crate) fn commit(self, stream_id: StreamId, version: u64) -> StoredEvent {
        StoredEvent {
            event_id: self.event_id,
            stream_id,
            version,
            event_type: self.event_type,
            occurred_at: self.occurred_at,
            payload: self.payload,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            tenant_id: self.tenant_id,
            metadata: self.metadata,
        }
    }
}

/// A stored event in an append-only stream.
///
/// ## Versions
///
/// Versions are assigned by the store during append and are:
/// - **0-based and contiguous**: the first event of a stream is version 0
/// - **Stream-scoped**: each stream counts independently
/// - **Immutable**: once assigned, never change
///
/// A stream's version (its length) is therefore `last.version + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub stream_id: StreamId,
    pub version: u64,

    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,

    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub tenant_id: Option<TenantId>,
    pub metadata: Option<Map<String, JsonValue>>,
}

impl StoredEvent {
    /// Convert a stored event into the envelope staged in the outbox.
    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope::new(
            self.event_id,
            self.event_type.clone(),
            self.stream_id.clone(),
            self.version,
            self.occurred_at,
            self.payload.clone(),
        )
        .with_correlation_id(self.correlation_id)
        .with_causation_id(self.causation_id)
        .with_tenant_id(self.tenant_id)
        .with_metadata(self.metadata.clone())
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to
/// domain errors (validation, invariants).
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The stream moved since the caller loaded it. Never retried by the
    /// store: reload the aggregate, reapply the command, resubmit.
    #[error(
        "optimistic concurrency check failed on stream '{stream_id}': expected {expected:?}, found {actual}"
    )]
    Concurrency {
        stream_id: StreamId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event serialization failed: {0}")]
    Serialization(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl EventStoreError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, EventStoreError::Concurrency { .. })
    }
}

/// Append-only event store.
///
/// ## Append Semantics
///
/// `append()`:
/// - checks the stream's current version against `expected_version`
/// - assigns versions `current, current + 1, …`
/// - persists the batch atomically (all or nothing)
/// - stages one outbox message per committed event when the store is wired
///   to an outbox (same atomic unit)
///
/// ## Load Semantics
///
/// `get_events()` returns events with `version >= from_version` in ascending
/// version order; an unknown stream is simply empty.
///
/// No update or delete operation exists.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    async fn get_events(
        &self,
        stream_id: &StreamId,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Number of events in the stream (0 for unknown streams).
    async fn stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(stream_id, events, expected_version).await
    }

    async fn get_events(
        &self,
        stream_id: &StreamId,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).get_events(stream_id, from_version).await
    }

    async fn stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError> {
        (**self).stream_version(stream_id).await
    }
}
