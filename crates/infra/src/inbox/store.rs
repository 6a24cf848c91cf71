//! Inbox storage: the consumer-side dedupe log.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use eventide_core::{EventId, MessageId};
use eventide_events::EventEnvelope;

/// A received envelope, keyed by its `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: MessageId,
    pub envelope: EventEnvelope,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl InboxMessage {
    pub fn new(envelope: EventEnvelope, received_at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            envelope,
            received_at,
            processed_at: None,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.envelope.event_id()
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

/// Result of an atomic insert-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxSave {
    /// First sighting of this event id; the caller owns processing.
    Recorded,
    /// The event id was already claimed.
    Duplicate,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InboxError {
    #[error("inbox message not found: {0}")]
    NotFound(MessageId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Inbox store abstraction.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// `true` once any message with this event id has been saved (and not released).
    async fn is_duplicate(&self, event_id: EventId) -> Result<bool, InboxError>;

    /// Record `message` unless its event id is already present. Atomic.
    async fn save(&self, message: InboxMessage) -> Result<InboxSave, InboxError>;

    async fn mark_as_processed(&self, id: MessageId, at: DateTime<Utc>) -> Result<(), InboxError>;

    /// Forget an unprocessed claim so a redelivery can retry it.
    /// Processed messages are kept.
    async fn release(&self, event_id: EventId) -> Result<(), InboxError>;

    async fn get(&self, event_id: EventId) -> Result<Option<InboxMessage>, InboxError>;
}

#[async_trait]
impl<S> InboxStore for Arc<S>
where
    S: InboxStore + ?Sized,
{
    async fn is_duplicate(&self, event_id: EventId) -> Result<bool, InboxError> {
        (**self).is_duplicate(event_id).await
    }

    async fn save(&self, message: InboxMessage) -> Result<InboxSave, InboxError> {
        (**self).save(message).await
    }

    async fn mark_as_processed(&self, id: MessageId, at: DateTime<Utc>) -> Result<(), InboxError> {
        (**self).mark_as_processed(id, at).await
    }

    async fn release(&self, event_id: EventId) -> Result<(), InboxError> {
        (**self).release(event_id).await
    }

    async fn get(&self, event_id: EventId) -> Result<Option<InboxMessage>, InboxError> {
        (**self).get(event_id).await
    }
}

#[derive(Debug, Default)]
struct Inner {
    by_event: HashMap<EventId, InboxMessage>,
    by_id: HashMap<MessageId, EventId>,
}

/// In-memory inbox for tests/dev. One lock guards both indexes, so the
/// duplicate check and the insert are a single step.
#[derive(Debug, Default)]
pub struct InMemoryInboxStore {
    inner: Mutex<Inner>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, InboxError> {
        self.inner
            .lock()
            .map_err(|_| InboxError::Storage("lock poisoned".to_string()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.by_event.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn is_duplicate(&self, event_id: EventId) -> Result<bool, InboxError> {
        Ok(self.lock()?.by_event.contains_key(&event_id))
    }

    async fn save(&self, message: InboxMessage) -> Result<InboxSave, InboxError> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let id = message.id;
        let event_id = message.event_id();

        match inner.by_event.entry(event_id) {
            Entry::Occupied(_) => Ok(InboxSave::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(message);
                inner.by_id.insert(id, event_id);
                Ok(InboxSave::Recorded)
            }
        }
    }

    async fn mark_as_processed(&self, id: MessageId, at: DateTime<Utc>) -> Result<(), InboxError> {
        let mut inner = self.lock()?;
        let event_id = *inner.by_id.get(&id).ok_or(InboxError::NotFound(id))?;
        let message = inner
            .by_event
            .get_mut(&event_id)
            .ok_or(InboxError::NotFound(id))?;
        if message.processed_at.is_none() {
            message.processed_at = Some(at);
        }
        Ok(())
    }

    async fn release(&self, event_id: EventId) -> Result<(), InboxError> {
        let mut inner = self.lock()?;
        let releasable = inner
            .by_event
            .get(&event_id)
            .is_some_and(|m| !m.is_processed());
        if releasable {
            if let Some(message) = inner.by_event.remove(&event_id) {
                inner.by_id.remove(&message.id);
            }
        }
        Ok(())
    }

    async fn get(&self, event_id: EventId) -> Result<Option<InboxMessage>, InboxError> {
        Ok(self.lock()?.by_event.get(&event_id).cloned())
    }
}
