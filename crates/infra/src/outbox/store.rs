//! Outbox storage implementations.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use eventide_core::MessageId;

use super::types::{OutboxMessage, OutboxStatus};

/// Outbox store abstraction.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a new pending message.
    async fn save(&self, message: OutboxMessage) -> Result<MessageId, OutboxStoreError>;

    /// Up to `limit` pending messages, oldest first.
    async fn get_unpublished(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError>;

    /// Mark a message delivered. Marking an already published message is a no-op.
    async fn mark_as_published(
        &self,
        id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError>;

    /// Record a failed publish: increments `attempts`, stamps `last_attempt_at`.
    async fn mark_as_failed(
        &self,
        id: MessageId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError>;

    /// Move a message to the dead-letter state. It is never returned by
    /// `get_unpublished` again.
    async fn mark_as_dead_lettered(
        &self,
        id: MessageId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError>;

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError>;

    /// Dead-lettered messages, oldest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError>;
}

/// Outbox store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("outbox message not found: {0}")]
    NotFound(MessageId),
    #[error("outbox message already exists: {0}")]
    AlreadyExists(MessageId),
    #[error("outbox message {id} cannot transition from {status:?}")]
    InvalidTransition { id: MessageId, status: OutboxStatus },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Outbox statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub retrying: usize,
    pub published: usize,
    pub dead_lettered: usize,
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn save(&self, message: OutboxMessage) -> Result<MessageId, OutboxStoreError> {
        (**self).save(message).await
    }

    async fn get_unpublished(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        (**self).get_unpublished(limit).await
    }

    async fn mark_as_published(
        &self,
        id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        (**self).mark_as_published(id, at).await
    }

    async fn mark_as_failed(
        &self,
        id: MessageId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        (**self).mark_as_failed(id, error, at).await
    }

    async fn mark_as_dead_lettered(
        &self,
        id: MessageId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        (**self).mark_as_dead_lettered(id, reason, at).await
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        (**self).get(id).await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        (**self).dead_letters(limit).await
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        (**self).stats().await
    }
}

#[derive(Debug, Default)]
struct Inner {
    messages: HashMap<MessageId, OutboxMessage>,
    /// Insertion order; the outbox is drained oldest first.
    order: Vec<MessageId>,
    positions: HashMap<MessageId, usize>,
    /// Positions in `order` of messages that are still pending.
    pending: BTreeSet<usize>,
}

impl Inner {
    fn insert(&mut self, message: OutboxMessage) {
        let position = self.order.len();
        self.order.push(message.id);
        self.positions.insert(message.id, position);
        if message.is_pending() {
            self.pending.insert(position);
        }
        self.messages.insert(message.id, message);
    }

    /// Drop a message that reached a terminal status from the pending index.
    fn settle(&mut self, id: MessageId) {
        if let Some(position) = self.positions.get(&id) {
            self.pending.remove(position);
        }
    }

    fn pending(&self) -> impl Iterator<Item = &OutboxMessage> {
        self.pending
            .iter()
            .filter_map(|&position| self.order.get(position))
            .filter_map(|id| self.messages.get(id))
    }

    fn get_mut(&mut self, id: MessageId) -> Result<&mut OutboxMessage, OutboxStoreError> {
        self.messages
            .get_mut(&id)
            .ok_or(OutboxStoreError::NotFound(id))
    }

    fn ordered(&self) -> impl Iterator<Item = &OutboxMessage> {
        self.order.iter().filter_map(|id| self.messages.get(id))
    }
}

/// In-memory outbox store for tests/dev.
///
/// When an [`InMemoryEventStore`](crate::event_store::InMemoryEventStore) is
/// wired to this outbox, it stages rows from inside its append.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    inner: RwLock<Inner>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        // Every mutation leaves `Inner` consistent, so a poisoned lock is safe to reuse.
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Stage messages for committed events. Infallible so the event store can
    /// call it while holding its own stream lock.
    pub(crate) fn stage(&self, messages: impl IntoIterator<Item = OutboxMessage>) {
        let mut inner = self.write();
        for message in messages {
            inner.insert(message);
        }
    }

    /// Copies of every message, oldest first.
    pub fn all(&self) -> Vec<OutboxMessage> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner.ordered().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .map(|i| i.messages.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn save(&self, message: OutboxMessage) -> Result<MessageId, OutboxStoreError> {
        let mut inner = self.write();
        if inner.messages.contains_key(&message.id) {
            return Err(OutboxStoreError::AlreadyExists(message.id));
        }
        let id = message.id;
        inner.insert(message);
        Ok(id)
    }

    async fn get_unpublished(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))?;

        Ok(inner
            .pending()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_as_published(
        &self,
        id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let mut inner = self.write();
        let message = inner.get_mut(id)?;
        match message.status() {
            OutboxStatus::Published => Ok(()),
            OutboxStatus::DeadLettered => Err(OutboxStoreError::InvalidTransition {
                id,
                status: OutboxStatus::DeadLettered,
            }),
            OutboxStatus::Pending { .. } => {
                message.mark_published(at);
                inner.settle(id);
                Ok(())
            }
        }
    }

    async fn mark_as_failed(
        &self,
        id: MessageId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let mut inner = self.write();
        let message = inner.get_mut(id)?;
        let status = message.status();
        if status.is_terminal() {
            return Err(OutboxStoreError::InvalidTransition { id, status });
        }
        message.mark_failed(error.to_string(), at);
        Ok(())
    }

    async fn mark_as_dead_lettered(
        &self,
        id: MessageId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let mut inner = self.write();
        let message = inner.get_mut(id)?;
        match message.status() {
            OutboxStatus::DeadLettered => Ok(()),
            OutboxStatus::Published => Err(OutboxStoreError::InvalidTransition {
                id,
                status: OutboxStatus::Published,
            }),
            OutboxStatus::Pending { .. } => {
                message.mark_dead_lettered(reason.to_string(), at);
                inner.settle(id);
                Ok(())
            }
        }
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))?;
        Ok(inner.messages.get(&id).cloned())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))?;

        Ok(inner
            .ordered()
            .filter(|m| m.status() == OutboxStatus::DeadLettered)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))?;

        let mut stats = OutboxStats::default();
        for message in inner.messages.values() {
            match message.status() {
                OutboxStatus::Pending { attempts: 0 } => stats.pending += 1,
                OutboxStatus::Pending { .. } => stats.retrying += 1,
                OutboxStatus::Published => stats.published += 1,
                OutboxStatus::DeadLettered => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventide_core::{EventId, StreamId};
    use eventide_events::EventEnvelope;
    use serde_json::json;

    fn message(version: u64) -> OutboxMessage {
        let env = EventEnvelope::new(
            EventId::new(),
            "order.placed",
            StreamId::new("order-1").unwrap(),
            version,
            Utc::now(),
            json!({ "n": version }),
        );
        OutboxMessage::new(env, Utc::now())
    }

    #[tokio::test]
    async fn unpublished_is_oldest_first_and_limited() {
        let store = InMemoryOutboxStore::new();
        for v in 0..5 {
            store.save(message(v)).await.unwrap();
        }

        let batch = store.get_unpublished(3).await.unwrap();
        let versions: Vec<u64> = batch.iter().map(|m| m.envelope.aggregate_version()).collect();
        assert_eq!(versions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn published_and_dead_lettered_leave_the_unpublished_set() {
        let store = InMemoryOutboxStore::new();
        let a = store.save(message(0)).await.unwrap();
        let b = store.save(message(1)).await.unwrap();
        let c = store.save(message(2)).await.unwrap();
        let now = Utc::now();

        store.mark_as_published(a, now).await.unwrap();
        store.mark_as_failed(b, "timeout", now).await.unwrap();
        store.mark_as_dead_lettered(c, "max attempts exceeded", now).await.unwrap();

        let pending: Vec<MessageId> = store
            .get_unpublished(10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(pending, vec![b]);

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            OutboxStats {
                pending: 0,
                retrying: 1,
                published: 1,
                dead_lettered: 1,
            }
        );
        assert_eq!(store.dead_letters(10).await.unwrap()[0].id, c);
    }

    #[tokio::test]
    async fn pending_index_only_holds_undelivered_messages() {
        let store = InMemoryOutboxStore::new();
        let mut ids = Vec::new();
        for v in 0..6 {
            ids.push(store.save(message(v)).await.unwrap());
        }
        let now = Utc::now();
        for &id in ids.iter().step_by(2) {
            store.mark_as_published(id, now).await.unwrap();
        }
        store.mark_as_dead_lettered(ids[5], "poison", now).await.unwrap();
        store.mark_as_failed(ids[1], "timeout", now).await.unwrap();

        assert_eq!(store.inner.read().unwrap().pending.len(), 2);
        let versions: Vec<u64> = store
            .get_unpublished(10)
            .await
            .unwrap()
            .iter()
            .map(|m| m.envelope.aggregate_version())
            .collect();
        assert_eq!(versions, vec![1, 3]);

        store.save(message(6)).await.unwrap();
        let versions: Vec<u64> = store
            .get_unpublished(2)
            .await
            .unwrap()
            .iter()
            .map(|m| m.envelope.aggregate_version())
            .collect();
        assert_eq!(versions, vec![1, 3]);
        assert_eq!(store.inner.read().unwrap().pending.len(), 3);
    }

    #[tokio::test]
    async fn published_messages_are_immutable() {
        let store = InMemoryOutboxStore::new();
        let id = store.save(message(0)).await.unwrap();
        let first = Utc::now();
        store.mark_as_published(id, first).await.unwrap();

        // A second publish mark keeps the original timestamp.
        store
            .mark_as_published(id, first + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().published_at, Some(first));

        let err = store.mark_as_failed(id, "late", first).await.unwrap_err();
        assert!(matches!(err, OutboxStoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = InMemoryOutboxStore::new();
        let err = store
            .mark_as_published(MessageId::new(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxStoreError::NotFound(_)));
    }
}
