use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use eventide_core::{Clock, ExpectedVersion, StreamId, SystemClock};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
use crate::outbox::{InMemoryOutboxStore, OutboxMessage};

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
///
/// When built with [`with_outbox`](Self::with_outbox), every successful append
/// stages one outbox message per committed event while the stream write lock
/// is still held, so no committed event can be observed without its outbox row.
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamId, Vec<StoredEvent>>>,
    outbox: Option<Arc<InMemoryOutboxStore>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            outbox: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_outbox(outbox: Arc<InMemoryOutboxStore>) -> Self {
        Self {
            outbox: Some(outbox),
            ..Self::new()
        }
    }

    /// Clock used to stamp `created_at` on staged outbox messages.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Stream ids known to the store, sorted.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let streams = self.streams.read().unwrap_or_else(|p| p.into_inner());
        let mut ids: Vec<StreamId> = streams.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("streams", &self.stream_ids().len())
            .field("outbox", &self.outbox.is_some())
            .finish()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let current = streams.get(stream_id).map(|s| s.len() as u64).unwrap_or(0);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency {
                stream_id: stream_id.clone(),
                expected: expected_version,
                actual: current,
            });
        }

        if events.is_empty() {
            return Ok(vec![]);
        }

        // Assign versions and append (append-only).
        let committed: Vec<StoredEvent> = events
            .into_iter()
            .enumerate()
            .map(|(i, e)| e.commit(stream_id.clone(), current + i as u64))
            .collect();

        streams
            .entry(stream_id.clone())
            .or_default()
            .extend(committed.iter().cloned());

        if let Some(outbox) = &self.outbox {
            let now = self.clock.now();
            outbox.stage(
                committed
                    .iter()
                    .map(|e| OutboxMessage::new(e.to_envelope(), now)),
            );
        }

        tracing::debug!(
            stream_id = %stream_id,
            appended = committed.len(),
            version = current + committed.len() as u64,
            "appended events"
        );

        Ok(committed)
    }

    async fn get_events(
        &self,
        stream_id: &StreamId,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        Ok(streams
            .get(stream_id)
            .map(|s| {
                s.iter()
                    .skip(usize::try_from(from_version).unwrap_or(usize::MAX))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        Ok(streams.get(stream_id).map(|s| s.len() as u64).unwrap_or(0))
    }
}
