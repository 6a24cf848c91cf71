//! Load and commit event-sourced aggregates.
//!
//! ## Load
//!
//! 1. seed from the latest snapshot when snapshotting is enabled
//! 2. load the remaining events from the seeded version
//! 3. decode each payload through the aggregate's `EventRegistry`
//! 4. fold through `apply`
//!
//! ## Commit
//!
//! Appends the pending buffer with `ExpectedVersion::Exact(committed_version)`.
//! A concurrency failure leaves the buffer untouched: reload, reapply the
//! command, resubmit. After a successful append the snapshot policy runs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use eventide_core::{
    Clock, EventSourcedAggregate, ExpectedVersion, SnapshotCapable, StreamId, SystemClock,
    TenantId,
};
use eventide_events::{DecodeError, Event, EventRegistry};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
use crate::snapshot::{Snapshot, SnapshotError, SnapshotPolicy, SnapshotStore};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// The loaded stream is not contiguous with the aggregate's version.
    #[error("stream '{stream_id}' is corrupt: expected version {expected}, found {found}")]
    CorruptStream {
        stream_id: StreamId,
        expected: u64,
        found: u64,
    },
}

impl RepositoryError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, RepositoryError::Store(e) if e.is_concurrency())
    }
}

/// Envelope fields stamped on every event of one commit.
#[derive(Debug, Clone, Default)]
pub struct CommitContext {
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub tenant_id: Option<TenantId>,
    pub metadata: Option<Map<String, JsonValue>>,
}

impl CommitContext {
    fn stamp(&self, mut event: UncommittedEvent) -> UncommittedEvent {
        event.correlation_id = self.correlation_id;
        event.causation_id = self.causation_id;
        event.tenant_id = self.tenant_id;
        event.metadata = self.metadata.clone();
        event
    }
}

#[async_trait]
trait SnapshotHook<A>: Send + Sync {
    async fn restore(&self, id: &StreamId) -> Result<Option<A>, SnapshotError>;

    async fn after_commit(&self, aggregate: &A, previous_version: u64, taken_at: DateTime<Utc>);
}

struct Snapshotting<A: SnapshotCapable> {
    store: Arc<dyn SnapshotStore<A::State>>,
    policy: SnapshotPolicy,
}

#[async_trait]
impl<A> SnapshotHook<A> for Snapshotting<A>
where
    A: SnapshotCapable + Send + Sync + 'static,
    A::State: 'static,
{
    async fn restore(&self, id: &StreamId) -> Result<Option<A>, SnapshotError> {
        Ok(self
            .store
            .find_latest(id)
            .await?
            .map(|s| A::restore(id.clone(), s.version, s.state)))
    }

    async fn after_commit(&self, aggregate: &A, previous_version: u64, taken_at: DateTime<Utc>) {
        let version = aggregate.version();
        if !self.policy.should_snapshot(previous_version, version) {
            return;
        }

        let snapshot = Snapshot {
            aggregate_id: aggregate.id().clone(),
            version,
            state: aggregate.snapshot_state(),
            taken_at,
        };
        // The events are committed; a lost snapshot only costs replay time.
        match self.store.save(snapshot).await {
            Ok(()) => debug!(stream_id = %aggregate.id(), version, "snapshot taken"),
            Err(e) => warn!(stream_id = %aggregate.id(), version, error = %e, "snapshot failed"),
        }
    }
}

/// Repository for one aggregate type.
pub struct AggregateRepository<A: EventSourcedAggregate> {
    store: Arc<dyn EventStore>,
    registry: Arc<EventRegistry<A::Event>>,
    snapshots: Option<Arc<dyn SnapshotHook<A>>>,
    clock: Arc<dyn Clock>,
}

impl<A> AggregateRepository<A>
where
    A: EventSourcedAggregate + Send + Sync + 'static,
    A::Event: Event,
{
    pub fn new(store: Arc<dyn EventStore>, registry: EventRegistry<A::Event>) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            snapshots: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock used to stamp `taken_at` on snapshots.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &EventRegistry<A::Event> {
        &self.registry
    }

    /// Rehydrate the aggregate. An unknown stream yields a blank aggregate
    /// at version 0.
    pub async fn load(&self, id: &StreamId) -> Result<A, RepositoryError> {
        let mut aggregate = match &self.snapshots {
            Some(hook) => hook.restore(id).await?,
            None => None,
        }
        .unwrap_or_else(|| A::blank(id.clone()));

        let history = self.store.get_events(id, aggregate.version()).await?;
        for stored in &history {
            if stored.version != aggregate.version() {
                return Err(RepositoryError::CorruptStream {
                    stream_id: id.clone(),
                    expected: aggregate.version(),
                    found: stored.version,
                });
            }
            let event = self.registry.decode(&stored.event_type, &stored.payload)?;
            aggregate.apply(&event);
        }

        Ok(aggregate)
    }

    pub async fn commit(&self, aggregate: &mut A) -> Result<Vec<StoredEvent>, RepositoryError> {
        self.commit_with(aggregate, &CommitContext::default()).await
    }

    /// Append the pending events, stamping `context` on each.
    pub async fn commit_with(
        &self,
        aggregate: &mut A,
        context: &CommitContext,
    ) -> Result<Vec<StoredEvent>, RepositoryError> {
        if aggregate.pending_events().is_empty() {
            return Ok(vec![]);
        }

        let previous = aggregate.committed_version();
        let events = aggregate
            .pending_events()
            .iter()
            .map(|e| UncommittedEvent::from_typed(e).map(|u| context.stamp(u)))
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self
            .store
            .append(aggregate.id(), events, ExpectedVersion::Exact(previous))
            .await?;
        aggregate.take_pending_events();

        if let Some(hook) = &self.snapshots {
            hook.after_commit(aggregate, previous, self.clock.now()).await;
        }

        Ok(committed)
    }
}

impl<A> AggregateRepository<A>
where
    A: SnapshotCapable + Send + Sync + 'static,
    A::Event: Event,
    A::State: 'static,
{
    /// Seed loads from snapshots and take new ones per `policy` after commits.
    pub fn with_snapshots(
        mut self,
        store: Arc<dyn SnapshotStore<A::State>>,
        policy: SnapshotPolicy,
    ) -> Self {
        self.snapshots = Some(Arc::new(Snapshotting::<A> { store, policy }));
        self
    }
}
