//! Aggregate capabilities for event-sourced domain models.

use core::fmt::Debug;

use crate::id::StreamId;

/// Aggregate root marker + minimal interface.
pub trait AggregateRoot {
    /// Returns the stream this aggregate is folded from.
    fn id(&self) -> &StreamId;

    /// Number of events applied so far (committed and pending).
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for an append.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (useful for migrations and imports).
    Any,
    /// Require the stream to hold exactly this many events.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

}

/// Event-sourced aggregate capability.
///
/// - **State mutation**: `apply(&mut self, event)` evolves state and must
///   advance `version()` by exactly one.
/// - **Decision logic**: command methods validate against current state and
///   call [`raise`](EventSourcedAggregate::raise), which applies the event
///   and buffers it until the repository commits it.
///
/// Rehydration folds the stored stream through `apply` in version order.
pub trait EventSourcedAggregate: AggregateRoot + Sized {
    type Event: Clone + Debug + Send + Sync;

    /// Create an empty aggregate (version 0) for the given stream.
    fn blank(id: StreamId) -> Self;

    /// Evolve in-memory state from a single event.
    fn apply(&mut self, event: &Self::Event);

    /// Events raised by command methods and not yet committed.
    fn pending_events(&self) -> &[Self::Event];

    fn pending_events_mut(&mut self) -> &mut Vec<Self::Event>;

    /// Apply an event and buffer it for commit.
    fn raise(&mut self, event: Self::Event) {
        self.apply(&event);
        self.pending_events_mut().push(event);
    }

    /// Drain the uncommitted buffer.
    fn take_pending_events(&mut self) -> Vec<Self::Event> {
        std::mem::take(self.pending_events_mut())
    }

    /// Version of the stream as last loaded/committed (excludes pending events).
    fn committed_version(&self) -> u64 {
        self.version() - self.pending_events().len() as u64
    }

    /// Fold a history of events into a blank aggregate.
    fn rehydrate<'a>(id: StreamId, history: impl IntoIterator<Item = &'a Self::Event>) -> Self
    where
        Self::Event: 'a,
    {
        let mut aggregate = Self::blank(id);
        for event in history {
            aggregate.apply(event);
        }
        aggregate
    }
}

/// Aggregates whose state can be materialized into a snapshot.
pub trait SnapshotCapable: EventSourcedAggregate {
    type State: Clone + Debug + Send + Sync + 'static;

    /// Capture the current state.
    fn snapshot_state(&self) -> Self::State;

    /// Rebuild an aggregate at `version` from a captured state.
    fn restore(id: StreamId, version: u64, state: Self::State) -> Self;
}
