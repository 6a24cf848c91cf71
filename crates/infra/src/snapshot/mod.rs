//! Aggregate snapshots: a cached fold of a stream prefix.
//!
//! A snapshot at `version = n` holds the state after applying events
//! `0..n`, so rehydration continues from `get_events(id, n)`.

pub mod in_memory;
pub mod policy;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use eventide_core::StreamId;

pub use in_memory::InMemorySnapshotStore;
pub use policy::{DEFAULT_SNAPSHOT_INTERVAL, SnapshotPolicy, should_take_snapshot};
pub use postgres::PostgresSnapshotStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<S> {
    pub aggregate_id: StreamId,
    pub version: u64,
    pub state: S,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot serialization failed: {0}")]
    Serialization(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

/// Snapshot store abstraction. Many snapshots per aggregate may coexist;
/// the latest by version wins. Saving the same version twice replaces it.
#[async_trait]
pub trait SnapshotStore<S>: Send + Sync
where
    S: Clone + Send + Sync + 'static,
{
    async fn save(&self, snapshot: Snapshot<S>) -> Result<(), SnapshotError>;

    async fn find_latest(&self, aggregate_id: &StreamId) -> Result<Option<Snapshot<S>>, SnapshotError>;

    async fn find_by_version(
        &self,
        aggregate_id: &StreamId,
        version: u64,
    ) -> Result<Option<Snapshot<S>>, SnapshotError>;

    /// Remove every snapshot of the aggregate.
    async fn delete(&self, aggregate_id: &StreamId) -> Result<(), SnapshotError>;
}

#[async_trait]
impl<T, S> SnapshotStore<S> for Arc<T>
where
    T: SnapshotStore<S> + ?Sized,
    S: Clone + Send + Sync + 'static,
{
    async fn save(&self, snapshot: Snapshot<S>) -> Result<(), SnapshotError> {
        (**self).save(snapshot).await
    }

    async fn find_latest(&self, aggregate_id: &StreamId) -> Result<Option<Snapshot<S>>, SnapshotError> {
        (**self).find_latest(aggregate_id).await
    }

    async fn find_by_version(
        &self,
        aggregate_id: &StreamId,
        version: u64,
    ) -> Result<Option<Snapshot<S>>, SnapshotError> {
        (**self).find_by_version(aggregate_id, version).await
    }

    async fn delete(&self, aggregate_id: &StreamId) -> Result<(), SnapshotError> {
        (**self).delete(aggregate_id).await
    }
}
