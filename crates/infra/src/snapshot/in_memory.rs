use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use eventide_core::StreamId;

use super::{Snapshot, SnapshotError, SnapshotStore};

/// In-memory snapshot store for tests/dev.
#[derive(Debug)]
pub struct InMemorySnapshotStore<S> {
    snapshots: RwLock<HashMap<StreamId, BTreeMap<u64, Snapshot<S>>>>,
}

impl<S> InMemorySnapshotStore<S> {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Number of snapshots held for `aggregate_id`.
    pub fn count(&self, aggregate_id: &StreamId) -> usize {
        self.snapshots
            .read()
            .map(|s| s.get(aggregate_id).map(BTreeMap::len).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl<S> Default for InMemorySnapshotStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> SnapshotError {
    SnapshotError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl<S> SnapshotStore<S> for InMemorySnapshotStore<S>
where
    S: Clone + Send + Sync + 'static,
{
    async fn save(&self, snapshot: Snapshot<S>) -> Result<(), SnapshotError> {
        self.snapshots
            .write()
            .map_err(|_| poisoned())?
            .entry(snapshot.aggregate_id.clone())
            .or_default()
            .insert(snapshot.version, snapshot);
        Ok(())
    }

    async fn find_latest(&self, aggregate_id: &StreamId) -> Result<Option<Snapshot<S>>, SnapshotError> {
        let snapshots = self.snapshots.read().map_err(|_| poisoned())?;
        Ok(snapshots
            .get(aggregate_id)
            .and_then(|by_version| by_version.values().next_back())
            .cloned())
    }

    async fn find_by_version(
        &self,
        aggregate_id: &StreamId,
        version: u64,
    ) -> Result<Option<Snapshot<S>>, SnapshotError> {
        let snapshots = self.snapshots.read().map_err(|_| poisoned())?;
        Ok(snapshots
            .get(aggregate_id)
            .and_then(|by_version| by_version.get(&version))
            .cloned())
    }

    async fn delete(&self, aggregate_id: &StreamId) -> Result<(), SnapshotError> {
        self.snapshots
            .write()
            .map_err(|_| poisoned())?
            .remove(aggregate_id);
        Ok(())
    }
}
