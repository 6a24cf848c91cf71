//! Rebuild read models from committed events.
//!
//! A rebuild resets the projection and folds every event through it. Per-event
//! failures are counted and logged; they never abort the rebuild, so one bad
//! event cannot leave a read model empty.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use eventide_core::StreamId;
use eventide_events::{EventEnvelope, Projection, ProjectionError};

use crate::event_store::{EventStore, EventStoreError};

#[derive(Debug, Error)]
pub enum RebuildError {
    #[error("unknown projection '{0}'")]
    UnknownProjection(String),

    #[error("stream '{0}' has no events")]
    StreamNotFound(StreamId),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("projection '{projection}' reset failed: {source}")]
    Reset {
        projection: String,
        #[source]
        source: ProjectionError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub projection_name: String,
    /// Every event handed to the projection, failed ones included.
    pub events_processed: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

/// Named projections that can be rebuilt on demand.
#[derive(Default)]
pub struct ProjectionRebuildManager {
    projections: Vec<Arc<dyn Projection>>,
}

impl ProjectionRebuildManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a projection. A projection with the same name is replaced.
    pub fn register(&mut self, projection: Arc<dyn Projection>) {
        match self
            .projections
            .iter_mut()
            .find(|p| p.name() == projection.name())
        {
            Some(existing) => *existing = projection,
            None => self.projections.push(projection),
        }
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.projections.iter().map(|p| p.name()).collect()
    }

    fn find(&self, name: &str) -> Result<&Arc<dyn Projection>, RebuildError> {
        self.projections
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| RebuildError::UnknownProjection(name.to_string()))
    }

    #[instrument(skip(self, events), fields(events = events.len()), err)]
    pub async fn rebuild(
        &self,
        name: &str,
        events: &[EventEnvelope],
    ) -> Result<RebuildReport, RebuildError> {
        let projection = self.find(name)?;
        rebuild_one(projection.as_ref(), events).await
    }

    /// Rebuild every registered projection, one after another.
    pub async fn rebuild_all(
        &self,
        events: &[EventEnvelope],
    ) -> Result<Vec<RebuildReport>, RebuildError> {
        let mut reports = Vec::with_capacity(self.projections.len());
        for projection in &self.projections {
            reports.push(rebuild_one(projection.as_ref(), events).await?);
        }
        Ok(reports)
    }

    /// Rebuild `name` from the full history of one stream.
    #[instrument(skip(self, store), fields(stream_id = %stream_id), err)]
    pub async fn rebuild_stream<S>(
        &self,
        name: &str,
        store: &S,
        stream_id: &StreamId,
    ) -> Result<RebuildReport, RebuildError>
    where
        S: EventStore + ?Sized,
    {
        let projection = self.find(name)?;
        let events = store.get_events(stream_id, 0).await?;
        if events.is_empty() {
            return Err(RebuildError::StreamNotFound(stream_id.clone()));
        }

        let envelopes: Vec<EventEnvelope> = events.iter().map(|e| e.to_envelope()).collect();
        rebuild_one(projection.as_ref(), &envelopes).await
    }
}

async fn rebuild_one(
    projection: &dyn Projection,
    events: &[EventEnvelope],
) -> Result<RebuildReport, RebuildError> {
    let started = Instant::now();
    let name = projection.name().to_string();

    projection
        .reset()
        .await
        .map_err(|source| RebuildError::Reset {
            projection: name.clone(),
            source,
        })?;

    let mut errors = 0u64;
    for envelope in events {
        if let Err(e) = projection.project(envelope).await {
            errors += 1;
            warn!(
                projection = %name,
                event_id = %envelope.event_id(),
                event_type = envelope.event_type(),
                error = %e,
                "event failed during rebuild"
            );
        }
    }

    let report = RebuildReport {
        projection_name: name,
        events_processed: events.len() as u64,
        errors,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    info!(
        projection = %report.projection_name,
        events = report.events_processed,
        errors = report.errors,
        duration_ms = report.duration_ms,
        "projection rebuilt"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::read_model::ReadModelStore;
    use crate::test_support::{OrderSummaryProjection, seed_order, stream, t0};
    use async_trait::async_trait;
    use eventide_core::EventId;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Rejects events whose version is listed in `fail_on`.
    struct Picky {
        fail_on: Vec<u64>,
        seen: AtomicU64,
        resets: AtomicU64,
        log: Mutex<Vec<u64>>,
    }

    impl Picky {
        fn new(fail_on: Vec<u64>) -> Self {
            Self {
                fail_on,
                seen: AtomicU64::new(0),
                resets: AtomicU64::new(0),
                log: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Projection for Picky {
        fn name(&self) -> &str {
            "picky"
        }

        async fn project(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.contains(&envelope.aggregate_version()) {
                return Err(ProjectionError::Rejected("nope".into()));
            }
            self.log.lock().unwrap().push(envelope.aggregate_version());
            Ok(())
        }

        async fn reset(&self) -> Result<(), ProjectionError> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().clear();
            Ok(())
        }
    }

    fn envelopes(n: u64) -> Vec<EventEnvelope> {
        let id = stream("s-1");
        (0..n)
            .map(|v| EventEnvelope::new(EventId::new(), "x", id.clone(), v, t0(), serde_json::json!({})))
            .collect()
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() {
        let picky = Arc::new(Picky::new(vec![1, 3]));
        let mut manager = ProjectionRebuildManager::new();
        manager.register(picky.clone());

        let report = manager.rebuild("picky", &envelopes(5)).await.unwrap();

        assert_eq!(report.events_processed, 5);
        assert_eq!(report.errors, 2);
        assert_eq!(picky.seen.load(Ordering::SeqCst), 5);
        assert_eq!(*picky.log.lock().unwrap(), vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn rebuild_resets_first() {
        let picky = Arc::new(Picky::new(vec![]));
        let mut manager = ProjectionRebuildManager::new();
        manager.register(picky.clone());

        manager.rebuild("picky", &envelopes(3)).await.unwrap();
        manager.rebuild("picky", &envelopes(2)).await.unwrap();

        assert_eq!(picky.resets.load(Ordering::SeqCst), 2);
        assert_eq!(*picky.log.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn unknown_projection_is_rejected() {
        let manager = ProjectionRebuildManager::new();
        let err = manager.rebuild("ghost", &envelopes(1)).await.unwrap_err();
        assert!(matches!(err, RebuildError::UnknownProjection(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn rebuild_all_runs_each_projection() {
        let mut manager = ProjectionRebuildManager::new();
        manager.register(Arc::new(Picky::new(vec![0])));
        manager.register(Arc::new(OrderSummaryProjection::new()));

        let reports = manager.rebuild_all(&envelopes(2)).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].projection_name, "picky");
        assert_eq!(reports[0].errors, 1);
        // "x" is not an order event type.
        assert_eq!(reports[1].errors, 2);
    }

    #[tokio::test]
    async fn rebuild_stream_folds_history_into_read_model() {
        let store = InMemoryEventStore::new();
        let id = stream("order-1");
        seed_order(&store, &id).await;

        let projection = Arc::new(OrderSummaryProjection::new());
        let mut manager = ProjectionRebuildManager::new();
        manager.register(projection.clone());

        let report = manager
            .rebuild_stream("order_summary", &store, &id)
            .await
            .unwrap();
        assert_eq!(report.events_processed, 3);
        assert_eq!(report.errors, 0);

        let row = projection.store.find_by_id("order-1").await.unwrap().unwrap();
        assert_eq!(row.total_cents, 3000);
        assert!(row.shipped);
        assert_eq!(row.version, 3);
    }

    #[tokio::test]
    async fn rebuild_stream_on_empty_stream_fails() {
        let store = InMemoryEventStore::new();
        let mut manager = ProjectionRebuildManager::new();
        manager.register(Arc::new(OrderSummaryProjection::new()));

        let err = manager
            .rebuild_stream("order_summary", &store, &stream("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, RebuildError::StreamNotFound(_)));
    }
}
