//! Stream replay with version bounds, filters and progress reporting.
//!
//! For each loaded event at absolute version `v = from_version + index`:
//!
//! 1. stop once `v >= to_version` (exclusive bound)
//! 2. skip (and count) events after `before_timestamp` or outside `event_types`
//! 3. hand passing events to the handler and count them
//! 4. report progress after every considered event
//!
//! A handler error is logged and counted in `errors`; the replay carries on
//! with the next event. Only store failures end a replay early.
//!
//! Replay never writes to the store. Distinct streams may replay concurrently.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use eventide_core::StreamId;
use eventide_events::Projection;

use super::monitor::ReplayMonitor;
use crate::event_store::{EventStore, EventStoreError, StoredEvent};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Store(#[from] EventStoreError),
}

/// Replay bounds and filters. All filters must pass for an event to be handled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOptions {
    /// First version to load (inclusive).
    pub from_version: u64,
    /// Version to stop at (exclusive).
    pub to_version: Option<u64>,
    /// Only events with `occurred_at <= before_timestamp`.
    pub before_timestamp: Option<DateTime<Utc>>,
    /// Only events whose type is listed.
    pub event_types: Option<Vec<String>>,
}

impl ReplayOptions {
    pub fn from_version(mut self, version: u64) -> Self {
        self.from_version = version;
        self
    }

    pub fn to_version(mut self, version: u64) -> Self {
        self.to_version = Some(version);
        self
    }

    pub fn before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.before_timestamp = Some(timestamp);
        self
    }

    pub fn event_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.event_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    fn passes(&self, event: &StoredEvent) -> bool {
        let in_time = self
            .before_timestamp
            .is_none_or(|before| event.occurred_at <= before);
        let in_types = self
            .event_types
            .as_ref()
            .is_none_or(|types| types.iter().any(|t| *t == event.event_type));
        in_time && in_types
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayProgress {
    pub stream_id: StreamId,
    pub events_processed: u64,
    pub events_skipped: u64,
    pub errors: u64,
    pub current_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub stream_id: StreamId,
    /// Events loaded from the store (before bounds and filters).
    pub total_events: u64,
    /// Events handed to the handler, failed ones included.
    pub events_processed: u64,
    pub events_skipped: u64,
    /// Handler failures among `events_processed`.
    pub errors: u64,
    pub duration_ms: u64,
}

/// Receives each event that passes the replay filters.
#[async_trait]
pub trait ReplayHandler: Send {
    async fn handle(&mut self, event: &StoredEvent, version: u64) -> Result<(), String>;
}

#[async_trait]
impl<F, E> ReplayHandler for F
where
    F: FnMut(&StoredEvent, u64) -> Result<(), E> + Send,
    E: Display,
{
    async fn handle(&mut self, event: &StoredEvent, version: u64) -> Result<(), String> {
        self(event, version).map_err(|e| e.to_string())
    }
}

/// Feeds replayed events into a [`Projection`] as envelopes.
pub struct ProjectionHandler<'a> {
    projection: &'a dyn Projection,
}

impl<'a> ProjectionHandler<'a> {
    pub fn new(projection: &'a dyn Projection) -> Self {
        Self { projection }
    }
}

#[async_trait]
impl ReplayHandler for ProjectionHandler<'_> {
    async fn handle(&mut self, event: &StoredEvent, _version: u64) -> Result<(), String> {
        self.projection
            .project(&event.to_envelope())
            .await
            .map_err(|e| e.to_string())
    }
}

/// Replays streams from an [`EventStore`].
pub struct EventReplayer {
    store: Arc<dyn EventStore>,
    monitor: Option<Arc<ReplayMonitor>>,
}

impl EventReplayer {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<ReplayMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn monitor(&self) -> Option<&Arc<ReplayMonitor>> {
        self.monitor.as_ref()
    }

    #[instrument(skip(self, handler, on_progress), fields(stream_id = %stream_id), err)]
    pub async fn replay<H, P>(
        &self,
        stream_id: &StreamId,
        options: &ReplayOptions,
        handler: &mut H,
        mut on_progress: P,
    ) -> Result<ReplayStats, ReplayError>
    where
        H: ReplayHandler + ?Sized,
        P: FnMut(&ReplayProgress) + Send,
    {
        let started = Instant::now();
        if let Some(monitor) = &self.monitor {
            monitor.started(stream_id);
        }

        let result = self
            .run(stream_id, options, handler, &mut on_progress, started)
            .await;

        if let Some(monitor) = &self.monitor {
            match &result {
                Ok(stats) => monitor.completed(stats),
                Err(_) => monitor.failed(stream_id),
            }
        }
        result
    }

    async fn run<H, P>(
        &self,
        stream_id: &StreamId,
        options: &ReplayOptions,
        handler: &mut H,
        on_progress: &mut P,
        started: Instant,
    ) -> Result<ReplayStats, ReplayError>
    where
        H: ReplayHandler + ?Sized,
        P: FnMut(&ReplayProgress) + Send,
    {
        let events = self
            .store
            .get_events(stream_id, options.from_version)
            .await?;

        let mut processed = 0u64;
        let mut skipped = 0u64;
        let mut errors = 0u64;

        for (index, event) in events.iter().enumerate() {
            let version = options.from_version + index as u64;
            if options.to_version.is_some_and(|to| version >= to) {
                break;
            }

            if options.passes(event) {
                if let Err(message) = handler.handle(event, version).await {
                    errors += 1;
                    warn!(
                        stream_id = %stream_id,
                        version,
                        event_type = %event.event_type,
                        error = %message,
                        "event failed during replay"
                    );
                }
                processed += 1;
            } else {
                skipped += 1;
            }

            let progress = ReplayProgress {
                stream_id: stream_id.clone(),
                events_processed: processed,
                events_skipped: skipped,
                errors,
                current_version: version,
            };
            on_progress(&progress);
            if let Some(monitor) = &self.monitor {
                monitor.progressed(&progress);
            }
        }

        let stats = ReplayStats {
            stream_id: stream_id.clone(),
            total_events: events.len() as u64,
            events_processed: processed,
            events_skipped: skipped,
            errors,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        debug!(
            total = stats.total_events,
            processed = stats.events_processed,
            skipped = stats.events_skipped,
            errors = stats.errors,
            "replay complete"
        );
        Ok(stats)
    }

    /// Replay events that occurred at or before `timestamp`.
    pub async fn replay_point_in_time<H>(
        &self,
        stream_id: &StreamId,
        timestamp: DateTime<Utc>,
        handler: &mut H,
    ) -> Result<ReplayStats, ReplayError>
    where
        H: ReplayHandler + ?Sized,
    {
        let options = ReplayOptions::default().before(timestamp);
        self.replay(stream_id, &options, handler, |_: &ReplayProgress| {})
            .await
    }

    /// Replay only the listed event types.
    pub async fn replay_selective<H, I, T>(
        &self,
        stream_id: &StreamId,
        event_types: I,
        handler: &mut H,
    ) -> Result<ReplayStats, ReplayError>
    where
        H: ReplayHandler + ?Sized,
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let options = ReplayOptions::default().event_types(event_types);
        self.replay(stream_id, &options, handler, |_: &ReplayProgress| {})
            .await
    }

    /// Replay from `from_version`, skipping already-known history.
    pub async fn fast_forward<H>(
        &self,
        stream_id: &StreamId,
        from_version: u64,
        handler: &mut H,
    ) -> Result<ReplayStats, ReplayError>
    where
        H: ReplayHandler + ?Sized,
    {
        let options = ReplayOptions::default().from_version(from_version);
        self.replay(stream_id, &options, handler, |_: &ReplayProgress| {})
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{InMemoryEventStore, UncommittedEvent};
    use crate::test_support::{ITEM_ADDED, ORDER_PLACED, seed_order, stream, t0};
    use eventide_core::ExpectedVersion;
    use proptest::prelude::*;
    use serde_json::json;

    async fn seeded() -> (EventReplayer, StreamId) {
        let store = Arc::new(InMemoryEventStore::new());
        let id = stream("order-1");
        seed_order(store.as_ref(), &id).await;
        (EventReplayer::new(store), id)
    }

    fn collect_into(seen: &mut Vec<u64>) -> impl FnMut(&StoredEvent, u64) -> Result<(), String> + Send + '_ {
        move |_, v| {
            seen.push(v);
            Ok(())
        }
    }

    #[tokio::test]
    async fn full_replay_returns_events_in_order() {
        let (replayer, id) = seeded().await;
        let mut seen = Vec::new();
        let mut progress = Vec::new();

        let stats = replayer
            .replay(
                &id,
                &ReplayOptions::default(),
                &mut collect_into(&mut seen),
                |p: &ReplayProgress| progress.push(p.current_version),
            )
            .await
            .unwrap();

        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(progress, vec![0, 1, 2]);
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.events_processed, 3);
        assert_eq!(stats.events_skipped, 0);
    }

    #[tokio::test]
    async fn to_version_is_exclusive() {
        let (replayer, id) = seeded().await;
        let mut seen = Vec::new();

        let stats = replayer
            .replay(
                &id,
                &ReplayOptions::default().to_version(2),
                &mut collect_into(&mut seen),
                |_: &ReplayProgress| {},
            )
            .await
            .unwrap();

        assert_eq!(seen, vec![0, 1]);
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.events_processed, 2);
    }

    #[tokio::test]
    async fn fast_forward_skips_known_history() {
        let (replayer, id) = seeded().await;
        let mut seen = Vec::new();

        let stats = replayer
            .fast_forward(&id, 2, &mut collect_into(&mut seen))
            .await
            .unwrap();

        assert_eq!(seen, vec![2]);
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.events_processed, 1);
    }

    #[tokio::test]
    async fn filters_count_skips() {
        let (replayer, id) = seeded().await;

        let mut seen = Vec::new();
        let stats = replayer
            .replay_selective(&id, [ORDER_PLACED, ITEM_ADDED], &mut collect_into(&mut seen))
            .await
            .unwrap();
        assert_eq!(seen, vec![0, 1]);
        assert_eq!(stats.events_skipped, 1);

        // Events are one minute apart from t0; the cut-off is inclusive.
        let mut seen = Vec::new();
        let stats = replayer
            .replay_point_in_time(
                &id,
                t0() + chrono::Duration::minutes(1),
                &mut collect_into(&mut seen),
            )
            .await
            .unwrap();
        assert_eq!(seen, vec![0, 1]);
        assert_eq!(stats.events_skipped, 1);
    }

    #[tokio::test]
    async fn handler_failure_is_counted_and_replay_continues() {
        let (replayer, id) = seeded().await;
        let mut handled = Vec::new();
        let mut failing = |_: &StoredEvent, v: u64| {
            if v == 1 {
                return Err("boom");
            }
            handled.push(v);
            Ok(())
        };
        let mut last = None;

        let stats = replayer
            .replay(&id, &ReplayOptions::default(), &mut failing, |p: &ReplayProgress| {
                last = Some(p.clone())
            })
            .await
            .unwrap();

        assert_eq!(handled, vec![0, 2]);
        assert_eq!(stats.events_processed, 3);
        assert_eq!(stats.errors, 1);
        assert_eq!(last.unwrap().errors, 1);
    }

    /// Rejects the event at one version, records the rest.
    struct RejectAt {
        version: u64,
        projected: std::sync::Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Projection for RejectAt {
        fn name(&self) -> &str {
            "reject_at"
        }

        async fn project(
            &self,
            envelope: &eventide_events::EventEnvelope,
        ) -> Result<(), eventide_events::ProjectionError> {
            if envelope.aggregate_version() == self.version {
                return Err(eventide_events::ProjectionError::Rejected("bad".into()));
            }
            self.projected.lock().unwrap().push(envelope.aggregate_version());
            Ok(())
        }

        async fn reset(&self) -> Result<(), eventide_events::ProjectionError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn projection_failure_does_not_stop_later_events() {
        let (replayer, id) = seeded().await;
        let projection = RejectAt {
            version: 1,
            projected: std::sync::Mutex::new(Vec::new()),
        };

        let stats = replayer
            .replay(
                &id,
                &ReplayOptions::default(),
                &mut ProjectionHandler::new(&projection),
                |_: &ReplayProgress| {},
            )
            .await
            .unwrap();

        assert_eq!(*projection.projected.lock().unwrap(), vec![0, 2]);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn monitor_tracks_progress_and_completion() {
        let store = Arc::new(InMemoryEventStore::new());
        let id = stream("order-1");
        seed_order(store.as_ref(), &id).await;
        let monitor = Arc::new(ReplayMonitor::new());
        let replayer = EventReplayer::new(store).with_monitor(monitor.clone());

        let mut noop = |_: &StoredEvent, _: u64| Ok::<(), String>(());
        replayer
            .replay(&id, &ReplayOptions::default(), &mut noop, |_: &ReplayProgress| {})
            .await
            .unwrap();

        let latest = monitor.latest_progress(&id).unwrap();
        assert_eq!(latest.current_version, 2);
        assert_eq!(latest.events_processed, 3);
        assert!(!monitor.is_replaying(&id));
        assert_eq!(monitor.completed_replays().len(), 1);
    }

    #[tokio::test]
    async fn unknown_stream_replays_nothing() {
        let (replayer, _) = seeded().await;
        let mut seen = Vec::new();
        let stats = replayer
            .replay(
                &stream("missing"),
                &ReplayOptions::default(),
                &mut collect_into(&mut seen),
                |_: &ReplayProgress| {},
            )
            .await
            .unwrap();
        assert_eq!(stats.total_events, 0);
        assert!(seen.is_empty());
    }

    proptest! {
        #[test]
        fn replay_is_deterministic(
            types in prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 0..20),
            filter in prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 0..3),
            from in 0u64..25,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = Arc::new(InMemoryEventStore::new());
                let id = stream("prop");
                let events = types
                    .iter()
                    .map(|t| UncommittedEvent::new(*t, t0(), json!({})))
                    .collect();
                store.append(&id, events, ExpectedVersion::Exact(0)).await.unwrap();

                let replayer = EventReplayer::new(store);
                let options = ReplayOptions::default().from_version(from).event_types(filter.clone());

                let mut first = Vec::new();
                let mut second = Vec::new();
                let a = replayer
                    .replay(&id, &options, &mut collect_into(&mut first), |_: &ReplayProgress| {})
                    .await
                    .unwrap();
                let b = replayer
                    .replay(&id, &options, &mut collect_into(&mut second), |_: &ReplayProgress| {})
                    .await
                    .unwrap();

                prop_assert_eq!(&first, &second);
                prop_assert_eq!(a.events_processed, b.events_processed);
                prop_assert_eq!(a.events_skipped, b.events_skipped);
                prop_assert_eq!(a.events_processed + a.events_skipped, a.total_events);
                Ok(())
            })?;
        }
    }
}
