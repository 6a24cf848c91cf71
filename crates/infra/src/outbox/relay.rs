//! Polling relay that drains the outbox into an [`EventPublisherPort`].
//!
//! ```text
//! tick ──► get_unpublished(batch) ──► for each message:
//!            attempts >= max        → dead-letter, skip
//!            retry not yet due      → defer
//!            publish Ok             → mark published
//!            publish Err            → mark failed (attempts += 1)
//! ```
//!
//! Cycles never overlap: a manual [`OutboxRelay::run_once`] racing the
//! scheduler gets [`RelayError::CycleInFlight`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use eventide_core::{Clock, SystemClock};
use eventide_events::EventPublisherPort;

use super::metrics::OutboxRelayMetrics;
use super::store::{OutboxStore, OutboxStoreError};
use super::types::{MAX_ATTEMPTS_EXCEEDED, OutboxMessage};

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRelayConfig {
    /// How often the scheduler runs a cycle.
    pub poll_interval: Duration,
    /// Maximum messages fetched per cycle.
    pub batch_size: usize,
    /// Failed publishes allowed before a message is dead-lettered.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles with every further failure.
    pub backoff_base: Duration,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 100,
            max_attempts: 5,
            backoff_base: Duration::from_millis(1000),
        }
    }
}

impl OutboxRelayConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }
}

/// Delay owed after `attempts` failed publishes: `base * 2^(attempts - 1)`,
/// zero before the first failure. Saturates instead of overflowing.
pub fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// `true` when a retry for `message` is due at `now`.
fn retry_due(message: &OutboxMessage, base: Duration, now: DateTime<Utc>) -> bool {
    let Some(last) = message.last_attempt_at else {
        return true;
    };
    let delay = chrono::Duration::from_std(backoff_delay(base, message.attempts))
        .unwrap_or(chrono::Duration::MAX);
    match last.checked_add_signed(delay) {
        Some(due) => now >= due,
        None => false,
    }
}

/// Outcome of a single relay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayCycleReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub deferred: usize,
}

#[derive(Debug, Error)]
pub enum RelayError {
    /// Another cycle is still running.
    #[error("a relay cycle is already in flight")]
    CycleInFlight,

    #[error(transparent)]
    Store(#[from] OutboxStoreError),
}

struct RelayCore {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisherPort>,
    clock: Arc<dyn Clock>,
    config: OutboxRelayConfig,
    metrics: Arc<OutboxRelayMetrics>,
    cycle: tokio::sync::Mutex<()>,
    healthy: AtomicBool,
}

impl RelayCore {
    async fn run_once(&self) -> Result<RelayCycleReport, RelayError> {
        let _cycle = self
            .cycle
            .try_lock()
            .map_err(|_| RelayError::CycleInFlight)?;

        let started = Instant::now();
        let report = match self.drain().await {
            Ok(report) => report,
            Err(e) => {
                self.healthy.store(false, Ordering::Release);
                return Err(e);
            }
        };

        self.healthy.store(report.failed == 0, Ordering::Release);
        self.metrics.record_cycle(started.elapsed());

        if report.fetched > 0 {
            debug!(
                fetched = report.fetched,
                published = report.published,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                deferred = report.deferred,
                "relay cycle complete"
            );
        }
        Ok(report)
    }

    /// Publish one batch. A store error ends the batch early.
    async fn drain(&self) -> Result<RelayCycleReport, RelayError> {
        let batch = self.store.get_unpublished(self.config.batch_size).await?;
        let mut report = RelayCycleReport {
            fetched: batch.len(),
            ..RelayCycleReport::default()
        };

        for message in batch {
            let now = self.clock.now();

            if message.attempts >= self.config.max_attempts {
                self.store
                    .mark_as_dead_lettered(message.id, MAX_ATTEMPTS_EXCEEDED, now)
                    .await?;
                self.metrics.record_skip();
                report.dead_lettered += 1;
                warn!(
                    message_id = %message.id,
                    event_id = %message.envelope.event_id(),
                    attempts = message.attempts,
                    last_error = message.error.as_deref().unwrap_or_default(),
                    "outbox message dead-lettered"
                );
                continue;
            }

            if message.attempts > 0 && !retry_due(&message, self.config.backoff_base, now) {
                self.metrics.record_deferred();
                report.deferred += 1;
                continue;
            }

            match self.publisher.publish(&message.envelope).await {
                Ok(()) => {
                    self.store
                        .mark_as_published(message.id, self.clock.now())
                        .await?;
                    self.metrics.record_success();
                    report.published += 1;
                    debug!(
                        message_id = %message.id,
                        event_type = message.envelope.event_type(),
                        "outbox message published"
                    );
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.store
                        .mark_as_failed(message.id, &reason, self.clock.now())
                        .await?;
                    self.metrics.record_failure();
                    report.failed += 1;
                    warn!(
                        message_id = %message.id,
                        attempts = message.attempts + 1,
                        error = %reason,
                        "outbox publish failed"
                    );
                }
            }
        }
        Ok(report)
    }
}

struct Scheduler {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Outbox relay with an explicit start/stop/shutdown lifecycle.
pub struct OutboxRelay {
    core: Arc<RelayCore>,
    running: Mutex<Option<Scheduler>>,
    stopping: Mutex<Option<JoinHandle<()>>>,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisherPort>,
        config: OutboxRelayConfig,
    ) -> Self {
        Self {
            core: Arc::new(RelayCore {
                store,
                publisher,
                clock: Arc::new(SystemClock),
                config,
                metrics: Arc::new(OutboxRelayMetrics::new()),
                cycle: tokio::sync::Mutex::new(()),
                healthy: AtomicBool::new(true),
            }),
            running: Mutex::new(None),
            stopping: Mutex::new(None),
        }
    }

    /// Replace the clock used for backoff and timestamps. Call before `start`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        if let Some(core) = Arc::get_mut(&mut self.core) {
            core.clock = clock;
        }
        self
    }

    pub fn config(&self) -> &OutboxRelayConfig {
        &self.core.config
    }

    pub fn metrics(&self) -> Arc<OutboxRelayMetrics> {
        self.core.metrics.clone()
    }

    /// `true` when the last cycle had no publish failures (and before the
    /// first cycle). A cycle aborted by a store error leaves it `false`.
    pub fn is_healthy(&self) -> bool {
        self.core.healthy.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    /// Run one cycle now.
    pub async fn run_once(&self) -> Result<RelayCycleReport, RelayError> {
        self.core.run_once().await
    }

    /// Spawn the recurring scheduler on the current Tokio runtime.
    /// Calling `start` while running is a no-op.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if running.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let core = self.core.clone();
        let poll_interval = core.config.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => match core.run_once().await {
                        Ok(_) => {}
                        Err(RelayError::CycleInFlight) => {
                            debug!("relay tick skipped: cycle in flight");
                        }
                        Err(e) => error!(error = %e, "relay cycle failed"),
                    },
                }
            }
            debug!("relay scheduler exited");
        });

        info!(
            poll_interval_ms = poll_interval.as_millis() as u64,
            batch_size = self.core.config.batch_size,
            "outbox relay started"
        );
        *running = Some(Scheduler {
            stop: stop_tx,
            handle,
        });
    }

    /// Halt future ticks. An in-flight cycle runs to completion.
    /// Calling `stop` while stopped is a no-op.
    pub fn stop(&self) {
        let scheduler = self
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        if let Some(Scheduler { stop, handle }) = scheduler {
            let _ = stop.send(true);
            *self.stopping.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
            info!("outbox relay stopped");
        }
    }

    /// Stop and wait for the scheduler and any in-flight cycle to finish.
    pub async fn shutdown(&self) {
        self.stop();

        let handle = self
            .stopping
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "relay scheduler task failed");
            }
        }

        // Wait out a cycle started through `run_once`.
        let _cycle = self.core.cycle.lock().await;
    }
}

impl Drop for OutboxRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

impl core::fmt::Debug for OutboxRelay {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OutboxRelay")
            .field("config", &self.core.config)
            .field("running", &self.is_running())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{InMemoryOutboxStore, OutboxStats, OutboxStatus};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use eventide_core::{EventId, ManualClock, MessageId, StreamId};
    use eventide_events::{EventEnvelope, InMemoryPublisher, PublishError};
    use serde_json::json;
    use std::collections::HashSet;

    fn envelope(version: u64) -> EventEnvelope {
        EventEnvelope::new(
            EventId::new(),
            "order.placed",
            StreamId::new("order-1").unwrap(),
            version,
            Utc::now(),
            json!({}),
        )
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    /// Fails every event id in `failing`, records the rest.
    struct SelectivePublisher {
        failing: HashSet<EventId>,
        inner: InMemoryPublisher,
    }

    #[async_trait]
    impl EventPublisherPort for SelectivePublisher {
        async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
            if self.failing.contains(&envelope.event_id()) {
                return Err(PublishError::transport("broker unavailable"));
            }
            self.inner.publish(envelope).await
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl EventPublisherPort for AlwaysFails {
        async fn publish(&self, _: &EventEnvelope) -> Result<(), PublishError> {
            Err(PublishError::transport("down"))
        }
    }

    /// Delegates to an in-memory outbox but cannot record publishes while
    /// `broken` is set.
    struct BrokenPublishMarks {
        inner: InMemoryOutboxStore,
        broken: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl OutboxStore for BrokenPublishMarks {
        async fn save(&self, message: OutboxMessage) -> Result<MessageId, OutboxStoreError> {
            self.inner.save(message).await
        }

        async fn get_unpublished(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
            self.inner.get_unpublished(limit).await
        }

        async fn mark_as_published(&self, id: MessageId, at: DateTime<Utc>) -> Result<(), OutboxStoreError> {
            if self.broken.load(Ordering::Acquire) {
                return Err(OutboxStoreError::Storage("connection reset".into()));
            }
            self.inner.mark_as_published(id, at).await
        }

        async fn mark_as_failed(&self, id: MessageId, error: &str, at: DateTime<Utc>) -> Result<(), OutboxStoreError> {
            self.inner.mark_as_failed(id, error, at).await
        }

        async fn mark_as_dead_lettered(&self, id: MessageId, reason: &str, at: DateTime<Utc>) -> Result<(), OutboxStoreError> {
            self.inner.mark_as_dead_lettered(id, reason, at).await
        }

        async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
            self.inner.get(id).await
        }

        async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
            self.inner.dead_letters(limit).await
        }

        async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
            self.inner.stats().await
        }
    }

    #[tokio::test]
    async fn store_failure_marks_relay_unhealthy_until_a_clean_cycle() {
        let store = Arc::new(BrokenPublishMarks {
            inner: InMemoryOutboxStore::new(),
            broken: std::sync::atomic::AtomicBool::new(true),
        });
        store.save(OutboxMessage::new(envelope(0), Utc::now())).await.unwrap();
        let relay = OutboxRelay::new(
            store.clone(),
            Arc::new(InMemoryPublisher::new()),
            OutboxRelayConfig::default(),
        );
        assert!(relay.is_healthy());

        let err = relay.run_once().await.unwrap_err();
        assert!(matches!(err, RelayError::Store(OutboxStoreError::Storage(_))));
        assert!(!relay.is_healthy());

        store.broken.store(false, Ordering::Release);
        assert_eq!(relay.run_once().await.unwrap().published, 1);
        assert!(relay.is_healthy());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(1000);
        assert_eq!(backoff_delay(base, 0), Duration::ZERO);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(4000));
        assert!(backoff_delay(base, 200) >= backoff_delay(base, 31));
    }

    #[tokio::test]
    async fn one_failure_one_success_marks_relay_unhealthy() {
        let store = InMemoryOutboxStore::arc();
        let a = envelope(0);
        let b = envelope(1);
        let a_id = store.save(OutboxMessage::new(a.clone(), Utc::now())).await.unwrap();
        let b_id = store.save(OutboxMessage::new(b.clone(), Utc::now())).await.unwrap();

        let publisher = Arc::new(SelectivePublisher {
            failing: HashSet::from([a.event_id()]),
            inner: InMemoryPublisher::new(),
        });
        let relay = OutboxRelay::new(store.clone(), publisher.clone(), OutboxRelayConfig::default());
        assert!(relay.is_healthy());

        let report = relay.run_once().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.published, 1);
        assert_eq!(relay.metrics().failed(), 1);
        assert_eq!(relay.metrics().published(), 1);
        assert!(!relay.is_healthy());

        let a_msg = store.get(a_id).await.unwrap().unwrap();
        assert_eq!(a_msg.attempts, 1);
        assert_eq!(a_msg.error.as_deref(), Some("transport failure: broker unavailable"));
        assert_eq!(store.get(b_id).await.unwrap().unwrap().status(), OutboxStatus::Published);
        assert_eq!(publisher.inner.published_count(), 1);
    }

    #[tokio::test]
    async fn retry_waits_for_exponential_backoff() {
        let clock = Arc::new(ManualClock::new(start_time()));
        let store = InMemoryOutboxStore::arc();
        let id = store.save(OutboxMessage::new(envelope(0), start_time())).await.unwrap();

        let relay = OutboxRelay::new(store.clone(), Arc::new(AlwaysFails), OutboxRelayConfig::default())
            .with_clock(clock.clone());

        // attempt 1 fails at t0
        relay.run_once().await.unwrap();
        // attempts = 1 → 1000 ms backoff
        clock.advance(chrono::Duration::milliseconds(999));
        assert_eq!(relay.run_once().await.unwrap().deferred, 1);
        clock.advance(chrono::Duration::milliseconds(1));
        assert_eq!(relay.run_once().await.unwrap().failed, 1);

        // attempts = 2 → 2000 ms backoff
        assert_eq!(store.get(id).await.unwrap().unwrap().attempts, 2);
        clock.advance(chrono::Duration::milliseconds(1999));
        assert_eq!(relay.run_once().await.unwrap().deferred, 1);
        clock.advance(chrono::Duration::milliseconds(1));
        assert_eq!(relay.run_once().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn exhausted_messages_are_dead_lettered_without_publishing() {
        let store = InMemoryOutboxStore::arc();
        let mut message = OutboxMessage::new(envelope(0), Utc::now());
        message.attempts = 5;
        let id = store.save(message).await.unwrap();

        let publisher = Arc::new(InMemoryPublisher::new());
        let relay = OutboxRelay::new(store.clone(), publisher.clone(), OutboxRelayConfig::default());

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(relay.metrics().skipped(), 1);
        assert_eq!(publisher.published_count(), 0);

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status(), OutboxStatus::DeadLettered);
        assert_eq!(stored.error.as_deref(), Some(MAX_ATTEMPTS_EXCEEDED));

        // Dead letters leave the pending set: the next cycle sees nothing.
        assert_eq!(relay.run_once().await.unwrap(), RelayCycleReport::default());
        assert_eq!(relay.metrics().skipped(), 1);
        assert!(relay.is_healthy());
    }

    #[tokio::test]
    async fn batch_size_limits_each_cycle() {
        let store = InMemoryOutboxStore::arc();
        for v in 0..5 {
            store.save(OutboxMessage::new(envelope(v), Utc::now())).await.unwrap();
        }
        let publisher = Arc::new(InMemoryPublisher::new());
        let relay = OutboxRelay::new(
            store.clone(),
            publisher.clone(),
            OutboxRelayConfig::default().with_batch_size(2),
        );

        assert_eq!(relay.run_once().await.unwrap().published, 2);
        let versions: Vec<u64> = publisher
            .published()
            .iter()
            .map(|e| e.aggregate_version())
            .collect();
        assert_eq!(versions, vec![0, 1]);
    }

    #[tokio::test]
    async fn overlapping_cycles_are_refused() {
        let store = InMemoryOutboxStore::arc();
        let relay = OutboxRelay::new(
            store,
            Arc::new(InMemoryPublisher::new()),
            OutboxRelayConfig::default(),
        );

        let _held = relay.core.cycle.lock().await;
        assert!(matches!(relay.run_once().await, Err(RelayError::CycleInFlight)));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_drains_outbox_and_stops() {
        let store = InMemoryOutboxStore::arc();
        store.save(OutboxMessage::new(envelope(0), Utc::now())).await.unwrap();
        let publisher = Arc::new(InMemoryPublisher::new());
        let relay = OutboxRelay::new(
            store.clone(),
            publisher.clone(),
            OutboxRelayConfig::default().with_poll_interval(Duration::from_millis(50)),
        );

        relay.start();
        relay.start();
        assert!(relay.is_running());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(publisher.published_count(), 1);

        relay.shutdown().await;
        relay.stop();
        assert!(!relay.is_running());

        store.save(OutboxMessage::new(envelope(1), Utc::now())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(publisher.published_count(), 1);
    }
}
