//! Relay counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Cumulative counters for an [`OutboxRelay`](super::OutboxRelay).
///
/// Counters only grow. A dead-lettered message counts as one skip in the
/// cycle that dead-letters it.
#[derive(Debug, Default)]
pub struct OutboxRelayMetrics {
    published: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    deferred: AtomicU64,
    cycles: AtomicU64,
    last_cycle_micros: AtomicU64,
}

impl OutboxRelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle(&self, duration: Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_micros.store(
            u64::try_from(duration.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RelayMetricsSnapshot {
        RelayMetricsSnapshot {
            published: self.published(),
            failed: self.failed(),
            skipped: self.skipped(),
            deferred: self.deferred.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            last_cycle: Duration::from_micros(self.last_cycle_micros.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of [`OutboxRelayMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayMetricsSnapshot {
    pub published: u64,
    pub failed: u64,
    pub skipped: u64,
    pub deferred: u64,
    pub cycles: u64,
    pub last_cycle: Duration,
}
