//! Projection lag tracking.
//!
//! Lag is the time between an event occurring and a projection applying it.
//! Each projection keeps a bounded window of recent samples; health means the
//! worst sample in the window is within the threshold.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

pub const DEFAULT_LAG_THRESHOLD_MS: u64 = 5000;
pub const DEFAULT_WINDOW: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionConsistencyStats {
    pub projection: String,
    pub sample_count: usize,
    pub average_lag_ms: f64,
    pub max_lag_ms: u64,
    pub healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyReport {
    pub threshold_ms: u64,
    pub projections: Vec<ProjectionConsistencyStats>,
    pub overall_healthy: bool,
}

#[derive(Debug)]
pub struct ConsistencyMonitor {
    window: usize,
    samples: Mutex<BTreeMap<String, VecDeque<u64>>>,
}

impl Default for ConsistencyMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsistencyMonitor {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Keep at most `window` samples per projection (minimum 1).
    pub fn with_window(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: Mutex::new(BTreeMap::new()),
        }
    }

    /// Track `projection` before it records any lag, so reports list it.
    pub fn register(&self, projection: &str) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.entry(projection.to_string()).or_default();
        }
    }

    pub fn record_lag(&self, projection: &str, lag_ms: u64) {
        let Ok(mut samples) = self.samples.lock() else {
            warn!(projection, "consistency monitor lock poisoned; sample dropped");
            return;
        };
        let window = samples.entry(projection.to_string()).or_default();
        if window.len() == self.window {
            window.pop_front();
        }
        window.push_back(lag_ms);
    }

    fn with_samples<R>(&self, projection: &str, f: impl FnOnce(&VecDeque<u64>) -> R) -> Option<R> {
        let samples = self.samples.lock().ok()?;
        samples.get(projection).map(f)
    }

    /// Mean lag; 0.0 with no samples.
    pub fn average_lag(&self, projection: &str) -> f64 {
        self.with_samples(projection, average).unwrap_or(0.0)
    }

    /// Worst lag; 0 with no samples.
    pub fn max_lag(&self, projection: &str) -> u64 {
        self.with_samples(projection, |s| s.iter().copied().max().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn sample_count(&self, projection: &str) -> usize {
        self.with_samples(projection, VecDeque::len).unwrap_or(0)
    }

    pub fn is_healthy(&self, projection: &str, threshold_ms: u64) -> bool {
        self.max_lag(projection) <= threshold_ms
    }

    pub fn report(&self, threshold_ms: u64) -> ConsistencyReport {
        let projections: Vec<_> = self
            .samples
            .lock()
            .map(|samples| {
                samples
                    .iter()
                    .map(|(name, window)| {
                        let max_lag_ms = window.iter().copied().max().unwrap_or(0);
                        ProjectionConsistencyStats {
                            projection: name.clone(),
                            sample_count: window.len(),
                            average_lag_ms: average(window),
                            max_lag_ms,
                            healthy: max_lag_ms <= threshold_ms,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        ConsistencyReport {
            threshold_ms,
            overall_healthy: projections.iter().all(|p| p.healthy),
            projections,
        }
    }

    /// Drop the samples of one projection, or of all when `None`.
    pub fn reset(&self, projection: Option<&str>) {
        if let Ok(mut samples) = self.samples.lock() {
            match projection {
                Some(name) => {
                    if let Some(window) = samples.get_mut(name) {
                        window.clear();
                    }
                }
                None => samples.values_mut().for_each(VecDeque::clear),
            }
        }
    }
}

fn average(window: &VecDeque<u64>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    window.iter().map(|&v| v as f64).sum::<f64>() / window.len() as f64
}
