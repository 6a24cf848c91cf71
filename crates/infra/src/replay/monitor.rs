//! In-process sink for replay progress.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use eventide_core::StreamId;

use super::replayer::{ReplayProgress, ReplayStats};

const DEFAULT_HISTORY: usize = 256;

#[derive(Debug, Default)]
struct MonitorState {
    latest: HashMap<StreamId, ReplayProgress>,
    in_flight: HashSet<StreamId>,
    completed: VecDeque<ReplayStats>,
}

/// Records the latest progress per stream, which streams are replaying,
/// and the stats of recently completed replays (bounded, oldest dropped).
#[derive(Debug)]
pub struct ReplayMonitor {
    state: Mutex<MonitorState>,
    history: usize,
}

impl ReplayMonitor {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    pub fn with_history(history: usize) -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
            history: history.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn started(&self, stream_id: &StreamId) {
        let mut state = self.state();
        state.in_flight.insert(stream_id.clone());
        state.latest.remove(stream_id);
    }

    pub(crate) fn progressed(&self, progress: &ReplayProgress) {
        self.state()
            .latest
            .insert(progress.stream_id.clone(), progress.clone());
    }

    pub(crate) fn completed(&self, stats: &ReplayStats) {
        let mut state = self.state();
        state.in_flight.remove(&stats.stream_id);
        if state.completed.len() == self.history {
            state.completed.pop_front();
        }
        state.completed.push_back(stats.clone());
    }

    pub(crate) fn failed(&self, stream_id: &StreamId) {
        self.state().in_flight.remove(stream_id);
    }

    pub fn latest_progress(&self, stream_id: &StreamId) -> Option<ReplayProgress> {
        self.state().latest.get(stream_id).cloned()
    }

    pub fn in_flight(&self) -> Vec<StreamId> {
        let mut streams: Vec<StreamId> = self.state().in_flight.iter().cloned().collect();
        streams.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        streams
    }

    pub fn is_replaying(&self, stream_id: &StreamId) -> bool {
        self.state().in_flight.contains(stream_id)
    }

    /// Completed replays, oldest first.
    pub fn completed_replays(&self) -> Vec<ReplayStats> {
        self.state().completed.iter().cloned().collect()
    }
}

impl Default for ReplayMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(id: &str) -> ReplayStats {
        ReplayStats {
            stream_id: StreamId::new(id).unwrap(),
            total_events: 1,
            events_processed: 1,
            events_skipped: 0,
            errors: 0,
            duration_ms: 0,
        }
    }

    #[test]
    fn completed_history_is_bounded() {
        let monitor = ReplayMonitor::with_history(2);
        for id in ["a", "b", "c"] {
            monitor.started(&StreamId::new(id).unwrap());
            monitor.completed(&stats(id));
        }

        let ids: Vec<String> = monitor
            .completed_replays()
            .into_iter()
            .map(|s| s.stream_id.into_inner())
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(monitor.in_flight().is_empty());
    }
}
