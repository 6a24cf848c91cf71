/// Snapshot every ten events unless configured otherwise.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 10;

/// `true` when `current_version` lands on a multiple of `interval`.
/// Version 0 and a zero interval never snapshot.
pub fn should_take_snapshot(current_version: u64, interval: u64) -> bool {
    interval > 0 && current_version > 0 && current_version % interval == 0
}

/// Interval-based snapshot policy consulted after each commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    interval: u64,
}

impl SnapshotPolicy {
    pub fn every(interval: u64) -> Self {
        Self { interval }
    }

    pub fn never() -> Self {
        Self { interval: 0 }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// A batch can jump over a multiple (9 → 12 with interval 10), so the
    /// policy fires when any version in `(previous, current]` is a multiple.
    pub fn should_snapshot(&self, previous_version: u64, current_version: u64) -> bool {
        if self.interval == 0 || current_version <= previous_version {
            return false;
        }
        should_take_snapshot(current_version, self.interval)
            || current_version / self.interval > previous_version / self.interval
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::every(DEFAULT_SNAPSHOT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_on_interval_multiples_only() {
        assert!(!should_take_snapshot(0, 10));
        assert!(!should_take_snapshot(9, 10));
        assert!(should_take_snapshot(10, 10));
        assert!(!should_take_snapshot(11, 10));
        assert!(should_take_snapshot(20, 10));
        assert!(!should_take_snapshot(10, 0));
    }

    #[test]
    fn policy_catches_batches_that_cross_a_multiple() {
        let policy = SnapshotPolicy::default();
        assert!(policy.should_snapshot(9, 12));
        assert!(policy.should_snapshot(8, 10));
        assert!(!policy.should_snapshot(10, 12));
        assert!(!policy.should_snapshot(12, 12));
        assert!(!SnapshotPolicy::never().should_snapshot(0, 100));
    }
}
