//! Coordinator statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide transaction counters
pub struct TransactionStats {
    /// Top-level transactions begun
    pub begun: AtomicU64,
    /// Subtransactions begun
    pub nested_begun: AtomicU64,
    /// Transactions that committed
    pub committed: AtomicU64,
    /// Commits that skipped the prepare round
    pub one_phase_commits: AtomicU64,
    /// Commits where every participant voted read-only
    pub read_only_commits: AtomicU64,
    /// Transactions that rolled back
    pub aborted: AtomicU64,
    /// Completions with a heuristic outcome
    pub heuristic_outcomes: AtomicU64,
    /// Transactions the reaper expired
    pub timed_out: AtomicU64,
    /// Logs replayed to an outcome by recovery
    pub recovered: AtomicU64,
    /// Replays that failed or hit an anomaly
    pub recovery_failures: AtomicU64,
    /// Logs hidden after repeated replay failures
    pub quarantined: AtomicU64,
}

impl TransactionStats {
    /// All counters at zero
    pub fn new() -> Self {
        Self {
            begun: AtomicU64::new(0),
            nested_begun: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            one_phase_commits: AtomicU64::new(0),
            read_only_commits: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            heuristic_outcomes: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            recovery_failures: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> TransactionStatsSnapshot {
        TransactionStatsSnapshot {
            begun: self.begun.load(Ordering::Relaxed),
            nested_begun: self.nested_begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            one_phase_commits: self.one_phase_commits.load(Ordering::Relaxed),
            read_only_commits: self.read_only_commits.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            heuristic_outcomes: self.heuristic_outcomes.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            recovery_failures: self.recovery_failures.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
        }
    }
}

impl Default for TransactionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain-value copy of [`TransactionStats`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionStatsSnapshot {
    /// Top-level transactions begun
    pub begun: u64,
    /// Subtransactions begun
    pub nested_begun: u64,
    /// Transactions that committed
    pub committed: u64,
    /// Commits that skipped the prepare round
    pub one_phase_commits: u64,
    /// Commits where every participant voted read-only
    pub read_only_commits: u64,
    /// Transactions that rolled back
    pub aborted: u64,
    /// Completions with a heuristic outcome
    pub heuristic_outcomes: u64,
    /// Transactions the reaper expired
    pub timed_out: u64,
    /// Logs replayed to an outcome by recovery
    pub recovered: u64,
    /// Replays that failed or hit an anomaly
    pub recovery_failures: u64,
    /// Logs hidden after repeated replay failures
    pub quarantined: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_copies_counters() {
        let stats = TransactionStats::new();
        TransactionStats::incr(&stats.begun);
        TransactionStats::incr(&stats.begun);
        TransactionStats::incr(&stats.quarantined);
        assert_eq!(
            stats.snapshot(),
            TransactionStatsSnapshot {
                begun: 2,
                quarantined: 1,
                ..TransactionStatsSnapshot::default()
            }
        );
    }
}
