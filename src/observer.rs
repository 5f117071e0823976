//! Transaction observer trait

use crate::{ActionStatus, TwoPhaseOutcome, Uid};

/// Observer trait for external observability
pub trait TransactionObserver: Send + Sync + 'static {
    /// A coordinator was created
    fn on_begin(&self, uid: Uid, nested: bool);
    /// Prepare round finished with every participant voting yes
    fn on_prepared(&self, uid: Uid, participants: usize);
    /// Transaction committed
    fn on_committed(&self, uid: Uid, one_phase: bool);
    /// Transaction rolled back
    fn on_aborted(&self, uid: Uid, reason: &str);
    /// Phase two produced a heuristic outcome
    fn on_heuristic(&self, uid: Uid, outcome: TwoPhaseOutcome);
    /// Reaper marked the transaction rollback-only
    fn on_timeout(&self, uid: Uid, status: ActionStatus);
    /// Recovery replayed a persisted transaction
    fn on_recovered(&self, uid: Uid, resolved: bool);
    /// Recovery gave up retrying and hid the log
    fn on_recovery_quarantined(&self, uid: Uid, type_name: &str, attempts: u32);
}

/// No-op observer
pub struct NoOpObserver;

impl TransactionObserver for NoOpObserver {
    fn on_begin(&self, _uid: Uid, _nested: bool) {}
    fn on_prepared(&self, _uid: Uid, _participants: usize) {}
    fn on_committed(&self, _uid: Uid, _one_phase: bool) {}
    fn on_aborted(&self, _uid: Uid, _reason: &str) {}
    fn on_heuristic(&self, _uid: Uid, _outcome: TwoPhaseOutcome) {}
    fn on_timeout(&self, _uid: Uid, _status: ActionStatus) {}
    fn on_recovered(&self, _uid: Uid, _resolved: bool) {}
    fn on_recovery_quarantined(&self, _uid: Uid, _type_name: &str, _attempts: u32) {}
}

/// Tracing-based observer
pub struct TracingObserver;

impl TransactionObserver for TracingObserver {
    fn on_begin(&self, uid: Uid, nested: bool) {
        tracing::debug!(uid = %uid, nested, "Transaction begun");
    }

    fn on_prepared(&self, uid: Uid, participants: usize) {
        tracing::debug!(uid = %uid, participants, "Transaction prepared");
    }

    fn on_committed(&self, uid: Uid, one_phase: bool) {
        tracing::info!(uid = %uid, one_phase, "Transaction committed");
    }

    fn on_aborted(&self, uid: Uid, reason: &str) {
        tracing::info!(uid = %uid, reason = %reason, "Transaction rolled back");
    }

    fn on_heuristic(&self, uid: Uid, outcome: TwoPhaseOutcome) {
        tracing::warn!(uid = %uid, outcome = %outcome, "Heuristic outcome");
    }

    fn on_timeout(&self, uid: Uid, status: ActionStatus) {
        tracing::warn!(uid = %uid, status = %status, "Transaction timed out");
    }

    fn on_recovered(&self, uid: Uid, resolved: bool) {
        tracing::info!(uid = %uid, resolved, "Transaction replayed by recovery");
    }

    fn on_recovery_quarantined(&self, uid: Uid, type_name: &str, attempts: u32) {
        tracing::error!(uid = %uid, type_name = %type_name, attempts, "Recovery quarantined transaction log");
    }
}
