//! Crash recovery
//!
//! A [`RecoveryManager`] scans the store for intentions logs nobody in this
//! process owns, rebuilds a coordinator from each one and replays phase two
//! in the direction the persisted status dictates. Failed replays back off
//! and are eventually quarantined (hidden) so a poisoned log cannot stall
//! every scan. A second pass rolls back in-doubt resource branches that have
//! no log at all (presumed abort).

use crate::background::Background;
use crate::coordinator::CoordinatorEnv;
use crate::record::{ResourceDirectory, RestoreContext, XaError, Xid};
use crate::{
    Coordinator, ObjectStore, ProcessContext, RecoveryConfig, RecoveryError, StoreState,
    TransactionObserver, TransactionRegistry, TransactionStats, Uid,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// What happened to one log during a replay
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayResult {
    /// Every record finished; the log is gone
    Resolved,
    /// Only heuristic outcomes remain; the coordinator stays registered
    /// until they are forgotten
    AwaitingForget,
    /// Some records failed again; retried on a later scan
    Unresolved,
}

/// Summary of one recovery scan
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Log entries seen
    pub scanned: usize,
    /// Entries owned by a live coordinator
    pub live: usize,
    /// Entries hidden by an earlier quarantine
    pub hidden: usize,
    /// Entries still backing off
    pub deferred: usize,
    /// Replays that finished every record
    pub resolved: usize,
    /// Replays left with only heuristic outcomes
    pub awaiting_forget: usize,
    /// Replays that need another attempt
    pub unresolved: usize,
    /// Entries that could not be decoded or replayed
    pub anomalies: usize,
    /// Entries hidden during this scan
    pub quarantined: usize,
    /// In-doubt resource branches rolled back for lack of a log
    pub orphans_rolled_back: usize,
}

struct Attempts {
    count: u32,
    next_at: Instant,
}

/// Replays unfinished transactions left in the store
pub struct RecoveryManager {
    env: CoordinatorEnv,
    restore: RestoreContext,
    registry: Arc<TransactionRegistry>,
    store: Arc<dyn ObjectStore>,
    resources: Arc<ResourceDirectory>,
    observer: Arc<dyn TransactionObserver>,
    stats: Arc<TransactionStats>,
    config: RecoveryConfig,
    attempts: Mutex<HashMap<(Box<str>, Uid), Attempts>>,
}

impl RecoveryManager {
    /// Manager for the logs and resources of `context`
    pub fn new(context: &ProcessContext) -> Self {
        Self {
            env: context.env(),
            restore: context.restore_context(),
            registry: Arc::clone(context.registry()),
            store: Arc::clone(context.store()),
            resources: Arc::clone(context.resources()),
            observer: Arc::clone(context.observer()),
            stats: Arc::clone(context.stats_handle()),
            config: context.config().recovery.clone(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Settings in use
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    fn attempts(&self) -> MutexGuard<'_, HashMap<(Box<str>, Uid), Attempts>> {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Scan now
    pub fn scan(&self) -> ScanReport {
        self.scan_at(Instant::now())
    }

    /// Scan as if the time were `now` (backoff decisions use it)
    pub fn scan_at(&self, now: Instant) -> ScanReport {
        let mut report = ScanReport::default();
        for type_name in &self.config.recovery_types {
            let uids = match self.store.all_obj_uids(type_name) {
                Ok(uids) => uids,
                Err(e) => {
                    tracing::error!(type_name = %type_name, error = %e, "Cannot list logs");
                    report.anomalies += 1;
                    continue;
                }
            };
            for uid in uids {
                report.scanned += 1;
                self.scan_entry(type_name, uid, now, &mut report);
            }
        }
        self.roll_back_orphans(&mut report);
        if report.resolved + report.unresolved + report.quarantined + report.orphans_rolled_back
            > 0
        {
            tracing::info!(report = ?report, "Recovery scan finished");
        } else {
            tracing::debug!(report = ?report, "Recovery scan finished");
        }
        report
    }

    fn scan_entry(&self, type_name: &str, uid: Uid, now: Instant, report: &mut ScanReport) {
        if self.registry.contains(uid) {
            report.live += 1;
            return;
        }
        match self.store.current_state(uid, type_name) {
            Ok(state) if state.is_hidden() => {
                report.hidden += 1;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(uid = %uid, type_name = %type_name, error = %e, "Cannot read log state");
                report.anomalies += 1;
                return;
            }
        }
        let key = (Box::<str>::from(type_name), uid);
        if self
            .attempts()
            .get(&key)
            .is_some_and(|attempts| attempts.next_at > now)
        {
            report.deferred += 1;
            return;
        }

        match self.replay(uid, type_name) {
            Ok(ReplayResult::Resolved) => {
                self.attempts().remove(&key);
                report.resolved += 1;
            }
            Ok(ReplayResult::AwaitingForget) => {
                self.attempts().remove(&key);
                report.awaiting_forget += 1;
            }
            Ok(ReplayResult::Unresolved) => {
                report.unresolved += 1;
                self.note_failure(key, now, report);
            }
            Err(RecoveryError::Live(_)) => report.live += 1,
            Err(RecoveryError::NotFound { .. }) => {
                // finished by its owner after the listing
                tracing::debug!(uid = %uid, type_name = %type_name, "Log gone before replay");
                self.attempts().remove(&key);
                report.resolved += 1;
            }
            Err(e) => {
                tracing::warn!(uid = %uid, type_name = %type_name, error = %e, "Recovery anomaly");
                report.anomalies += 1;
                self.note_failure(key, now, report);
            }
        }
    }

    fn note_failure(&self, key: (Box<str>, Uid), now: Instant, report: &mut ScanReport) {
        TransactionStats::incr(&self.stats.recovery_failures);
        let count = {
            let mut attempts = self.attempts();
            let entry = attempts.entry(key.clone()).or_insert(Attempts {
                count: 0,
                next_at: now,
            });
            entry.count += 1;
            entry.next_at = now + self.config.replay_backoff.delay_for_attempt(entry.count);
            entry.count
        };
        if count < self.config.max_replay_attempts {
            return;
        }
        let (type_name, uid) = key;
        match self.store.hide_state(uid, &type_name) {
            Ok(_) => {
                self.attempts().remove(&(type_name.clone(), uid));
                TransactionStats::incr(&self.stats.quarantined);
                self.observer
                    .on_recovery_quarantined(uid, &type_name, count);
                tracing::error!(uid = %uid, type_name = %type_name, attempts = count, "Quarantined log after repeated replay failures");
                report.quarantined += 1;
            }
            Err(e) => {
                tracing::error!(uid = %uid, type_name = %type_name, error = %e, "Cannot quarantine log");
            }
        }
    }

    /// Rebuild and replay one logged transaction
    pub fn replay(&self, uid: Uid, type_name: &str) -> Result<ReplayResult, RecoveryError> {
        let Some(input) = self.store.read_committed(uid, type_name)? else {
            return Err(RecoveryError::NotFound {
                uid,
                type_name: type_name.into(),
            });
        };
        let coordinator = Coordinator::restore(input, self.env.clone(), &self.restore)?;
        let status = coordinator.status();
        let Some(direction) = status.replay_direction() else {
            return Err(RecoveryError::Corrupt {
                uid,
                reason: format!("logged status {status} cannot be replayed").into(),
            });
        };
        if !self.registry.insert_if_absent(Arc::clone(&coordinator)) {
            return Err(RecoveryError::Live(uid));
        }

        let result = if coordinator.is_resolved() {
            tracing::debug!(uid = %uid, "Log has nothing left to replay");
            if coordinator.counts().heuristic == 0 {
                self.store.remove_committed(uid, type_name)?;
            }
            self.settled(&coordinator)
        } else {
            let outcome = coordinator.replay(direction);
            tracing::info!(uid = %uid, direction = ?direction, outcome = %outcome, "Replayed logged transaction");
            self.settled(&coordinator)
        };

        if result != ReplayResult::AwaitingForget {
            self.registry.remove(uid);
        }
        if result != ReplayResult::Unresolved {
            TransactionStats::incr(&self.stats.recovered);
        }
        self.observer
            .on_recovered(uid, result == ReplayResult::Resolved);
        Ok(result)
    }

    fn settled(&self, coordinator: &Coordinator) -> ReplayResult {
        let counts = coordinator.counts();
        if counts.failed > 0 || counts.prepared > 0 {
            ReplayResult::Unresolved
        } else if counts.heuristic > 0 {
            ReplayResult::AwaitingForget
        } else {
            ReplayResult::Resolved
        }
    }

    /// Forget heuristic outcomes of a transaction, live or logged.
    /// Returns true once nothing awaits reconciliation.
    pub fn forget_heuristics(&self, uid: Uid) -> Result<bool, RecoveryError> {
        match self.registry.get(uid) {
            Some(coordinator) => Ok(coordinator.forget_heuristics()?),
            None => self.forget_logged(uid),
        }
    }

    /// Forget through a coordinator rebuilt from the log. The rebuilt
    /// coordinator holds the uid in the registry while it works, so a
    /// concurrent replay cannot drive the same log.
    fn forget_logged(&self, uid: Uid) -> Result<bool, RecoveryError> {
        for type_name in &self.config.recovery_types {
            let Some(input) = self.store.read_committed(uid, type_name)? else {
                continue;
            };
            let coordinator = Coordinator::restore(input, self.env.clone(), &self.restore)?;
            if !self.registry.insert_if_absent(Arc::clone(&coordinator)) {
                return Err(RecoveryError::Live(uid));
            }
            let forgotten = coordinator.forget_heuristics();
            self.registry.remove(uid);
            return Ok(forgotten?);
        }
        Err(RecoveryError::NotFound {
            uid,
            type_name: self.config.recovery_types.join(",").into(),
        })
    }

    /// Return a quarantined log to the scans
    pub fn reveal(&self, uid: Uid, type_name: &str) -> Result<bool, RecoveryError> {
        let revealed = self.store.reveal_state(uid, type_name)?;
        self.attempts().remove(&(Box::<str>::from(type_name), uid));
        if revealed {
            tracing::info!(uid = %uid, type_name = %type_name, "Quarantined log revealed");
        }
        Ok(revealed)
    }

    /// Does any recovery type hold a log (hidden or not) for `uid`?
    fn has_log(&self, uid: Uid) -> bool {
        self.config.recovery_types.iter().any(|type_name| {
            match self.store.current_state(uid, type_name) {
                Ok(state) => state != StoreState::Unknown,
                // unknown counts as present: never roll back what might be logged
                Err(_) => true,
            }
        })
    }

    fn roll_back_orphans(&self, report: &mut ScanReport) {
        for resource in self.resources.all() {
            let in_doubt = match resource.recover() {
                Ok(xids) => xids,
                Err(e) => {
                    tracing::warn!(resource = %resource.name(), error = %e, "Resource recovery scan failed");
                    continue;
                }
            };
            for xid in in_doubt.into_iter().filter(Xid::is_ours) {
                if self.registry.contains(xid.gtrid) || self.has_log(xid.gtrid) {
                    continue;
                }
                match resource.rollback(&xid) {
                    Ok(()) | Err(XaError::UnknownXid) | Err(XaError::RolledBack(_)) => {
                        tracing::info!(resource = %resource.name(), xid = %xid, "Rolled back orphaned branch");
                        report.orphans_rolled_back += 1;
                    }
                    Err(e) => {
                        tracing::warn!(resource = %resource.name(), xid = %xid, error = %e, "Cannot roll back orphaned branch");
                    }
                }
            }
        }
    }

    /// Run [`RecoveryManager::scan`] every scan period on the current tokio
    /// runtime
    pub fn spawn(self) -> RecoveryHandle {
        let manager = Arc::new(self);
        let period = manager.config.scan_period();
        let background = Background::every(period, move || {
            let manager = Arc::clone(&manager);
            async move {
                if let Err(e) = tokio::task::spawn_blocking(move || manager.scan()).await {
                    tracing::error!(error = %e, "Recovery scan failed");
                }
            }
        });
        RecoveryHandle { background }
    }
}

/// Running recovery loop. Dropping the handle stops it.
pub struct RecoveryHandle {
    background: Background,
}

impl RecoveryHandle {
    /// Has the loop exited?
    pub fn is_finished(&self) -> bool {
        self.background.is_finished()
    }

    /// Stop the loop and wait for it
    pub async fn shutdown(self) {
        self.background.shutdown().await;
    }
}
