//! Process context: owns the registry, uid generator and shared services
//!
//! There is no ambient state. Every coordinator, the reaper, recovery and
//! the status responder reach process-wide services through a
//! [`ProcessContext`] built once by the embedding application.

use crate::config::{COORDINATOR_TYPE, SUBORDINATE_TYPE};
use crate::coordinator::CoordinatorEnv;
use crate::record::{ResourceDirectory, RestoreContext, XaResource};
use crate::{
    Coordinator, CoordinatorError, LockManager, ObjectStore, Reaper, RecoveryManager, Result,
    TransactionConfig, TransactionObserver, TransactionRegistry, TransactionStats,
    TransactionStatsSnapshot, TransactionStatusResolver, TwoPhaseOutcome, Uid, UidGenerator,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process-wide transaction services
pub struct ProcessContext {
    config: TransactionConfig,
    store: Arc<dyn ObjectStore>,
    uids: Arc<UidGenerator>,
    registry: Arc<TransactionRegistry>,
    resources: Arc<ResourceDirectory>,
    observer: Arc<dyn TransactionObserver>,
    stats: Arc<TransactionStats>,
}

impl ProcessContext {
    /// Context over `store`, reporting to `observer`
    pub fn new(
        config: TransactionConfig,
        store: Arc<dyn ObjectStore>,
        observer: Arc<dyn TransactionObserver>,
    ) -> Self {
        let uids = Arc::new(UidGenerator::new(config.node_id));
        Self::with_uid_generator(config, store, observer, uids)
    }

    /// Context with an explicit uid generator (fixed process identity)
    pub fn with_uid_generator(
        config: TransactionConfig,
        store: Arc<dyn ObjectStore>,
        observer: Arc<dyn TransactionObserver>,
        uids: Arc<UidGenerator>,
    ) -> Self {
        tracing::debug!(process = %uids.process_uid(), "Process context created");
        Self {
            config,
            store,
            uids,
            registry: Arc::new(TransactionRegistry::new()),
            resources: Arc::new(ResourceDirectory::new()),
            observer,
            stats: Arc::new(TransactionStats::new()),
        }
    }

    /// Configuration
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Object store
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Identity of this process in log headers and the status greeting
    pub fn process_uid(&self) -> Uid {
        self.uids.process_uid()
    }

    /// Fresh uid
    pub fn next_uid(&self) -> Uid {
        self.uids.next_uid()
    }

    /// Live coordinators
    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    /// Registered resource managers
    pub fn resources(&self) -> &Arc<ResourceDirectory> {
        &self.resources
    }

    /// Counters
    pub fn stats(&self) -> TransactionStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn observer(&self) -> &Arc<dyn TransactionObserver> {
        &self.observer
    }

    pub(crate) fn stats_handle(&self) -> &Arc<TransactionStats> {
        &self.stats
    }

    pub(crate) fn env(&self) -> CoordinatorEnv {
        CoordinatorEnv {
            store: Arc::clone(&self.store),
            uids: Arc::clone(&self.uids),
            observer: Arc::clone(&self.observer),
            stats: Arc::clone(&self.stats),
            registry: Arc::downgrade(&self.registry),
            process_uid: self.uids.process_uid(),
            one_phase: self.config.one_phase_commit,
        }
    }

    pub(crate) fn restore_context(&self) -> RestoreContext {
        RestoreContext {
            store: Arc::clone(&self.store),
            resources: Arc::clone(&self.resources),
        }
    }

    /// Begin a top-level transaction with the configured default timeout
    pub fn begin(&self) -> Result<Arc<Coordinator>> {
        self.begin_with_timeout(self.config.default_timeout())
    }

    /// Begin a top-level transaction. `None` never times out.
    pub fn begin_with_timeout(&self, timeout: Option<Duration>) -> Result<Arc<Coordinator>> {
        self.start(self.uids.next_uid(), COORDINATOR_TYPE, timeout)
    }

    /// Begin an interposed coordinator for a superior's transaction `uid`
    pub fn begin_subordinate(&self, uid: Uid) -> Result<Arc<Coordinator>> {
        self.start(uid, SUBORDINATE_TYPE, self.config.default_timeout())
    }

    fn start(
        &self,
        uid: Uid,
        type_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Arc<Coordinator>> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let coordinator = Coordinator::new_top_level(uid, type_name, deadline, self.env());
        if !self.registry.insert_if_absent(Arc::clone(&coordinator)) {
            return Err(CoordinatorError::AlreadyExists(uid));
        }
        TransactionStats::incr(&self.stats.begun);
        self.observer.on_begin(uid, false);
        Ok(coordinator)
    }

    /// Begin a subtransaction of `parent`. It expires with its parent.
    pub fn begin_nested(&self, parent: &Arc<Coordinator>) -> Result<Arc<Coordinator>> {
        let uid = self.uids.next_uid();
        let coordinator = Coordinator::new_nested(uid, parent, None)?;
        if !self.registry.insert_if_absent(Arc::clone(&coordinator)) {
            return Err(CoordinatorError::AlreadyExists(uid));
        }
        TransactionStats::incr(&self.stats.nested_begun);
        self.observer.on_begin(uid, true);
        Ok(coordinator)
    }

    /// Begin a top-level transaction that rolls back unless committed
    pub fn scope(&self) -> Result<TransactionScope> {
        Ok(TransactionScope {
            coordinator: self.begin()?,
            finished: false,
        })
    }

    /// Live coordinator for `uid`
    pub fn get(&self, uid: Uid) -> Option<Arc<Coordinator>> {
        self.registry.get(uid)
    }

    /// Make a resource manager available to recovery by its name
    pub fn register_resource(&self, resource: Arc<dyn XaResource>) {
        self.resources.register(resource);
    }

    /// Lock manager for a family of objects using the configured retry policy
    pub fn lock_manager(&self, name: &str) -> Arc<LockManager> {
        Arc::new(LockManager::new(name, self.config.lock_retry.clone()))
    }

    /// Status responder over this process's registry and store
    pub fn status_resolver(&self) -> TransactionStatusResolver {
        TransactionStatusResolver::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            self.uids.process_uid(),
        )
    }

    /// Timeout reaper over this process's registry
    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.observer),
            Arc::clone(&self.stats),
            self.config.reaper_interval(),
        )
    }

    /// Recovery manager for logs left in the store
    pub fn recovery_manager(&self) -> RecoveryManager {
        RecoveryManager::new(self)
    }
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("process", &self.uids.process_uid())
            .field("live", &self.registry.len())
            .finish()
    }
}

/// Top-level transaction that is rolled back on drop unless finished
#[must_use = "dropping the scope rolls the transaction back"]
pub struct TransactionScope {
    coordinator: Arc<Coordinator>,
    finished: bool,
}

impl TransactionScope {
    /// The transaction
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Transaction id
    pub fn uid(&self) -> Uid {
        self.coordinator.uid()
    }

    /// Commit and release the scope
    pub fn commit(mut self, report_heuristics: bool) -> Result<TwoPhaseOutcome> {
        self.finished = true;
        self.coordinator.commit(report_heuristics)
    }

    /// Roll back and release the scope
    pub fn abort(mut self) -> Result<TwoPhaseOutcome> {
        self.finished = true;
        self.coordinator.abort()
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.finished || self.coordinator.status().is_terminal() {
            return;
        }
        let uid = self.coordinator.uid();
        tracing::warn!(uid = %uid, "Transaction scope dropped unfinished, rolling back");
        if let Err(e) = self.coordinator.abort() {
            tracing::debug!(uid = %uid, error = %e, "Rollback on drop skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActionStatus, InMemoryObjectStore, NoOpObserver};

    fn context() -> ProcessContext {
        ProcessContext::with_uid_generator(
            TransactionConfig::default(),
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(NoOpObserver),
            Arc::new(UidGenerator::with_parts(9, 9, 9)),
        )
    }

    #[test]
    fn begin_registers_until_finished() {
        let ctx = context();
        let tx = ctx.begin().unwrap();
        assert!(ctx.get(tx.uid()).is_some());
        assert_eq!(tx.hierarchy().depth(), 1);
        assert!(tx.deadline().is_some());

        let nested = ctx.begin_nested(&tx).unwrap();
        assert_eq!(nested.parent().map(|p| p.uid()), Some(tx.uid()));
        assert_eq!(ctx.registry().len(), 2);

        nested.commit(true).unwrap();
        tx.commit(true).unwrap();
        assert!(ctx.registry().is_empty());
        let stats = ctx.stats();
        assert_eq!(stats.begun, 1);
        assert_eq!(stats.nested_begun, 1);
        assert_eq!(stats.committed, 1);
    }

    #[test]
    fn subordinate_uid_cannot_be_reused() {
        let ctx = context();
        let superior = Uid::from_parts(1, 1, 1, 1);
        let sub = ctx.begin_subordinate(superior).unwrap();
        assert!(sub.is_subordinate());
        assert!(matches!(
            ctx.begin_subordinate(superior),
            Err(CoordinatorError::AlreadyExists(_))
        ));
    }

    #[test]
    fn dropped_scope_rolls_back() {
        let ctx = context();
        let scope = ctx.scope().unwrap();
        let tx = Arc::clone(scope.coordinator());
        drop(scope);
        assert_eq!(tx.status(), ActionStatus::Aborted);
        assert!(ctx.registry().is_empty());

        let scope = ctx.scope().unwrap();
        let tx = Arc::clone(scope.coordinator());
        assert_eq!(scope.commit(true).unwrap(), TwoPhaseOutcome::FinishOk);
        assert_eq!(tx.status(), ActionStatus::Committed);
    }
}
