//! Lock ownership record

use super::{RecordOps, ResourceKey};
use crate::{ActionHierarchy, LockManager, LockMode, OutputObjectState, TwoPhaseOutcome, Uid};
use std::sync::Arc;

/// Ties a granted lock to the transaction that owns it.
///
/// Nested commit hands the lock to the parent scope, nested abort releases
/// it. At top level read locks go at prepare time (the record votes
/// read-only); write locks are held until the outcome is decided.
pub struct LockRecord {
    uid: Uid,
    manager: Arc<LockManager>,
    object: Uid,
    hierarchy: ActionHierarchy,
    mode: LockMode,
}

impl LockRecord {
    /// Record for a lock `hierarchy`'s deepest scope holds on `object`
    pub fn new(
        uid: Uid,
        manager: Arc<LockManager>,
        object: Uid,
        hierarchy: ActionHierarchy,
        mode: LockMode,
    ) -> Self {
        Self {
            uid,
            manager,
            object,
            hierarchy,
            mode,
        }
    }

    /// Strongest mode held
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Locked object
    pub fn object_uid(&self) -> Uid {
        self.object
    }

    /// Fold in a record for the same lock
    pub fn merge(&mut self, other: LockRecord) {
        self.mode = self.mode.max(other.mode);
    }

    fn release(&self) {
        if let Some(owner) = self.hierarchy.deepest() {
            self.manager.release_all(self.object, owner);
        }
    }
}

impl RecordOps for LockRecord {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn resource_key(&self) -> ResourceKey {
        ResourceKey::Lock {
            manager: self.manager.name().into(),
            object: self.object,
        }
    }

    fn do_save(&self) -> bool {
        false
    }

    fn nested_prepare(&mut self) -> TwoPhaseOutcome {
        TwoPhaseOutcome::PrepareOk
    }

    fn nested_commit(&mut self) -> TwoPhaseOutcome {
        self.manager.propagate(self.object, &self.hierarchy);
        self.hierarchy.pop();
        TwoPhaseOutcome::FinishOk
    }

    fn nested_abort(&mut self) -> TwoPhaseOutcome {
        self.release();
        TwoPhaseOutcome::FinishOk
    }

    fn top_level_prepare(&mut self) -> TwoPhaseOutcome {
        if self.mode == LockMode::Read {
            self.release();
            return TwoPhaseOutcome::PrepareReadOnly;
        }
        TwoPhaseOutcome::PrepareOk
    }

    fn top_level_commit(&mut self) -> TwoPhaseOutcome {
        self.release();
        TwoPhaseOutcome::FinishOk
    }

    fn top_level_abort(&mut self) -> TwoPhaseOutcome {
        self.release();
        TwoPhaseOutcome::FinishOk
    }

    fn save_state(&self, _out: &mut OutputObjectState) {}
}

impl std::fmt::Debug for LockRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRecord")
            .field("uid", &self.uid)
            .field("manager", &self.manager.name())
            .field("object", &self.object)
            .field("owner", &self.hierarchy.deepest())
            .field("mode", &self.mode)
            .finish()
    }
}
