//! Commit-only removal of a stored object

use super::{RecordOps, ResourceKey};
use crate::{ObjectStore, OutputObjectState, TwoPhaseOutcome, Uid};
use std::sync::Arc;

/// Deletes an object's committed state when the enclosing top-level
/// transaction commits. Abort leaves the object alone. Never logged.
pub struct DisposeRecord {
    uid: Uid,
    object: Uid,
    type_name: Box<str>,
    store: Arc<dyn ObjectStore>,
}

impl DisposeRecord {
    /// Record disposing of `object` on commit
    pub fn new(uid: Uid, object: Uid, type_name: &str, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            uid,
            object,
            type_name: type_name.into(),
            store,
        }
    }

    /// Object to remove
    pub fn object_uid(&self) -> Uid {
        self.object
    }
}

impl RecordOps for DisposeRecord {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn resource_key(&self) -> ResourceKey {
        ResourceKey::Object(self.object)
    }

    fn do_save(&self) -> bool {
        false
    }

    fn nested_prepare(&mut self) -> TwoPhaseOutcome {
        TwoPhaseOutcome::PrepareOk
    }

    fn nested_commit(&mut self) -> TwoPhaseOutcome {
        TwoPhaseOutcome::FinishOk
    }

    fn nested_abort(&mut self) -> TwoPhaseOutcome {
        TwoPhaseOutcome::FinishOk
    }

    fn top_level_prepare(&mut self) -> TwoPhaseOutcome {
        TwoPhaseOutcome::PrepareOk
    }

    fn top_level_commit(&mut self) -> TwoPhaseOutcome {
        match self.store.remove_committed(self.object, &self.type_name) {
            Ok(_) => TwoPhaseOutcome::FinishOk,
            Err(e) => {
                tracing::warn!(object = %self.object, error = %e, "Dispose failed");
                TwoPhaseOutcome::FinishError
            }
        }
    }

    fn top_level_abort(&mut self) -> TwoPhaseOutcome {
        TwoPhaseOutcome::FinishOk
    }

    fn save_state(&self, _out: &mut OutputObjectState) {}
}

impl std::fmt::Debug for DisposeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisposeRecord")
            .field("uid", &self.uid)
            .field("object", &self.object)
            .field("type_name", &self.type_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryObjectStore, StoreState};

    #[test]
    fn removes_on_commit_only() {
        let store = Arc::new(InMemoryObjectStore::new());
        let object = Uid::from_parts(5, 5, 5, 1);
        let state = OutputObjectState::with_bytes(object, "/Objects/Doc", b"x".to_vec());
        store.write_committed(&state).unwrap();

        let mut record = DisposeRecord::new(
            Uid::from_parts(5, 5, 5, 2),
            object,
            "/Objects/Doc",
            Arc::clone(&store) as Arc<dyn ObjectStore>,
        );
        assert_eq!(record.top_level_abort(), TwoPhaseOutcome::FinishOk);
        assert_eq!(store.current_state(object, "/Objects/Doc").unwrap(), StoreState::Committed);

        assert_eq!(record.top_level_prepare(), TwoPhaseOutcome::PrepareOk);
        assert_eq!(record.top_level_commit(), TwoPhaseOutcome::FinishOk);
        assert_eq!(store.current_state(object, "/Objects/Doc").unwrap(), StoreState::Unknown);
        assert!(!record.do_save());
    }
}
