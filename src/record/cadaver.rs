//! Read-only stand-in for an object that can no longer be reached

use super::{PersistenceRecord, RecordOps, ResourceKey};
use crate::{InputObjectState, ObjectStore, OutputObjectState, StateError, TwoPhaseOutcome, Uid};
use std::sync::Arc;

/// Takes the place of a persistence record whose object is gone, either
/// deleted inside the transaction or missing when recovery replays the log.
///
/// Nested prepare is read-only; every top-level operation succeeds without
/// touching the store apart from a best-effort shadow cleanup on abort.
pub struct CadaverRecord {
    uid: Uid,
    object: Uid,
    type_name: Box<str>,
    store: Arc<dyn ObjectStore>,
}

impl CadaverRecord {
    /// Cadaver for `object`
    pub fn new(uid: Uid, object: Uid, type_name: &str, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            uid,
            object,
            type_name: type_name.into(),
            store,
        }
    }

    /// Cadaver replacing `record`, keeping its uid and object identity
    pub fn for_persistence(record: &PersistenceRecord) -> Self {
        Self {
            uid: record.uid(),
            object: record.object_uid(),
            type_name: record.type_name().into(),
            store: record.store(),
        }
    }

    /// Object the cadaver stands in for
    pub fn object_uid(&self) -> Uid {
        self.object
    }

    /// Rebuild from a coordinator log entry
    pub fn restore(
        input: &mut InputObjectState,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, StateError> {
        let uid = input.unpack_uid()?;
        let object = input.unpack_uid()?;
        let type_name = input.unpack_string()?;
        Ok(Self::new(uid, object, &type_name, store))
    }
}

impl RecordOps for CadaverRecord {
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
        TwoPhaseOutcome::PrepareReadOnly
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
        TwoPhaseOutcome::FinishOk
    }

    fn top_level_abort(&mut self) -> TwoPhaseOutcome {
        if let Err(e) = self.store.remove_uncommitted(self.object, &self.type_name) {
            tracing::debug!(object = %self.object, error = %e, "Cadaver shadow cleanup failed");
        }
        TwoPhaseOutcome::FinishOk
    }

    fn save_state(&self, out: &mut OutputObjectState) {
        out.pack_uid(self.uid);
        out.pack_uid(self.object);
        out.pack_string(&self.type_name);
    }
}

impl std::fmt::Debug for CadaverRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CadaverRecord")
            .field("uid", &self.uid)
            .field("object", &self.object)
            .field("type_name", &self.type_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryObjectStore;

    #[test]
    fn operations_degrade_to_no_ops() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let mut cadaver = CadaverRecord::new(
            Uid::from_parts(6, 6, 6, 1),
            Uid::from_parts(6, 6, 6, 2),
            "/Objects/Gone",
            Arc::clone(&store),
        );
        assert_eq!(cadaver.nested_prepare(), TwoPhaseOutcome::PrepareReadOnly);
        assert_eq!(cadaver.top_level_prepare(), TwoPhaseOutcome::PrepareOk);
        assert_eq!(cadaver.top_level_commit(), TwoPhaseOutcome::FinishOk);
        assert_eq!(cadaver.top_level_abort(), TwoPhaseOutcome::FinishOk);
        assert_eq!(cadaver.one_phase_commit(), TwoPhaseOutcome::FinishOk);

        let mut out = OutputObjectState::new(Uid::from_parts(6, 6, 6, 3), "/Transaction/Coordinator");
        cadaver.save_state(&mut out);
        let mut input = InputObjectState::from(out);
        let restored = CadaverRecord::restore(&mut input, store).unwrap();
        assert_eq!(restored.object_uid(), cadaver.object_uid());
    }
}
