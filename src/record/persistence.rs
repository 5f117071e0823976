//! Write-ahead object state record

use super::{RecordOps, ResourceKey};
use crate::{
    InputObjectState, ObjectStore, OutputObjectState, StateError, StoreState, TwoPhaseOutcome, Uid,
};
use std::sync::Arc;

/// Stored image of an object written by a transaction: header(originating
/// process, transaction), then the packed before and after states.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectImage {
    /// Process whose coordinator wrote the image
    pub process: Uid,
    /// Top-level transaction that wrote it
    pub transaction: Uid,
    /// State at enlistment
    pub before: Vec<u8>,
    /// State the transaction installs
    pub after: Vec<u8>,
}

impl ObjectImage {
    /// Decode an image read back from the store
    pub fn unpack(input: &mut InputObjectState) -> Result<Self, StateError> {
        let (process, transaction) = input.unpack_header()?;
        let before = input.unpack_bytes()?;
        let after = input.unpack_bytes()?;
        Ok(Self {
            process,
            transaction,
            before,
            after,
        })
    }
}

/// Carries an object's before and after images.
///
/// Prepare writes the object image as the uncommitted (shadow) state,
/// commit promotes it, abort discards it. Nested operations touch nothing in
/// the store; the record is simply merged into the parent.
pub struct PersistenceRecord {
    uid: Uid,
    process: Uid,
    transaction: Uid,
    object: Uid,
    type_name: Box<str>,
    before: Vec<u8>,
    after: Vec<u8>,
    store: Arc<dyn ObjectStore>,
}

impl PersistenceRecord {
    /// Record for `object` moving from `before` to `after`
    pub fn new(
        uid: Uid,
        object: Uid,
        type_name: &str,
        before: Vec<u8>,
        after: Vec<u8>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            uid,
            process: Uid::NIL,
            transaction: Uid::NIL,
            object,
            type_name: type_name.into(),
            before,
            after,
            store,
        }
    }

    /// Stamp the originating process and top-level transaction carried in
    /// every image this record writes
    pub fn with_origin(mut self, process: Uid, transaction: Uid) -> Self {
        self.process = process;
        self.transaction = transaction;
        self
    }

    /// Originating process
    pub fn process_uid(&self) -> Uid {
        self.process
    }

    /// Transaction named in the header
    pub fn transaction_uid(&self) -> Uid {
        self.transaction
    }

    /// Object being written
    pub fn object_uid(&self) -> Uid {
        self.object
    }

    /// Object's store type
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// State at enlistment
    pub fn before(&self) -> &[u8] {
        &self.before
    }

    /// State to commit
    pub fn after(&self) -> &[u8] {
        &self.after
    }

    pub(crate) fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    /// Fold in a record from a committed subtransaction: keep the oldest
    /// before image, take the newest after image.
    pub fn merge(&mut self, other: PersistenceRecord) {
        self.after = other.after;
    }

    /// Is the prepared shadow still in the store? Read errors count as
    /// present so the record keeps being retried.
    pub(crate) fn shadow_present(&self) -> bool {
        match self.store.current_state(self.object, &self.type_name) {
            Ok(state) => state.has_uncommitted(),
            Err(e) => {
                tracing::warn!(object = %self.object, error = %e, "Cannot read object state");
                true
            }
        }
    }

    /// The image prepare and one-phase commit write for the object
    pub fn image(&self) -> OutputObjectState {
        let mut out = OutputObjectState::new(self.object, &self.type_name);
        out.pack_header(self.process, self.transaction);
        out.pack_bytes(&self.before);
        out.pack_bytes(&self.after);
        out
    }

    /// Rebuild from a coordinator log entry
    pub fn restore(
        input: &mut InputObjectState,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, StateError> {
        let (process, transaction) = input.unpack_header()?;
        let uid = input.unpack_uid()?;
        let object = input.unpack_uid()?;
        let type_name = input.unpack_string()?;
        let before = input.unpack_bytes()?;
        let after = input.unpack_bytes()?;
        Ok(
            Self::new(uid, object, &type_name, before, after, store)
                .with_origin(process, transaction),
        )
    }
}

impl RecordOps for PersistenceRecord {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn resource_key(&self) -> ResourceKey {
        ResourceKey::Object(self.object)
    }

    fn do_save(&self) -> bool {
        true
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
        match self.store.write_uncommitted(&self.image()) {
            Ok(()) => TwoPhaseOutcome::PrepareOk,
            Err(e) => {
                tracing::warn!(object = %self.object, error = %e, "Shadow write failed");
                TwoPhaseOutcome::PrepareNotOk
            }
        }
    }

    fn top_level_commit(&mut self) -> TwoPhaseOutcome {
        match self.store.commit_state(self.object, &self.type_name) {
            Ok(true) => TwoPhaseOutcome::FinishOk,
            Ok(false) => match self.store.current_state(self.object, &self.type_name) {
                // replay after the shadow was already promoted
                Ok(StoreState::Committed) => TwoPhaseOutcome::FinishOk,
                Ok(state) => {
                    tracing::warn!(object = %self.object, state = ?state, "No shadow to commit");
                    TwoPhaseOutcome::FinishError
                }
                Err(e) => {
                    tracing::warn!(object = %self.object, error = %e, "Cannot read object state");
                    TwoPhaseOutcome::FinishError
                }
            },
            Err(e) => {
                tracing::warn!(object = %self.object, error = %e, "Commit of shadow failed");
                TwoPhaseOutcome::FinishError
            }
        }
    }

    fn top_level_abort(&mut self) -> TwoPhaseOutcome {
        match self.store.remove_uncommitted(self.object, &self.type_name) {
            Ok(_) => TwoPhaseOutcome::FinishOk,
            Err(e) => {
                tracing::warn!(object = %self.object, error = %e, "Shadow removal failed");
                TwoPhaseOutcome::FinishError
            }
        }
    }

    fn one_phase_commit(&mut self) -> TwoPhaseOutcome {
        match self.store.write_committed(&self.image()) {
            Ok(()) => TwoPhaseOutcome::FinishOk,
            Err(e) => {
                tracing::warn!(object = %self.object, error = %e, "One-phase write failed");
                TwoPhaseOutcome::OnePhaseError
            }
        }
    }

    fn save_state(&self, out: &mut OutputObjectState) {
        out.pack_header(self.process, self.transaction);
        out.pack_uid(self.uid);
        out.pack_uid(self.object);
        out.pack_string(&self.type_name);
        out.pack_bytes(&self.before);
        out.pack_bytes(&self.after);
    }
}

impl std::fmt::Debug for PersistenceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceRecord")
            .field("uid", &self.uid)
            .field("transaction", &self.transaction)
            .field("object", &self.object)
            .field("type_name", &self.type_name)
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryObjectStore;

    const TYPE: &str = "/Objects/Account";

    fn uid(n: u32) -> Uid {
        Uid::from_parts(4, 4, 4, n)
    }

    fn record(store: &Arc<InMemoryObjectStore>) -> PersistenceRecord {
        PersistenceRecord::new(
            uid(1),
            uid(10),
            TYPE,
            b"balance=10".to_vec(),
            b"balance=25".to_vec(),
            Arc::clone(store) as Arc<dyn ObjectStore>,
        )
        .with_origin(uid(500), uid(600))
    }

    fn stored_image(store: &InMemoryObjectStore, committed: bool) -> ObjectImage {
        let mut input = if committed {
            store.read_committed(uid(10), TYPE)
        } else {
            store.read_uncommitted(uid(10), TYPE)
        }
        .unwrap()
        .unwrap();
        let image = ObjectImage::unpack(&mut input).unwrap();
        assert_eq!(input.remaining(), 0);
        image
    }

    #[test]
    fn save_and_restore_keep_exact_images() {
        let store = Arc::new(InMemoryObjectStore::new());
        let original = record(&store);
        let mut out = OutputObjectState::new(uid(99), "/Transaction/Coordinator");
        original.save_state(&mut out);

        let mut header = InputObjectState::from(out.clone());
        assert_eq!(header.unpack_header().unwrap(), (uid(500), uid(600)));

        let mut input = InputObjectState::from(out);
        let restored = PersistenceRecord::restore(&mut input, store).unwrap();
        assert_eq!(input.remaining(), 0);
        assert_eq!(restored.uid(), original.uid());
        assert_eq!(restored.process_uid(), uid(500));
        assert_eq!(restored.transaction_uid(), uid(600));
        assert_eq!(restored.object_uid(), uid(10));
        assert_eq!(restored.type_name(), TYPE);
        assert_eq!(restored.before(), b"balance=10");
        assert_eq!(restored.after(), b"balance=25");
    }

    #[test]
    fn prepare_commit_promotes_shadow() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut rec = record(&store);
        assert_eq!(rec.top_level_prepare(), TwoPhaseOutcome::PrepareOk);
        assert_eq!(store.current_state(uid(10), TYPE).unwrap(), StoreState::Uncommitted);
        assert!(rec.shadow_present());
        let shadow = stored_image(&store, false);
        assert_eq!(
            shadow,
            ObjectImage {
                process: uid(500),
                transaction: uid(600),
                before: b"balance=10".to_vec(),
                after: b"balance=25".to_vec(),
            }
        );

        assert_eq!(rec.top_level_commit(), TwoPhaseOutcome::FinishOk);
        assert_eq!(store.current_state(uid(10), TYPE).unwrap(), StoreState::Committed);
        assert_eq!(stored_image(&store, true), shadow);

        // replaying the commit is harmless
        assert_eq!(rec.top_level_commit(), TwoPhaseOutcome::FinishOk);
    }

    #[test]
    fn abort_discards_shadow() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut rec = record(&store);
        rec.top_level_prepare();
        assert_eq!(rec.top_level_abort(), TwoPhaseOutcome::FinishOk);
        assert_eq!(store.current_state(uid(10), TYPE).unwrap(), StoreState::Unknown);
        assert!(!rec.shadow_present());
    }

    #[test]
    fn one_phase_writes_committed_directly() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut rec = record(&store);
        assert_eq!(rec.one_phase_commit(), TwoPhaseOutcome::FinishOk);
        assert_eq!(store.current_state(uid(10), TYPE).unwrap(), StoreState::Committed);
        let image = stored_image(&store, true);
        assert_eq!((image.process, image.transaction), (uid(500), uid(600)));
        assert_eq!(image.after, b"balance=25");
    }

    #[test]
    fn merge_keeps_first_before_and_last_after() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut parent = record(&store);
        let child = PersistenceRecord::new(
            uid(2),
            uid(10),
            TYPE,
            b"balance=25".to_vec(),
            b"balance=40".to_vec(),
            store,
        );
        parent.merge(child);
        assert_eq!(parent.before(), b"balance=10");
        assert_eq!(parent.after(), b"balance=40");
    }
}
