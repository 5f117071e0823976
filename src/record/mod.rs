//! Participant records: the units of work a coordinator drives through 2PC
//!
//! The set of record kinds is closed, so records are one tagged enum,
//! [`ParticipantRecord`]. Each variant implements [`RecordOps`], and the enum
//! dispatches to it. Conflict-resolution predicates default to "no" through
//! the free functions at the bottom of this module.

mod cadaver;
mod dispose;
mod list;
mod lock;
mod persistence;
mod resource;

pub use cadaver::CadaverRecord;
pub use dispose::DisposeRecord;
pub use list::{InsertOutcome, RecordList};
pub use lock::LockRecord;
pub use persistence::{ObjectImage, PersistenceRecord};
pub use resource::{
    ResourceDirectory, ResourceRecord, XaError, XaResource, XaVote, Xid, XID_FORMAT_ID,
};

use crate::{InputObjectState, ObjectStore, OutputObjectState, StateError, TwoPhaseOutcome, Uid};
use std::sync::Arc;

/// Record variant tag, also used as the persisted type tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Write-ahead object state
    Persistence,
    /// External two-phase resource
    Resource,
    /// Commit-only removal of an object
    Dispose,
    /// Read-only placeholder for an object that is gone
    Cadaver,
    /// Lock ownership
    Lock,
}

impl RecordKind {
    /// Persisted tag
    pub fn tag(&self) -> u8 {
        match self {
            Self::Persistence => 1,
            Self::Resource => 2,
            Self::Dispose => 3,
            Self::Cadaver => 4,
            Self::Lock => 5,
        }
    }

    /// Inverse of [`RecordKind::tag`]
    pub fn from_tag(tag: u8) -> Result<Self, StateError> {
        match tag {
            1 => Ok(Self::Persistence),
            2 => Ok(Self::Resource),
            3 => Ok(Self::Dispose),
            4 => Ok(Self::Cadaver),
            5 => Ok(Self::Lock),
            other => Err(StateError::UnknownTag {
                what: "record kind",
                tag: other as u32,
            }),
        }
    }
}

/// Identity of the underlying resource a record works on. Two records with
/// equal keys are candidates for merge, replacement or rejection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    /// A stored object
    Object(Uid),
    /// A branch of an external resource manager
    Xa {
        /// Resource manager name
        resource: Box<str>,
        /// Branch qualifier uid
        branch: Uid,
    },
    /// Locks on an object held through a named manager
    Lock {
        /// Lock manager name
        manager: Box<str>,
        /// Locked object
        object: Uid,
    },
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Object(uid) => write!(f, "object {uid}"),
            Self::Xa { resource, branch } => write!(f, "xa {resource} branch {branch}"),
            Self::Lock { manager, object } => write!(f, "lock {manager}/{object}"),
        }
    }
}

/// What a restored record needs from the process that recovers it
#[derive(Clone)]
pub struct RestoreContext {
    /// Store persistence records write through
    pub store: Arc<dyn ObjectStore>,
    /// Reconnect table for external resources
    pub resources: Arc<ResourceDirectory>,
}

/// Capability set every record variant provides
pub trait RecordOps {
    /// Record's own uid
    fn uid(&self) -> Uid;

    /// Underlying resource identity
    fn resource_key(&self) -> ResourceKey;

    /// Does this record need to appear in the coordinator log?
    fn do_save(&self) -> bool;

    /// Can this record fold prepare and commit into one call?
    fn supports_one_phase(&self) -> bool {
        true
    }

    /// Prepare inside a subtransaction; never touches the real resource
    fn nested_prepare(&mut self) -> TwoPhaseOutcome;

    /// Commit a subtransaction; only local bookkeeping changes
    fn nested_commit(&mut self) -> TwoPhaseOutcome;

    /// Abort a subtransaction
    fn nested_abort(&mut self) -> TwoPhaseOutcome;

    /// Phase one
    fn top_level_prepare(&mut self) -> TwoPhaseOutcome;

    /// Phase two, commit direction
    fn top_level_commit(&mut self) -> TwoPhaseOutcome;

    /// Phase two, abort direction
    fn top_level_abort(&mut self) -> TwoPhaseOutcome;

    /// Prepare and commit in one step
    fn one_phase_commit(&mut self) -> TwoPhaseOutcome
    where
        Self: Sized,
    {
        one_phase_via_two_phase(self)
    }

    /// Drop heuristic knowledge at the resource. True once forgotten.
    fn forget_heuristic(&mut self) -> bool {
        true
    }

    /// Pack enough state to rebuild the record after a crash
    fn save_state(&self, out: &mut OutputObjectState);
}

/// Fold prepare and commit for records without a native one-phase path
pub fn one_phase_via_two_phase<R: RecordOps>(record: &mut R) -> TwoPhaseOutcome {
    match record.top_level_prepare() {
        TwoPhaseOutcome::PrepareReadOnly => TwoPhaseOutcome::FinishOk,
        TwoPhaseOutcome::PrepareOk => match record.top_level_commit() {
            TwoPhaseOutcome::FinishOk | TwoPhaseOutcome::HeuristicCommit => TwoPhaseOutcome::FinishOk,
            TwoPhaseOutcome::HeuristicRollback => TwoPhaseOutcome::OnePhaseError,
            _ => TwoPhaseOutcome::HeuristicHazard,
        },
        _ => {
            record.top_level_abort();
            TwoPhaseOutcome::OnePhaseError
        }
    }
}

/// Default for `should_add`: records for the same resource do not coexist
pub fn default_should_add(_existing: &ParticipantRecord, _incoming: &ParticipantRecord) -> bool {
    false
}

/// Default for `should_merge`
pub fn default_should_merge(_existing: &ParticipantRecord, _incoming: &ParticipantRecord) -> bool {
    false
}

/// Default for `should_replace`
pub fn default_should_replace(
    _existing: &ParticipantRecord,
    _incoming: &ParticipantRecord,
) -> bool {
    false
}

/// One enlisted participant
#[derive(Debug)]
pub enum ParticipantRecord {
    /// Write-ahead object state
    Persistence(PersistenceRecord),
    /// External two-phase resource
    Resource(ResourceRecord),
    /// Commit-only object removal
    Dispose(DisposeRecord),
    /// Placeholder for an object that can no longer be reached
    Cadaver(CadaverRecord),
    /// Lock ownership
    Lock(LockRecord),
}

macro_rules! dispatch {
    ($self:expr, $record:ident => $body:expr) => {
        match $self {
            ParticipantRecord::Persistence($record) => $body,
            ParticipantRecord::Resource($record) => $body,
            ParticipantRecord::Dispose($record) => $body,
            ParticipantRecord::Cadaver($record) => $body,
            ParticipantRecord::Lock($record) => $body,
        }
    };
}

impl ParticipantRecord {
    /// Variant tag
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Persistence(_) => RecordKind::Persistence,
            Self::Resource(_) => RecordKind::Resource,
            Self::Dispose(_) => RecordKind::Dispose,
            Self::Cadaver(_) => RecordKind::Cadaver,
            Self::Lock(_) => RecordKind::Lock,
        }
    }

    /// Record uid
    pub fn uid(&self) -> Uid {
        dispatch!(self, r => r.uid())
    }

    /// Underlying resource identity
    pub fn resource_key(&self) -> ResourceKey {
        dispatch!(self, r => r.resource_key())
    }

    /// Needs to be logged
    pub fn do_save(&self) -> bool {
        dispatch!(self, r => r.do_save())
    }

    /// Can this record be written to and restored from the coordinator log?
    pub fn persistable(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Resource(_) | Self::Cadaver(_))
    }

    /// Supports one-phase commit
    pub fn supports_one_phase(&self) -> bool {
        dispatch!(self, r => r.supports_one_phase())
    }

    /// Nested prepare
    pub fn nested_prepare(&mut self) -> TwoPhaseOutcome {
        dispatch!(self, r => r.nested_prepare())
    }

    /// Nested commit
    pub fn nested_commit(&mut self) -> TwoPhaseOutcome {
        dispatch!(self, r => r.nested_commit())
    }

    /// Nested abort
    pub fn nested_abort(&mut self) -> TwoPhaseOutcome {
        dispatch!(self, r => r.nested_abort())
    }

    /// Top-level prepare
    pub fn top_level_prepare(&mut self) -> TwoPhaseOutcome {
        dispatch!(self, r => r.top_level_prepare())
    }

    /// Top-level commit
    pub fn top_level_commit(&mut self) -> TwoPhaseOutcome {
        dispatch!(self, r => r.top_level_commit())
    }

    /// Top-level abort
    pub fn top_level_abort(&mut self) -> TwoPhaseOutcome {
        dispatch!(self, r => r.top_level_abort())
    }

    /// One-phase commit
    pub fn one_phase_commit(&mut self) -> TwoPhaseOutcome {
        dispatch!(self, r => r.one_phase_commit())
    }

    /// Forget a heuristic outcome
    pub fn forget_heuristic(&mut self) -> bool {
        dispatch!(self, r => r.forget_heuristic())
    }

    /// Finished, but the resource still remembers a heuristic decision
    pub fn awaiting_forget(&self) -> bool {
        matches!(self, Self::Resource(r) if r.heuristic().is_some())
    }

    /// Should `incoming` be kept alongside `self`?
    pub fn should_add(&self, incoming: &ParticipantRecord) -> bool {
        match (self, incoming) {
            (Self::Persistence(_) | Self::Cadaver(_), Self::Dispose(_)) => true,
            _ => default_should_add(self, incoming),
        }
    }

    /// Should `incoming` be folded into `self`?
    pub fn should_merge(&self, incoming: &ParticipantRecord) -> bool {
        match (self, incoming) {
            (Self::Persistence(_), Self::Persistence(_)) => true,
            (Self::Cadaver(_), Self::Cadaver(_)) => true,
            (Self::Dispose(_), Self::Dispose(_)) => true,
            (Self::Lock(_), Self::Lock(_)) => true,
            _ => default_should_merge(self, incoming),
        }
    }

    /// Should `incoming` take `self`'s place?
    pub fn should_replace(&self, incoming: &ParticipantRecord) -> bool {
        match (self, incoming) {
            (Self::Persistence(_), Self::Cadaver(_)) => true,
            _ => default_should_replace(self, incoming),
        }
    }

    /// Fold a record from a committed subtransaction into this one
    pub fn merge(&mut self, incoming: ParticipantRecord) {
        match (self, incoming) {
            (Self::Persistence(mine), Self::Persistence(theirs)) => mine.merge(theirs),
            (Self::Lock(mine), Self::Lock(theirs)) => mine.merge(theirs),
            (Self::Cadaver(_), Self::Cadaver(_)) | (Self::Dispose(_), Self::Dispose(_)) => {}
            (mine, theirs) => {
                tracing::warn!(
                    existing = ?mine.kind(),
                    incoming = ?theirs.kind(),
                    "Ignoring merge of mismatched record kinds"
                );
            }
        }
    }

    /// Pack the record for the coordinator log
    pub fn save_state(&self, out: &mut OutputObjectState) {
        dispatch!(self, r => r.save_state(out))
    }

    /// Rebuild a logged record
    pub fn restore(
        kind: RecordKind,
        input: &mut InputObjectState,
        ctx: &RestoreContext,
    ) -> Result<ParticipantRecord, StateError> {
        match kind {
            RecordKind::Persistence => {
                PersistenceRecord::restore(input, Arc::clone(&ctx.store)).map(Self::Persistence)
            }
            RecordKind::Resource => {
                ResourceRecord::restore(input, &ctx.resources).map(Self::Resource)
            }
            RecordKind::Cadaver => {
                CadaverRecord::restore(input, Arc::clone(&ctx.store)).map(Self::Cadaver)
            }
            RecordKind::Dispose | RecordKind::Lock => Err(StateError::UnknownTag {
                what: "persistable record kind",
                tag: kind.tag() as u32,
            }),
        }
    }

    pub(crate) fn mark_recovered(&mut self) {
        if let Self::Resource(r) = self {
            r.mark_recovered();
        }
    }

    /// Swap a persistence record whose shadow state is gone for a cadaver
    pub(crate) fn into_cadaver_if_unreachable(self) -> ParticipantRecord {
        match self {
            Self::Persistence(p) if !p.shadow_present() => {
                tracing::info!(object = %p.object_uid(), "Object state gone, using cadaver record");
                Self::Cadaver(CadaverRecord::for_persistence(&p))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryObjectStore, LockManager, LockMode, RetryPolicy};

    fn store() -> Arc<dyn ObjectStore> {
        Arc::new(InMemoryObjectStore::new())
    }

    fn uid(n: u32) -> Uid {
        Uid::from_parts(2, 2, 2, n)
    }

    fn persistence(record: u32, object: u32) -> ParticipantRecord {
        ParticipantRecord::Persistence(PersistenceRecord::new(
            uid(record),
            uid(object),
            "/Objects/Account",
            b"before".to_vec(),
            b"after".to_vec(),
            store(),
        ))
    }

    #[test]
    fn cadaver_replaces_persistence_for_same_object() {
        let p = persistence(1, 10);
        let cadaver = match &p {
            ParticipantRecord::Persistence(p) => {
                ParticipantRecord::Cadaver(CadaverRecord::for_persistence(p))
            }
            _ => unreachable!(),
        };
        assert_eq!(p.resource_key(), cadaver.resource_key());
        assert!(p.should_replace(&cadaver));
        assert!(!cadaver.should_replace(&p));
    }

    #[test]
    fn dispose_coexists_with_persistence() {
        let p = persistence(1, 10);
        let d = ParticipantRecord::Dispose(DisposeRecord::new(
            uid(2),
            uid(10),
            "/Objects/Account",
            store(),
        ));
        assert!(p.should_add(&d));
        assert!(!d.should_add(&p));
    }

    #[test]
    fn resources_default_to_no_merge() {
        let xid = Xid::new(uid(50), uid(51));
        let a = ParticipantRecord::Resource(ResourceRecord::unconnected(uid(3), xid.clone(), "db"));
        let b = ParticipantRecord::Resource(ResourceRecord::unconnected(uid(4), xid, "db"));
        assert_eq!(a.resource_key(), b.resource_key());
        assert!(!a.should_add(&b));
        assert!(!a.should_merge(&b));
        assert!(!a.should_replace(&b));
    }

    #[test]
    fn lock_records_merge_mode() {
        let manager = Arc::new(LockManager::new("m", RetryPolicy::immediate(1)));
        let hierarchy = crate::ActionHierarchy::top_level(uid(7));
        let mut read = ParticipantRecord::Lock(LockRecord::new(
            uid(5),
            Arc::clone(&manager),
            uid(20),
            hierarchy.clone(),
            LockMode::Read,
        ));
        let write = ParticipantRecord::Lock(LockRecord::new(
            uid(6),
            manager,
            uid(20),
            hierarchy,
            LockMode::Write,
        ));
        assert!(read.should_merge(&write));
        read.merge(write);
        match read {
            ParticipantRecord::Lock(l) => assert_eq!(l.mode(), LockMode::Write),
            _ => unreachable!(),
        }
    }

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            RecordKind::Persistence,
            RecordKind::Resource,
            RecordKind::Dispose,
            RecordKind::Cadaver,
            RecordKind::Lock,
        ] {
            assert_eq!(RecordKind::from_tag(kind.tag()).unwrap(), kind);
        }
        assert!(RecordKind::from_tag(0).is_err());
    }
}
