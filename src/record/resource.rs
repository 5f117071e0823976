//! External two-phase resources (XA style)
//!
//! A [`ResourceRecord`] drives one branch of an external resource manager and
//! classifies the manager's error codes into [`TwoPhaseOutcome`] values. The
//! record persists only a reconnect descriptor: the branch xid and the
//! resource manager's name, looked up again in a [`ResourceDirectory`] when
//! recovery rebuilds the record.

use super::{RecordOps, ResourceKey};
use crate::{InputObjectState, OutputObjectState, StateError, TwoPhaseOutcome, Uid};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Format id stamped on every xid this crate creates
pub const XID_FORMAT_ID: i32 = 0x0002_0005;

/// Global transaction id plus branch qualifier
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Xid {
    /// Format identifier
    pub format_id: i32,
    /// Global transaction (the top-level coordinator)
    pub gtrid: Uid,
    /// Branch qualifier
    pub bqual: Uid,
}

impl Xid {
    /// Xid in this crate's format
    pub fn new(gtrid: Uid, bqual: Uid) -> Self {
        Self {
            format_id: XID_FORMAT_ID,
            gtrid,
            bqual,
        }
    }

    /// Was the xid created by this crate?
    pub fn is_ours(&self) -> bool {
        self.format_id == XID_FORMAT_ID
    }

    fn pack(&self, out: &mut OutputObjectState) {
        out.pack_i32(self.format_id);
        out.pack_uid(self.gtrid);
        out.pack_uid(self.bqual);
    }

    fn unpack(input: &mut InputObjectState) -> Result<Self, StateError> {
        Ok(Self {
            format_id: input.unpack_i32()?,
            gtrid: input.unpack_uid()?,
            bqual: input.unpack_uid()?,
        })
    }
}

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}/{}/{}", self.format_id, self.gtrid, self.bqual)
    }
}

/// Prepare vote of a resource manager
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XaVote {
    /// Ready to commit
    Ok,
    /// Nothing to commit; the branch is already finished
    ReadOnly,
}

/// Error codes a resource manager can report
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XaError {
    /// Branch was rolled back
    #[error("branch rolled back: {0}")]
    RolledBack(Box<str>),
    /// Branch was heuristically committed
    #[error("branch heuristically committed")]
    HeuristicCommit,
    /// Branch was heuristically rolled back
    #[error("branch heuristically rolled back")]
    HeuristicRollback,
    /// Branch was partly committed, partly rolled back
    #[error("branch heuristically mixed")]
    HeuristicMixed,
    /// Branch outcome unknown
    #[error("branch outcome unknown")]
    HeuristicHazard,
    /// Resource manager does not know the xid
    #[error("unknown xid")]
    UnknownXid,
    /// Resource manager unavailable
    #[error("resource manager failure: {0}")]
    ResourceFailure(Box<str>),
    /// Resource manager internal error
    #[error("resource manager error: {0}")]
    ResourceError(Box<str>),
    /// Call made out of sequence
    #[error("protocol error")]
    Protocol,
    /// Bad arguments
    #[error("invalid arguments")]
    InvalidArguments,
    /// Transient condition; try again later
    #[error("retry later")]
    Retry,
}

/// An external resource manager
pub trait XaResource: Send + Sync + 'static {
    /// Stable name used to reconnect after a restart
    fn name(&self) -> &str;
    /// Phase one
    fn prepare(&self, xid: &Xid) -> Result<XaVote, XaError>;
    /// Phase two, or prepare and commit in one when `one_phase` is set
    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError>;
    /// Roll the branch back
    fn rollback(&self, xid: &Xid) -> Result<(), XaError>;
    /// Discard heuristic knowledge of the branch
    fn forget(&self, xid: &Xid) -> Result<(), XaError>;
    /// Branches the manager holds in the prepared state
    fn recover(&self) -> Result<Vec<Xid>, XaError>;
}

/// Name to resource table used to reconnect restored records
#[derive(Default)]
pub struct ResourceDirectory {
    resources: RwLock<HashMap<Box<str>, Arc<dyn XaResource>>>,
}

impl ResourceDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a resource under its name
    pub fn register(&self, resource: Arc<dyn XaResource>) {
        let mut resources = self
            .resources
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        resources.insert(resource.name().into(), resource);
    }

    /// Look a resource up by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn XaResource>> {
        self.resources
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    /// Every registered resource
    pub fn all(&self) -> Vec<Arc<dyn XaResource>> {
        self.resources
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

/// One branch of an external resource enlisted in a transaction
pub struct ResourceRecord {
    uid: Uid,
    xid: Xid,
    name: Box<str>,
    resource: Option<Arc<dyn XaResource>>,
    heuristic: Option<TwoPhaseOutcome>,
    recovered: bool,
}

impl ResourceRecord {
    /// Record for `resource` working under `xid`
    pub fn new(uid: Uid, xid: Xid, resource: Arc<dyn XaResource>) -> Self {
        Self {
            uid,
            xid,
            name: resource.name().into(),
            resource: Some(resource),
            heuristic: None,
            recovered: false,
        }
    }

    /// Record whose resource manager is not (yet) reachable
    pub fn unconnected(uid: Uid, xid: Xid, name: &str) -> Self {
        Self {
            uid,
            xid,
            name: name.into(),
            resource: None,
            heuristic: None,
            recovered: false,
        }
    }

    /// Branch xid
    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    /// Resource manager name
    pub fn resource_name(&self) -> &str {
        &self.name
    }

    /// Heuristic outcome still awaiting `forget`
    pub fn heuristic(&self) -> Option<TwoPhaseOutcome> {
        self.heuristic
    }

    /// Replaying from a log: an unknown xid at commit means the branch
    /// already finished before the crash.
    pub(crate) fn mark_recovered(&mut self) {
        self.recovered = true;
    }

    /// Rebuild from a coordinator log entry, reconnecting through `directory`
    pub fn restore(
        input: &mut InputObjectState,
        directory: &ResourceDirectory,
    ) -> Result<Self, StateError> {
        let uid = input.unpack_uid()?;
        let xid = Xid::unpack(input)?;
        let name = input.unpack_string()?;
        let heuristic = match input.unpack_u8()? {
            u8::MAX => None,
            code => Some(TwoPhaseOutcome::from_code(code).ok_or(StateError::UnknownTag {
                what: "heuristic outcome",
                tag: code as u32,
            })?),
        };
        let resource = directory.get(&name);
        if resource.is_none() {
            tracing::warn!(resource = %name, xid = %xid, "Resource not registered, branch unreachable");
        }
        Ok(Self {
            uid,
            xid,
            name: name.into(),
            resource,
            heuristic,
            recovered: false,
        })
    }

    fn unreachable(&self, operation: &str) {
        tracing::warn!(resource = %self.name, xid = %self.xid, operation, "Resource not connected");
    }
}

impl RecordOps for ResourceRecord {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn resource_key(&self) -> ResourceKey {
        ResourceKey::Xa {
            resource: self.name.clone(),
            branch: self.xid.bqual,
        }
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
        let Some(resource) = &self.resource else {
            self.unreachable("prepare");
            return TwoPhaseOutcome::PrepareNotOk;
        };
        match resource.prepare(&self.xid) {
            Ok(XaVote::Ok) => TwoPhaseOutcome::PrepareOk,
            Ok(XaVote::ReadOnly) => TwoPhaseOutcome::PrepareReadOnly,
            Err(e) => {
                tracing::info!(resource = %self.name, xid = %self.xid, error = %e, "Branch voted no");
                TwoPhaseOutcome::PrepareNotOk
            }
        }
    }

    fn top_level_commit(&mut self) -> TwoPhaseOutcome {
        let Some(resource) = &self.resource else {
            self.unreachable("commit");
            return TwoPhaseOutcome::FinishError;
        };
        match resource.commit(&self.xid, false) {
            Ok(()) => TwoPhaseOutcome::FinishOk,
            Err(XaError::HeuristicCommit) => {
                self.heuristic = Some(TwoPhaseOutcome::HeuristicCommit);
                TwoPhaseOutcome::FinishOk
            }
            Err(XaError::HeuristicRollback) | Err(XaError::RolledBack(_)) => {
                self.heuristic = Some(TwoPhaseOutcome::HeuristicRollback);
                TwoPhaseOutcome::HeuristicRollback
            }
            Err(XaError::HeuristicMixed) => {
                self.heuristic = Some(TwoPhaseOutcome::HeuristicMixed);
                TwoPhaseOutcome::HeuristicMixed
            }
            Err(XaError::HeuristicHazard) => {
                self.heuristic = Some(TwoPhaseOutcome::HeuristicHazard);
                TwoPhaseOutcome::HeuristicHazard
            }
            Err(XaError::UnknownXid) if self.recovered => TwoPhaseOutcome::FinishOk,
            Err(XaError::UnknownXid) => TwoPhaseOutcome::HeuristicHazard,
            Err(e) => {
                tracing::warn!(resource = %self.name, xid = %self.xid, error = %e, "Branch commit failed");
                TwoPhaseOutcome::FinishError
            }
        }
    }

    fn top_level_abort(&mut self) -> TwoPhaseOutcome {
        let Some(resource) = &self.resource else {
            self.unreachable("rollback");
            return TwoPhaseOutcome::FinishError;
        };
        match resource.rollback(&self.xid) {
            Ok(()) | Err(XaError::UnknownXid) | Err(XaError::RolledBack(_)) => {
                TwoPhaseOutcome::FinishOk
            }
            Err(XaError::HeuristicRollback) => {
                self.heuristic = Some(TwoPhaseOutcome::HeuristicRollback);
                TwoPhaseOutcome::FinishOk
            }
            Err(XaError::HeuristicCommit) => {
                self.heuristic = Some(TwoPhaseOutcome::HeuristicCommit);
                TwoPhaseOutcome::HeuristicCommit
            }
            Err(XaError::HeuristicMixed) => {
                self.heuristic = Some(TwoPhaseOutcome::HeuristicMixed);
                TwoPhaseOutcome::HeuristicMixed
            }
            Err(XaError::HeuristicHazard) => {
                self.heuristic = Some(TwoPhaseOutcome::HeuristicHazard);
                TwoPhaseOutcome::HeuristicHazard
            }
            Err(e) => {
                tracing::warn!(resource = %self.name, xid = %self.xid, error = %e, "Branch rollback failed");
                TwoPhaseOutcome::FinishError
            }
        }
    }

    fn one_phase_commit(&mut self) -> TwoPhaseOutcome {
        let Some(resource) = &self.resource else {
            self.unreachable("one-phase commit");
            return TwoPhaseOutcome::OnePhaseError;
        };
        match resource.commit(&self.xid, true) {
            Ok(()) => TwoPhaseOutcome::FinishOk,
            Err(XaError::HeuristicCommit) => {
                self.heuristic = Some(TwoPhaseOutcome::HeuristicCommit);
                TwoPhaseOutcome::FinishOk
            }
            Err(XaError::RolledBack(_))
            | Err(XaError::HeuristicRollback)
            | Err(XaError::UnknownXid) => TwoPhaseOutcome::OnePhaseError,
            Err(e) => {
                tracing::warn!(resource = %self.name, xid = %self.xid, error = %e, "One-phase outcome unknown");
                self.heuristic = Some(TwoPhaseOutcome::HeuristicHazard);
                TwoPhaseOutcome::HeuristicHazard
            }
        }
    }

    fn forget_heuristic(&mut self) -> bool {
        if self.heuristic.is_none() {
            return true;
        }
        let Some(resource) = &self.resource else {
            self.unreachable("forget");
            return false;
        };
        match resource.forget(&self.xid) {
            Ok(()) | Err(XaError::UnknownXid) => {
                self.heuristic = None;
                true
            }
            Err(e) => {
                tracing::warn!(resource = %self.name, xid = %self.xid, error = %e, "Forget failed");
                false
            }
        }
    }

    fn save_state(&self, out: &mut OutputObjectState) {
        out.pack_uid(self.uid);
        self.xid.pack(out);
        out.pack_string(&self.name);
        out.pack_u8(self.heuristic.map(|h| h.code()).unwrap_or(u8::MAX));
    }
}

impl std::fmt::Debug for ResourceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRecord")
            .field("uid", &self.uid)
            .field("xid", &self.xid)
            .field("resource", &self.name)
            .field("connected", &self.resource.is_some())
            .field("heuristic", &self.heuristic)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedXaResource, XaCall};

    fn uid(n: u32) -> Uid {
        Uid::from_parts(8, 8, 8, n)
    }

    fn record(resource: &Arc<ScriptedXaResource>) -> ResourceRecord {
        ResourceRecord::new(
            uid(1),
            Xid::new(uid(10), uid(11)),
            Arc::clone(resource) as Arc<dyn XaResource>,
        )
    }

    #[test]
    fn votes_map_to_prepare_outcomes() {
        let rm = Arc::new(ScriptedXaResource::new("db"));
        assert_eq!(record(&rm).top_level_prepare(), TwoPhaseOutcome::PrepareOk);

        rm.vote_read_only();
        assert_eq!(record(&rm).top_level_prepare(), TwoPhaseOutcome::PrepareReadOnly);

        rm.fail_prepare(XaError::ResourceFailure("down".into()));
        assert_eq!(record(&rm).top_level_prepare(), TwoPhaseOutcome::PrepareNotOk);
    }

    #[test]
    fn commit_errors_are_classified() {
        let cases = [
            (XaError::HeuristicRollback, TwoPhaseOutcome::HeuristicRollback),
            (XaError::HeuristicMixed, TwoPhaseOutcome::HeuristicMixed),
            (XaError::HeuristicHazard, TwoPhaseOutcome::HeuristicHazard),
            (XaError::UnknownXid, TwoPhaseOutcome::HeuristicHazard),
            (XaError::ResourceFailure("gone".into()), TwoPhaseOutcome::FinishError),
            (XaError::Retry, TwoPhaseOutcome::FinishError),
        ];
        for (error, expected) in cases {
            let rm = Arc::new(ScriptedXaResource::new("db"));
            rm.fail_commit(error.clone());
            assert_eq!(record(&rm).top_level_commit(), expected, "{error:?}");
        }
    }

    #[test]
    fn unknown_xid_after_recovery_means_done() {
        let rm = Arc::new(ScriptedXaResource::new("db"));
        rm.fail_commit(XaError::UnknownXid);
        let mut rec = record(&rm);
        rec.mark_recovered();
        assert_eq!(rec.top_level_commit(), TwoPhaseOutcome::FinishOk);
    }

    #[test]
    fn rollback_tolerates_finished_branches() {
        let rm = Arc::new(ScriptedXaResource::new("db"));
        rm.fail_rollback(XaError::UnknownXid);
        assert_eq!(record(&rm).top_level_abort(), TwoPhaseOutcome::FinishOk);

        rm.fail_rollback(XaError::HeuristicCommit);
        assert_eq!(record(&rm).top_level_abort(), TwoPhaseOutcome::HeuristicCommit);
    }

    #[test]
    fn one_phase_heuristic_commit_is_ok_until_forgotten() {
        let rm = Arc::new(ScriptedXaResource::new("db"));
        rm.fail_commit(XaError::HeuristicCommit);
        let mut rec = record(&rm);
        assert_eq!(rec.one_phase_commit(), TwoPhaseOutcome::FinishOk);
        assert_eq!(rec.heuristic(), Some(TwoPhaseOutcome::HeuristicCommit));

        assert!(rec.forget_heuristic());
        assert_eq!(rec.heuristic(), None);
        assert!(rm.calls().contains(&XaCall::Forget(rec.xid().clone())));
    }

    #[test]
    fn one_phase_rollback_is_reported() {
        let rm = Arc::new(ScriptedXaResource::new("db"));
        rm.fail_commit(XaError::RolledBack("deadlock".into()));
        assert_eq!(record(&rm).one_phase_commit(), TwoPhaseOutcome::OnePhaseError);
    }

    #[test]
    fn restore_reconnects_by_name() {
        let rm = Arc::new(ScriptedXaResource::new("ledger"));
        let directory = ResourceDirectory::new();
        directory.register(Arc::clone(&rm) as Arc<dyn XaResource>);

        let mut rec = record(&rm);
        rm.fail_commit(XaError::HeuristicMixed);
        rec.top_level_commit();

        let mut out = OutputObjectState::new(uid(99), "/Transaction/Coordinator");
        rec.save_state(&mut out);
        let mut input = InputObjectState::from(out);
        let restored = ResourceRecord::restore(&mut input, &directory).unwrap();
        assert_eq!(restored.xid(), rec.xid());
        assert_eq!(restored.resource_name(), "ledger");
        assert_eq!(restored.heuristic(), Some(TwoPhaseOutcome::HeuristicMixed));
        assert!(restored.resource.is_some());

        let mut input = InputObjectState::from({
            let mut out = OutputObjectState::new(uid(99), "/Transaction/Coordinator");
            rec.save_state(&mut out);
            out
        });
        let orphan = ResourceRecord::restore(&mut input, &ResourceDirectory::new()).unwrap();
        assert!(orphan.resource.is_none());
    }
}
