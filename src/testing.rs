//! Test harness: scripted resource managers, a faulty store and tracing setup

use crate::record::{XaError, XaResource, XaVote, Xid};
use crate::{
    InMemoryObjectStore, InputObjectState, ObjectStore, OutputObjectState, StoreError,
    StoreState, Uid,
};
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, Once};

/// Install a `fmt` subscriber honouring `RUST_LOG`, once per process
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A call received by a [`ScriptedXaResource`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XaCall {
    /// `prepare`
    Prepare(Xid),
    /// `commit`
    Commit {
        /// Branch
        xid: Xid,
        /// One-phase flag
        one_phase: bool,
    },
    /// `rollback`
    Rollback(Xid),
    /// `forget`
    Forget(Xid),
    /// `recover`
    Recover,
}

#[derive(Default)]
struct Script {
    read_only: bool,
    prepare_error: Option<XaError>,
    commit_error: Option<XaError>,
    rollback_error: Option<XaError>,
    forget_error: Option<XaError>,
    calls: Vec<XaCall>,
    in_doubt: Vec<Xid>,
}

/// Resource manager whose answers are set by the test.
///
/// Failures stay in place until replaced or [`heal`](Self::heal)ed. Branches
/// that voted yes are reported by `recover` until committed or rolled back.
pub struct ScriptedXaResource {
    name: Box<str>,
    script: Mutex<Script>,
}

impl ScriptedXaResource {
    /// Resource answering every call successfully
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(Script::default()),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Vote read-only on prepare
    pub fn vote_read_only(&self) {
        self.script().read_only = true;
    }

    /// Fail every prepare with `error`
    pub fn fail_prepare(&self, error: XaError) {
        self.script().prepare_error = Some(error);
    }

    /// Fail every commit with `error`
    pub fn fail_commit(&self, error: XaError) {
        self.script().commit_error = Some(error);
    }

    /// Fail every rollback with `error`
    pub fn fail_rollback(&self, error: XaError) {
        self.script().rollback_error = Some(error);
    }

    /// Fail every forget with `error`
    pub fn fail_forget(&self, error: XaError) {
        self.script().forget_error = Some(error);
    }

    /// Clear every scripted failure
    pub fn heal(&self) {
        let mut script = self.script();
        script.prepare_error = None;
        script.commit_error = None;
        script.rollback_error = None;
        script.forget_error = None;
    }

    /// Pretend a branch was left prepared by an earlier process
    pub fn add_in_doubt(&self, xid: Xid) {
        self.script().in_doubt.push(xid);
    }

    /// Branches currently prepared
    pub fn in_doubt(&self) -> Vec<Xid> {
        self.script().in_doubt.clone()
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<XaCall> {
        self.script().calls.clone()
    }

    /// Calls received for `xid`
    pub fn calls_for(&self, xid: &Xid) -> Vec<XaCall> {
        self.calls()
            .into_iter()
            .filter(|call| match call {
                XaCall::Prepare(x) | XaCall::Rollback(x) | XaCall::Forget(x) => x == xid,
                XaCall::Commit { xid: x, .. } => x == xid,
                XaCall::Recover => false,
            })
            .collect()
    }
}

/// Does the error end the branch on the manager's side?
fn branch_finished(error: &XaError) -> bool {
    matches!(
        error,
        XaError::RolledBack(_)
            | XaError::HeuristicCommit
            | XaError::HeuristicRollback
            | XaError::HeuristicMixed
            | XaError::HeuristicHazard
            | XaError::UnknownXid
    )
}

impl XaResource for ScriptedXaResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, xid: &Xid) -> Result<XaVote, XaError> {
        let mut script = self.script();
        script.calls.push(XaCall::Prepare(xid.clone()));
        if let Some(error) = script.prepare_error.clone() {
            return Err(error);
        }
        if script.read_only {
            return Ok(XaVote::ReadOnly);
        }
        script.in_doubt.push(xid.clone());
        Ok(XaVote::Ok)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        let mut script = self.script();
        script.calls.push(XaCall::Commit {
            xid: xid.clone(),
            one_phase,
        });
        let result = script.commit_error.clone().map_or(Ok(()), Err);
        if result.as_ref().err().map_or(true, branch_finished) {
            script.in_doubt.retain(|x| x != xid);
        }
        result
    }

    fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        let mut script = self.script();
        script.calls.push(XaCall::Rollback(xid.clone()));
        let result = script.rollback_error.clone().map_or(Ok(()), Err);
        if result.as_ref().err().map_or(true, branch_finished) {
            script.in_doubt.retain(|x| x != xid);
        }
        result
    }

    fn forget(&self, xid: &Xid) -> Result<(), XaError> {
        let mut script = self.script();
        script.calls.push(XaCall::Forget(xid.clone()));
        script.forget_error.clone().map_or(Ok(()), Err)
    }

    fn recover(&self) -> Result<Vec<Xid>, XaError> {
        let mut script = self.script();
        script.calls.push(XaCall::Recover);
        Ok(script.in_doubt.clone())
    }
}

impl std::fmt::Debug for ScriptedXaResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedXaResource")
            .field("name", &self.name)
            .finish()
    }
}

/// In-memory store whose reads fail for chosen type names.
///
/// A failing type is also reported by `all_types`, as a real backend would
/// list a directory it then cannot read.
#[derive(Default)]
pub struct FaultyObjectStore {
    inner: InMemoryObjectStore,
    unreadable: Mutex<BTreeSet<Box<str>>>,
}

impl FaultyObjectStore {
    /// Store with no failures
    pub fn new() -> Self {
        Self::default()
    }

    fn unreadable(&self) -> MutexGuard<'_, BTreeSet<Box<str>>> {
        self.unreadable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail every read of `type_name`
    pub fn fail_reads(&self, type_name: &str) {
        self.unreadable().insert(type_name.into());
    }

    /// Clear every failure
    pub fn heal(&self) {
        self.unreadable().clear();
    }

    fn check(&self, type_name: &str) -> Result<(), StoreError> {
        if self.unreadable().contains(type_name) {
            return Err(StoreError::Storage(
                format!("{type_name} is unreadable").into(),
            ));
        }
        Ok(())
    }
}

impl ObjectStore for FaultyObjectStore {
    fn current_state(&self, uid: Uid, type_name: &str) -> Result<StoreState, StoreError> {
        self.check(type_name)?;
        self.inner.current_state(uid, type_name)
    }

    fn read_committed(
        &self,
        uid: Uid,
        type_name: &str,
    ) -> Result<Option<InputObjectState>, StoreError> {
        self.check(type_name)?;
        self.inner.read_committed(uid, type_name)
    }

    fn read_uncommitted(
        &self,
        uid: Uid,
        type_name: &str,
    ) -> Result<Option<InputObjectState>, StoreError> {
        self.check(type_name)?;
        self.inner.read_uncommitted(uid, type_name)
    }

    fn write_committed(&self, state: &OutputObjectState) -> Result<(), StoreError> {
        self.inner.write_committed(state)
    }

    fn write_uncommitted(&self, state: &OutputObjectState) -> Result<(), StoreError> {
        self.inner.write_uncommitted(state)
    }

    fn commit_state(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        self.inner.commit_state(uid, type_name)
    }

    fn remove_committed(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        self.inner.remove_committed(uid, type_name)
    }

    fn remove_uncommitted(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        self.inner.remove_uncommitted(uid, type_name)
    }

    fn hide_state(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        self.inner.hide_state(uid, type_name)
    }

    fn reveal_state(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        self.inner.reveal_state(uid, type_name)
    }

    fn all_types(&self) -> Result<Vec<Box<str>>, StoreError> {
        let mut types: BTreeSet<Box<str>> = self.inner.all_types()?.into_iter().collect();
        types.extend(self.unreadable().iter().cloned());
        Ok(types.into_iter().collect())
    }

    fn all_obj_uids(&self, type_name: &str) -> Result<Vec<Uid>, StoreError> {
        self.check(type_name)?;
        self.inner.all_obj_uids(type_name)
    }
}
