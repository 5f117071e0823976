//! Transaction coordinator
//!
//! A [`Coordinator`] owns the status state machine of one transaction and
//! drives its enlisted [`ParticipantRecord`]s through prepare and phase two.
//!
//! Two locks guard a coordinator. `records` is held for the whole of a
//! protocol step (enlist, prepare, phase two, forget) and serializes them.
//! `control` holds the status and the rollback-only flag and is only ever
//! held briefly, so the reaper and status queries never wait on a running
//! phase two. Lock order is always `records` then `control`.

use crate::config::SUBORDINATE_TYPE;
use crate::record::{
    DisposeRecord, InsertOutcome, ParticipantRecord, PersistenceRecord, RecordKind, RecordList,
    ResourceRecord, RestoreContext, XaResource, Xid,
};
use crate::registry::TransactionRegistry;
use crate::{
    ActionHierarchy, ActionKind, ActionStatus, CoordinatorError, InputObjectState, ObjectStore,
    OutputObjectState, RecoveryError, ReplayDirection, Result, StateError, StoreError,
    TransactionObserver, TransactionStats, TwoPhaseOutcome, Uid, UidGenerator,
};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

/// Marker for "no heuristic decision" in the log
const NO_DECISION: u8 = u8::MAX;

/// Process services a coordinator works with
#[derive(Clone)]
pub(crate) struct CoordinatorEnv {
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) uids: Arc<UidGenerator>,
    pub(crate) observer: Arc<dyn TransactionObserver>,
    pub(crate) stats: Arc<TransactionStats>,
    pub(crate) registry: Weak<TransactionRegistry>,
    pub(crate) process_uid: Uid,
    pub(crate) one_phase: bool,
}

struct Control {
    status: ActionStatus,
    rollback_only: bool,
    timed_out: bool,
}

#[derive(Default)]
struct Records {
    pending: RecordList,
    prepared: RecordList,
    failed: RecordList,
    heuristic: RecordList,
    decision: Option<ReplayDirection>,
    heuristic_decision: Option<TwoPhaseOutcome>,
    reason: &'static str,
    logged: bool,
    children: Vec<Weak<Coordinator>>,
}

/// Sizes of a coordinator's record lists
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordCounts {
    /// Enlisted, not yet prepared
    pub pending: usize,
    /// Prepared, awaiting phase two
    pub prepared: usize,
    /// Phase two failed; retried by recovery
    pub failed: usize,
    /// Finished heuristically; awaiting forget
    pub heuristic: usize,
}

/// Decoded intentions log
struct LogImage {
    transaction: Uid,
    status: ActionStatus,
    heuristic_decision: Option<TwoPhaseOutcome>,
    hierarchy: ActionHierarchy,
    prepared: RecordList,
    failed: RecordList,
    heuristic: RecordList,
}

/// Coordinator of one (top-level or nested) transaction
pub struct Coordinator {
    uid: Uid,
    type_name: Box<str>,
    hierarchy: ActionHierarchy,
    parent: Option<Arc<Coordinator>>,
    deadline: Option<Instant>,
    env: CoordinatorEnv,
    control: Mutex<Control>,
    records: Mutex<Records>,
}

impl Coordinator {
    pub(crate) fn new_top_level(
        uid: Uid,
        type_name: &str,
        deadline: Option<Instant>,
        env: CoordinatorEnv,
    ) -> Arc<Self> {
        Arc::new(Self {
            uid,
            type_name: type_name.into(),
            hierarchy: ActionHierarchy::top_level(uid),
            parent: None,
            deadline,
            env,
            control: Mutex::new(Control {
                status: ActionStatus::Active,
                rollback_only: false,
                timed_out: false,
            }),
            records: Mutex::new(Records::default()),
        })
    }

    pub(crate) fn new_nested(
        uid: Uid,
        parent: &Arc<Coordinator>,
        deadline: Option<Instant>,
    ) -> Result<Arc<Self>> {
        let mut parent_records = parent.records();
        parent.ensure_active()?;
        let deadline = match (parent.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let child = Arc::new(Self {
            uid,
            type_name: parent.type_name.clone(),
            hierarchy: parent.hierarchy.nested(uid),
            parent: Some(Arc::clone(parent)),
            deadline,
            env: parent.env.clone(),
            control: Mutex::new(Control {
                status: ActionStatus::Active,
                rollback_only: false,
                timed_out: false,
            }),
            records: Mutex::new(Records::default()),
        });
        parent_records.children.push(Arc::downgrade(&child));
        Ok(child)
    }

    /// Rebuild a coordinator from its intentions log
    pub(crate) fn restore(
        mut input: InputObjectState,
        env: CoordinatorEnv,
        ctx: &RestoreContext,
    ) -> std::result::Result<Arc<Self>, RecoveryError> {
        let uid = input.uid();
        let image = read_log(&mut input, ctx)
            .map_err(|source| RecoveryError::Unreadable { uid, source })?;
        if image.transaction != uid {
            return Err(RecoveryError::Corrupt {
                uid,
                reason: format!("log header names transaction {}", image.transaction).into(),
            });
        }
        let hierarchy = if image.hierarchy.is_empty() {
            ActionHierarchy::top_level(uid)
        } else {
            image.hierarchy
        };
        Ok(Arc::new(Self {
            uid,
            type_name: input.type_name().into(),
            hierarchy,
            parent: None,
            deadline: None,
            env,
            control: Mutex::new(Control {
                status: image.status,
                rollback_only: false,
                timed_out: false,
            }),
            records: Mutex::new(Records {
                prepared: image.prepared,
                failed: image.failed,
                heuristic: image.heuristic,
                decision: image.status.replay_direction(),
                heuristic_decision: image.heuristic_decision,
                logged: true,
                ..Records::default()
            }),
        }))
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: ActionStatus) {
        self.control().status = status;
    }

    /// Transaction id
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Store type the intentions log is written under
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Ancestry from the top-level transaction down to this one
    pub fn hierarchy(&self) -> &ActionHierarchy {
        &self.hierarchy
    }

    /// Enclosing transaction, for nested coordinators
    pub fn parent(&self) -> Option<&Arc<Coordinator>> {
        self.parent.as_ref()
    }

    /// Current status
    pub fn status(&self) -> ActionStatus {
        self.control().status
    }

    /// Is this an outermost transaction?
    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }

    /// Interposed coordinator driven by a superior
    pub fn is_subordinate(&self) -> bool {
        &*self.type_name == SUBORDINATE_TYPE
    }

    /// Timeout deadline
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Heuristic outcome recorded by the last phase two, if any
    pub fn heuristic_decision(&self) -> Option<TwoPhaseOutcome> {
        self.records().heuristic_decision
    }

    /// Sizes of the record lists
    pub fn counts(&self) -> RecordCounts {
        let records = self.records();
        RecordCounts {
            pending: records.pending.len(),
            prepared: records.prepared.len(),
            failed: records.failed.len(),
            heuristic: records.heuristic.len(),
        }
    }

    /// Nothing left to drive through phase two
    pub fn is_resolved(&self) -> bool {
        let records = self.records();
        records.pending.is_empty() && records.prepared.is_empty() && records.failed.is_empty()
    }

    /// Fresh uid for a record enlisted in this transaction
    pub fn new_record_uid(&self) -> Uid {
        self.env.uids.next_uid()
    }

    /// Fail unless the transaction can still take new work
    pub fn ensure_active(&self) -> Result<()> {
        let control = self.control();
        match control.status {
            ActionStatus::Active if !control.rollback_only => Ok(()),
            ActionStatus::Active | ActionStatus::MarkedRollback => {
                Err(CoordinatorError::RollbackOnly(self.uid))
            }
            status => Err(CoordinatorError::NotActive {
                uid: self.uid,
                status,
            }),
        }
    }

    /// Doom the transaction: it can only roll back from now on
    pub fn set_rollback_only(&self) -> Result<()> {
        let mut control = self.control();
        match control.status {
            ActionStatus::Active | ActionStatus::MarkedRollback => {
                control.rollback_only = true;
                control.status = ActionStatus::MarkedRollback;
                Ok(())
            }
            ActionStatus::Preparing => {
                control.rollback_only = true;
                Ok(())
            }
            status => Err(CoordinatorError::InvalidState {
                uid: self.uid,
                status,
                operation: "mark rollback-only",
            }),
        }
    }

    /// Enlist a participant record
    pub fn enlist(&self, record: ParticipantRecord) -> Result<()> {
        let mut records = self.records();
        self.ensure_active()?;
        match records.pending.insert(record) {
            InsertOutcome::Rejected(rejected) => Err(CoordinatorError::DuplicateResource {
                uid: self.uid,
                resource: rejected.resource_key().to_string().into(),
            }),
            outcome => {
                tracing::trace!(uid = %self.uid, outcome = ?outcome, "Record enlisted");
                Ok(())
            }
        }
    }

    /// Enlist a new version of a stored object
    pub fn write_object(
        &self,
        object: Uid,
        type_name: &str,
        before: Vec<u8>,
        after: Vec<u8>,
    ) -> Result<()> {
        crate::store::validate_type_name(type_name)?;
        let record = PersistenceRecord::new(
            self.new_record_uid(),
            object,
            type_name,
            before,
            after,
            Arc::clone(&self.env.store),
        )
        .with_origin(
            self.env.process_uid,
            self.hierarchy.root().unwrap_or(self.uid),
        );
        self.enlist(ParticipantRecord::Persistence(record))
    }

    /// Remove a stored object if the transaction commits
    pub fn dispose_object(&self, object: Uid, type_name: &str) -> Result<()> {
        crate::store::validate_type_name(type_name)?;
        let record = DisposeRecord::new(
            self.new_record_uid(),
            object,
            type_name,
            Arc::clone(&self.env.store),
        );
        self.enlist(ParticipantRecord::Dispose(record))
    }

    /// Enlist a new branch of an external resource. The branch's global id
    /// is the top-level transaction.
    pub fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<Xid> {
        let root = self.hierarchy.root().unwrap_or(self.uid);
        let xid = Xid::new(root, self.new_record_uid());
        let record = ResourceRecord::new(self.new_record_uid(), xid.clone(), resource);
        self.enlist(ParticipantRecord::Resource(record))?;
        Ok(xid)
    }

    fn require_top_level(&self, operation: &'static str) -> Result<()> {
        if self.parent.is_some() {
            return Err(CoordinatorError::WrongKind {
                uid: self.uid,
                kind: "nested",
                operation,
            });
        }
        Ok(())
    }

    /// Run phase one only. Used by a superior driving an interposed
    /// coordinator; `commit` or `abort` must follow.
    pub fn prepare(&self) -> Result<TwoPhaseOutcome> {
        self.require_top_level("prepare")?;
        self.abort_children();
        let mut records = self.records();
        {
            let mut control = self.control();
            match control.status {
                ActionStatus::Active if !control.rollback_only => {
                    control.status = ActionStatus::Preparing;
                }
                ActionStatus::Active | ActionStatus::MarkedRollback => {
                    drop(control);
                    let outcome = self.abort_locked(&mut records, "marked rollback-only");
                    self.conclude(&records, outcome, false);
                    return Ok(TwoPhaseOutcome::PrepareNotOk);
                }
                status => {
                    return Err(CoordinatorError::InvalidState {
                        uid: self.uid,
                        status,
                        operation: "prepare",
                    })
                }
            }
        }
        if records.pending.is_empty() {
            self.set_status(ActionStatus::Prepared);
            return Ok(TwoPhaseOutcome::PrepareReadOnly);
        }
        let vote = self.prepare_phase(&mut records);
        if vote == TwoPhaseOutcome::PrepareNotOk {
            self.conclude(&records, vote, false);
        }
        Ok(vote)
    }

    /// Commit the transaction.
    ///
    /// A top-level commit runs one-phase commit when exactly one durable
    /// record is enlisted, otherwise prepare and phase two. A nested commit
    /// folds the records into the parent. With `report_heuristics` unset a
    /// heuristic aggregate is reduced to the plain decision.
    pub fn commit(&self, report_heuristics: bool) -> Result<TwoPhaseOutcome> {
        if let Some(parent) = &self.parent {
            return self.commit_nested(parent);
        }
        self.abort_children();
        let mut records = self.records();
        let prepared = {
            let mut control = self.control();
            match control.status {
                ActionStatus::Active if !control.rollback_only => {
                    control.status = ActionStatus::Preparing;
                    false
                }
                ActionStatus::Active | ActionStatus::MarkedRollback => {
                    drop(control);
                    let outcome = self.abort_locked(&mut records, "marked rollback-only");
                    self.conclude(&records, outcome, false);
                    return Ok(TwoPhaseOutcome::PrepareNotOk);
                }
                ActionStatus::Prepared => true,
                status => {
                    return Err(CoordinatorError::InvalidState {
                        uid: self.uid,
                        status,
                        operation: "commit",
                    })
                }
            }
        };

        let mut one_phase = false;
        let outcome = if prepared {
            self.phase_two(&mut records, ReplayDirection::Commit)
        } else if records.pending.is_empty() {
            records.decision = Some(ReplayDirection::Commit);
            self.set_status(ActionStatus::Committed);
            TwoPhaseOutcome::FinishOk
        } else if let Some(index) = self.one_phase_candidate(&records.pending) {
            one_phase = true;
            self.commit_one_phase(&mut records, index)
        } else {
            match self.prepare_phase(&mut records) {
                TwoPhaseOutcome::PrepareOk => self.phase_two(&mut records, ReplayDirection::Commit),
                TwoPhaseOutcome::PrepareReadOnly => {
                    TransactionStats::incr(&self.env.stats.read_only_commits);
                    self.phase_two(&mut records, ReplayDirection::Commit)
                }
                vote => {
                    self.conclude(&records, vote, false);
                    return Ok(vote);
                }
            }
        };
        self.conclude(&records, outcome, one_phase);
        Ok(reported(outcome, ReplayDirection::Commit, report_heuristics))
    }

    /// Roll the transaction back
    pub fn abort(&self) -> Result<TwoPhaseOutcome> {
        if self.parent.is_some() {
            return self.abort_nested();
        }
        self.abort_children();
        let mut records = self.records();
        match self.status() {
            ActionStatus::Active | ActionStatus::MarkedRollback | ActionStatus::Prepared => {}
            status => {
                return Err(CoordinatorError::InvalidState {
                    uid: self.uid,
                    status,
                    operation: "abort",
                })
            }
        }
        let outcome = self.abort_locked(&mut records, "rollback requested");
        self.conclude(&records, outcome, false);
        Ok(outcome)
    }

    /// Ask every record on the heuristic list to forget its outcome.
    ///
    /// Returns true once the list is empty; the coordinator then leaves the
    /// registry and its log is removed if nothing else is pending.
    pub fn forget_heuristics(&self) -> Result<bool> {
        let mut records = self.records();
        let status = self.status();
        if matches!(
            status,
            ActionStatus::Active | ActionStatus::MarkedRollback | ActionStatus::Preparing
        ) {
            return Err(CoordinatorError::InvalidState {
                uid: self.uid,
                status,
                operation: "forget heuristics",
            });
        }
        if records.heuristic.is_empty() {
            return Ok(true);
        }
        let mut unforgotten = RecordList::new();
        for mut record in records.heuristic.take_all() {
            if !record.forget_heuristic() {
                unforgotten.push(record);
            }
        }
        records.heuristic = unforgotten;
        let forgotten = records.heuristic.is_empty();
        if forgotten {
            records.heuristic_decision = None;
            if records.failed.is_empty() {
                self.set_status(match records.decision {
                    Some(ReplayDirection::Abort) => ActionStatus::Aborted,
                    _ => ActionStatus::Committed,
                });
            }
            tracing::info!(uid = %self.uid, "Heuristic outcomes forgotten");
        } else {
            tracing::warn!(
                uid = %self.uid,
                remaining = records.heuristic.len(),
                "Some heuristic outcomes could not be forgotten"
            );
        }
        self.persist_unresolved(&mut records);
        if forgotten {
            self.deregister();
        }
        Ok(forgotten)
    }

    /// Drive phase two again on a coordinator rebuilt from its log.
    /// Persistence records whose shadow state has vanished become cadavers.
    pub(crate) fn replay(&self, direction: ReplayDirection) -> TwoPhaseOutcome {
        let mut guard = self.records();
        let records = &mut *guard;
        if records.prepared.is_empty() && records.failed.is_empty() {
            return TwoPhaseOutcome::FinishOk;
        }
        for list in [&mut records.prepared, &mut records.failed] {
            let revived: Vec<ParticipantRecord> = list
                .take_all()
                .into_iter()
                .map(ParticipantRecord::into_cadaver_if_unreachable)
                .collect();
            *list = RecordList::from(revived);
        }
        self.phase_two(records, direction)
    }

    /// Mark an expired transaction rollback-only. Returns the status it had
    /// when it expired, or `None` if it is past the point where a timeout
    /// may interfere or was already expired.
    pub(crate) fn expire(&self) -> Option<ActionStatus> {
        let mut control = self.control();
        if control.timed_out {
            return None;
        }
        let status = control.status;
        match status {
            ActionStatus::Active | ActionStatus::MarkedRollback => {
                control.status = ActionStatus::MarkedRollback;
            }
            ActionStatus::Preparing => {}
            _ => return None,
        }
        control.rollback_only = true;
        control.timed_out = true;
        Some(status)
    }

    /// Has the deadline passed?
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    fn one_phase_candidate(&self, pending: &RecordList) -> Option<usize> {
        if !self.env.one_phase || self.is_subordinate() {
            return None;
        }
        let mut durable = pending.iter().enumerate().filter(|(_, r)| r.do_save());
        match (durable.next(), durable.next()) {
            (Some((index, record)), None) if record.supports_one_phase() => Some(index),
            _ => None,
        }
    }

    fn commit_one_phase(&self, records: &mut Records, index: usize) -> TwoPhaseOutcome {
        let mut volatile = records.pending.take_all();
        let mut durable = volatile.remove(index);
        let mut prepared = Vec::with_capacity(volatile.len());
        let mut remaining = volatile.into_iter();
        while let Some(mut record) = remaining.next() {
            match record.top_level_prepare() {
                TwoPhaseOutcome::PrepareOk => prepared.push(record),
                TwoPhaseOutcome::PrepareReadOnly => {}
                vote => {
                    tracing::info!(uid = %self.uid, record = %record.uid(), vote = %vote, "Participant refused to prepare");
                    record.top_level_abort();
                    for mut rest in remaining.by_ref() {
                        rest.top_level_abort();
                    }
                    prepared.push(durable);
                    records.prepared = RecordList::from(prepared);
                    records.reason = "participant refused to prepare";
                    self.phase_two(records, ReplayDirection::Abort);
                    return TwoPhaseOutcome::PrepareNotOk;
                }
            }
        }

        self.set_status(ActionStatus::Committing);
        let outcome = durable.one_phase_commit();
        let direction = if outcome == TwoPhaseOutcome::OnePhaseError {
            records.reason = "one-phase commit rolled back";
            ReplayDirection::Abort
        } else {
            ReplayDirection::Commit
        };
        records.decision = Some(direction);

        let mut aggregate = TwoPhaseOutcome::FinishOk;
        for mut record in prepared {
            let result = if outcome == TwoPhaseOutcome::FinishOk {
                record.top_level_commit()
            } else {
                record.top_level_abort()
            };
            aggregate = self.settle(records, record, result, aggregate);
        }
        aggregate = self.settle(records, durable, outcome, aggregate);
        records.heuristic_decision = aggregate.is_heuristic().then_some(aggregate);
        self.persist_unresolved(records);
        self.set_status(final_status(direction, aggregate));

        if outcome == TwoPhaseOutcome::OnePhaseError && !aggregate.is_heuristic() {
            TwoPhaseOutcome::OnePhaseError
        } else {
            aggregate
        }
    }

    /// Top-level prepare of every pending record. Status is PREPARING on
    /// entry. A refusal rolls everything back.
    fn prepare_phase(&self, records: &mut Records) -> TwoPhaseOutcome {
        let mut remaining = records.pending.take_all().into_iter();
        while let Some(mut record) = remaining.next() {
            match record.top_level_prepare() {
                TwoPhaseOutcome::PrepareOk => records.prepared.push(record),
                TwoPhaseOutcome::PrepareReadOnly => {}
                vote => {
                    tracing::info!(uid = %self.uid, record = %record.uid(), vote = %vote, "Participant refused to prepare");
                    record.top_level_abort();
                    for mut rest in remaining.by_ref() {
                        rest.top_level_abort();
                    }
                    records.reason = "participant refused to prepare";
                    self.phase_two(records, ReplayDirection::Abort);
                    return TwoPhaseOutcome::PrepareNotOk;
                }
            }
        }

        if self.control().rollback_only {
            records.reason = "marked rollback-only during prepare";
            self.phase_two(records, ReplayDirection::Abort);
            return TwoPhaseOutcome::PrepareNotOk;
        }
        if records.prepared.is_empty() {
            self.set_status(ActionStatus::Prepared);
            return TwoPhaseOutcome::PrepareReadOnly;
        }
        if records.prepared.any_durable() {
            if let Err(e) = self.write_log(records, ActionStatus::Prepared) {
                tracing::error!(uid = %self.uid, error = %e, "Cannot write intentions log");
                records.reason = "intentions log write failed";
                self.phase_two(records, ReplayDirection::Abort);
                return TwoPhaseOutcome::PrepareNotOk;
            }
        }
        self.set_status(ActionStatus::Prepared);
        self.env
            .observer
            .on_prepared(self.uid, records.prepared.len());
        TwoPhaseOutcome::PrepareOk
    }

    /// Abort every pending and prepared record
    fn abort_locked(&self, records: &mut Records, reason: &'static str) -> TwoPhaseOutcome {
        for record in records.pending.take_all() {
            records.prepared.push(record);
        }
        records.reason = reason;
        self.phase_two(records, ReplayDirection::Abort)
    }

    /// Drive commit or abort over the prepared and failed lists in
    /// enlistment order, aggregating worst-outcome-wins.
    fn phase_two(&self, records: &mut Records, direction: ReplayDirection) -> TwoPhaseOutcome {
        self.set_status(match direction {
            ReplayDirection::Commit => ActionStatus::Committing,
            ReplayDirection::Abort => ActionStatus::Aborting,
        });
        records.decision = Some(direction);
        let mut todo = records.prepared.take_all();
        todo.extend(records.failed.take_all());

        let mut aggregate = TwoPhaseOutcome::FinishOk;
        for mut record in todo {
            let outcome = match direction {
                ReplayDirection::Commit => record.top_level_commit(),
                ReplayDirection::Abort => record.top_level_abort(),
            };
            aggregate = self.settle(records, record, outcome, aggregate);
        }
        records.heuristic_decision = aggregate.is_heuristic().then_some(aggregate);
        self.persist_unresolved(records);
        self.set_status(final_status(direction, aggregate));
        aggregate
    }

    /// File a record according to its phase-two outcome
    fn settle(
        &self,
        records: &mut Records,
        record: ParticipantRecord,
        outcome: TwoPhaseOutcome,
        aggregate: TwoPhaseOutcome,
    ) -> TwoPhaseOutcome {
        if outcome.is_heuristic() {
            tracing::warn!(uid = %self.uid, record = %record.uid(), outcome = %outcome, "Participant finished heuristically");
            TransactionStats::incr(&self.env.stats.heuristic_outcomes);
            self.env.observer.on_heuristic(self.uid, outcome);
            records.heuristic.push(record);
            aggregate.aggregate(outcome)
        } else if outcome == TwoPhaseOutcome::FinishError {
            tracing::warn!(uid = %self.uid, record = %record.uid(), "Participant failed in phase two");
            records.failed.push(record);
            aggregate.aggregate(TwoPhaseOutcome::HeuristicHazard)
        } else {
            if record.awaiting_forget() {
                records.heuristic.push(record);
            }
            aggregate
        }
    }

    /// Rewrite the log while records remain unresolved, remove it otherwise
    fn persist_unresolved(&self, records: &mut Records) {
        if !records.failed.is_empty() || !records.heuristic.is_empty() {
            let status = match records.decision {
                Some(ReplayDirection::Commit) => ActionStatus::Committing,
                Some(ReplayDirection::Abort) => ActionStatus::Aborting,
                None => self.status(),
            };
            if let Err(e) = self.write_log(records, status) {
                tracing::error!(uid = %self.uid, error = %e, "Cannot record unresolved participants");
            }
        } else if records.logged {
            match self.env.store.remove_committed(self.uid, &self.type_name) {
                Ok(_) => records.logged = false,
                Err(e) => {
                    tracing::error!(uid = %self.uid, error = %e, "Cannot remove intentions log")
                }
            }
        }
    }

    fn write_log(
        &self,
        records: &mut Records,
        status: ActionStatus,
    ) -> std::result::Result<(), StoreError> {
        let mut out = OutputObjectState::new(self.uid, &self.type_name);
        out.pack_header(self.env.process_uid, self.uid);
        out.pack_i32(status.code());
        out.pack_u8(
            records
                .heuristic_decision
                .map(|outcome| outcome.code())
                .unwrap_or(NO_DECISION),
        );
        out.pack_u32(self.hierarchy.depth() as u32);
        for (uid, kind) in self.hierarchy.iter() {
            out.pack_uid(uid);
            out.pack_bool(kind == ActionKind::Nested);
        }
        for list in [&records.prepared, &records.failed, &records.heuristic] {
            pack_list(&mut out, list);
        }
        self.env.store.write_committed(&out)?;
        records.logged = true;
        tracing::debug!(uid = %self.uid, status = %status, "Intentions log written");
        Ok(())
    }

    /// Notify, count and leave the registry after a live commit or abort
    fn conclude(&self, records: &Records, outcome: TwoPhaseOutcome, one_phase: bool) {
        let stats = &self.env.stats;
        match records.decision {
            Some(ReplayDirection::Commit) => {
                TransactionStats::incr(&stats.committed);
                if one_phase {
                    TransactionStats::incr(&stats.one_phase_commits);
                }
                self.env.observer.on_committed(self.uid, one_phase);
            }
            _ => {
                TransactionStats::incr(&stats.aborted);
                self.env.observer.on_aborted(self.uid, records.reason);
            }
        }
        tracing::debug!(uid = %self.uid, outcome = %outcome, "Transaction finished");
        if records.heuristic.is_empty() {
            self.deregister();
        }
    }

    fn deregister(&self) {
        if let Some(registry) = self.env.registry.upgrade() {
            registry.remove(self.uid);
        }
    }

    fn commit_nested(&self, parent: &Arc<Coordinator>) -> Result<TwoPhaseOutcome> {
        self.abort_children();
        let mut records = self.records();
        {
            let mut control = self.control();
            match control.status {
                ActionStatus::Active if !control.rollback_only => {
                    control.status = ActionStatus::Preparing;
                }
                ActionStatus::Active | ActionStatus::MarkedRollback => {
                    drop(control);
                    self.abort_nested_locked(&mut records, "marked rollback-only");
                    return Ok(TwoPhaseOutcome::PrepareNotOk);
                }
                status => {
                    return Err(CoordinatorError::InvalidState {
                        uid: self.uid,
                        status,
                        operation: "commit",
                    })
                }
            }
        }

        let mut kept = Vec::new();
        let mut remaining = records.pending.take_all().into_iter();
        while let Some(mut record) = remaining.next() {
            match record.nested_prepare() {
                TwoPhaseOutcome::PrepareOk => kept.push(record),
                TwoPhaseOutcome::PrepareReadOnly => {}
                vote => {
                    tracing::info!(uid = %self.uid, record = %record.uid(), vote = %vote, "Participant refused nested prepare");
                    record.nested_abort();
                    for mut rest in remaining.by_ref().chain(kept) {
                        rest.nested_abort();
                    }
                    self.abort_nested_locked(&mut records, "participant refused nested prepare");
                    return Ok(TwoPhaseOutcome::PrepareNotOk);
                }
            }
        }
        for record in kept.iter_mut() {
            let outcome = record.nested_commit();
            if outcome != TwoPhaseOutcome::FinishOk {
                tracing::warn!(uid = %self.uid, record = %record.uid(), outcome = %outcome, "Unexpected nested commit outcome");
            }
        }
        records.decision = Some(ReplayDirection::Commit);
        drop(records);

        if let Err(orphans) = parent.absorb(self.uid, kept) {
            tracing::warn!(uid = %self.uid, parent = %parent.uid, "Parent finished first, rolling back nested work");
            for mut record in orphans {
                record.top_level_abort();
            }
            self.set_status(ActionStatus::Aborted);
            TransactionStats::incr(&self.env.stats.aborted);
            self.env.observer.on_aborted(self.uid, "parent no longer active");
            self.deregister();
            return Ok(TwoPhaseOutcome::PrepareNotOk);
        }
        self.set_status(ActionStatus::Committed);
        self.env.observer.on_committed(self.uid, false);
        self.deregister();
        Ok(TwoPhaseOutcome::FinishOk)
    }

    fn abort_nested(&self) -> Result<TwoPhaseOutcome> {
        self.abort_children();
        let mut records = self.records();
        match self.status() {
            ActionStatus::Active | ActionStatus::MarkedRollback => {}
            status => {
                return Err(CoordinatorError::InvalidState {
                    uid: self.uid,
                    status,
                    operation: "abort",
                })
            }
        }
        self.abort_nested_locked(&mut records, "rollback requested");
        Ok(TwoPhaseOutcome::FinishOk)
    }

    fn abort_nested_locked(&self, records: &mut Records, reason: &'static str) {
        for mut record in records.pending.take_all() {
            record.nested_abort();
        }
        records.decision = Some(ReplayDirection::Abort);
        self.set_status(ActionStatus::Aborted);
        if let Some(parent) = &self.parent {
            parent.forget_child(self.uid);
        }
        TransactionStats::incr(&self.env.stats.aborted);
        self.env.observer.on_aborted(self.uid, reason);
        self.deregister();
    }

    /// Take in the records of a committed child. Hands them back if this
    /// transaction can no longer accept work.
    fn absorb(
        &self,
        child: Uid,
        incoming: Vec<ParticipantRecord>,
    ) -> std::result::Result<(), Vec<ParticipantRecord>> {
        let mut records = self.records();
        if !matches!(
            self.status(),
            ActionStatus::Active | ActionStatus::MarkedRollback
        ) {
            return Err(incoming);
        }
        records
            .children
            .retain(|c| c.upgrade().is_some_and(|c| c.uid != child));
        for record in incoming {
            if let InsertOutcome::Rejected(dropped) = records.pending.insert(record) {
                tracing::debug!(uid = %self.uid, record = %dropped.uid(), "Dropping duplicate record from nested commit");
            }
        }
        Ok(())
    }

    fn forget_child(&self, child: Uid) {
        self.records()
            .children
            .retain(|c| c.upgrade().is_some_and(|c| c.uid != child));
    }

    /// Roll back nested transactions left running when this one finishes
    fn abort_children(&self) {
        let children: Vec<Arc<Coordinator>> = self
            .records()
            .children
            .drain(..)
            .filter_map(|child| child.upgrade())
            .collect();
        for child in children {
            if matches!(
                child.status(),
                ActionStatus::Active | ActionStatus::MarkedRollback
            ) {
                tracing::warn!(uid = %self.uid, child = %child.uid, "Rolling back unfinished nested transaction");
                if let Err(e) = child.abort() {
                    tracing::debug!(child = %child.uid, error = %e, "Nested rollback skipped");
                }
            }
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("uid", &self.uid)
            .field("type_name", &self.type_name)
            .field("depth", &self.hierarchy.depth())
            .field("status", &self.status())
            .finish()
    }
}

fn final_status(direction: ReplayDirection, aggregate: TwoPhaseOutcome) -> ActionStatus {
    let plain = match direction {
        ReplayDirection::Commit => ActionStatus::Committed,
        ReplayDirection::Abort => ActionStatus::Aborted,
    };
    ActionStatus::from_heuristic(aggregate).unwrap_or(plain)
}

/// Reduce a heuristic aggregate to the plain decision unless asked to report it
fn reported(outcome: TwoPhaseOutcome, direction: ReplayDirection, report: bool) -> TwoPhaseOutcome {
    if report || !outcome.is_heuristic() {
        return outcome;
    }
    match (direction, outcome) {
        (ReplayDirection::Commit, TwoPhaseOutcome::HeuristicCommit)
        | (ReplayDirection::Abort, TwoPhaseOutcome::HeuristicRollback) => TwoPhaseOutcome::FinishOk,
        _ => TwoPhaseOutcome::FinishError,
    }
}

fn pack_list(out: &mut OutputObjectState, list: &RecordList) {
    let saved: Vec<&ParticipantRecord> = list.iter().filter(|r| r.persistable()).collect();
    out.pack_u32(saved.len() as u32);
    for record in saved {
        let mut state = OutputObjectState::new(record.uid(), out.type_name());
        record.save_state(&mut state);
        out.pack_u8(record.kind().tag());
        out.pack_bytes(state.bytes());
    }
}

fn unpack_list(
    input: &mut InputObjectState,
    ctx: &RestoreContext,
) -> std::result::Result<RecordList, StateError> {
    let count = input.unpack_u32()?;
    let mut list = RecordList::new();
    for _ in 0..count {
        let kind = RecordKind::from_tag(input.unpack_u8()?)?;
        let bytes = input.unpack_bytes()?;
        let mut state = InputObjectState::new(input.uid(), input.type_name(), bytes);
        let mut record = ParticipantRecord::restore(kind, &mut state, ctx)?;
        record.mark_recovered();
        list.push(record);
    }
    Ok(list)
}

fn read_log(
    input: &mut InputObjectState,
    ctx: &RestoreContext,
) -> std::result::Result<LogImage, StateError> {
    let (_process, transaction) = input.unpack_header()?;
    let status = ActionStatus::from_code(input.unpack_i32()?);
    let heuristic_decision = match input.unpack_u8()? {
        NO_DECISION => None,
        code => Some(
            TwoPhaseOutcome::from_code(code).ok_or(StateError::UnknownTag {
                what: "heuristic decision",
                tag: code as u32,
            })?,
        ),
    };
    let depth = input.unpack_u32()?;
    let mut hierarchy = ActionHierarchy::default();
    for _ in 0..depth {
        let uid = input.unpack_uid()?;
        let kind = if input.unpack_bool()? {
            ActionKind::Nested
        } else {
            ActionKind::TopLevel
        };
        hierarchy.push(uid, kind);
    }
    Ok(LogImage {
        transaction,
        status,
        heuristic_decision,
        hierarchy,
        prepared: unpack_list(input, ctx)?,
        failed: unpack_list(input, ctx)?,
        heuristic: unpack_list(input, ctx)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::COORDINATOR_TYPE;
    use crate::record::{ObjectImage, ResourceDirectory};
    use crate::testing::{ScriptedXaResource, XaCall};
    use crate::{InMemoryObjectStore, NoOpObserver, StoreState, XaError};

    struct Fixture {
        store: Arc<InMemoryObjectStore>,
        registry: Arc<TransactionRegistry>,
        env: CoordinatorEnv,
    }

    fn fixture() -> Fixture {
        crate::testing::init_test_tracing();
        let store = Arc::new(InMemoryObjectStore::new());
        let registry = Arc::new(TransactionRegistry::new());
        let uids = Arc::new(UidGenerator::with_parts(1, 2, 3));
        let env = CoordinatorEnv {
            store: Arc::clone(&store) as Arc<dyn ObjectStore>,
            process_uid: uids.process_uid(),
            uids,
            observer: Arc::new(NoOpObserver),
            stats: Arc::new(TransactionStats::new()),
            registry: Arc::downgrade(&registry),
            one_phase: true,
        };
        Fixture {
            store,
            registry,
            env,
        }
    }

    impl Fixture {
        fn begin(&self) -> Arc<Coordinator> {
            let coordinator = Coordinator::new_top_level(
                self.env.uids.next_uid(),
                COORDINATOR_TYPE,
                None,
                self.env.clone(),
            );
            assert!(self.registry.insert_if_absent(Arc::clone(&coordinator)));
            coordinator
        }

        fn rm(&self, name: &str) -> Arc<ScriptedXaResource> {
            Arc::new(ScriptedXaResource::new(name))
        }

        fn object(&self) -> Uid {
            self.env.uids.next_uid()
        }

        fn committed_image(&self, object: Uid) -> ObjectImage {
            let mut input = self
                .store
                .read_committed(object, "/Objects/Account")
                .unwrap()
                .unwrap();
            ObjectImage::unpack(&mut input).unwrap()
        }

        fn restore_ctx(&self, resources: Arc<ResourceDirectory>) -> RestoreContext {
            RestoreContext {
                store: Arc::clone(&self.store) as Arc<dyn ObjectStore>,
                resources,
            }
        }
    }

    #[test]
    fn zero_participants_commit_without_store_access() {
        let fx = fixture();
        let tx = fx.begin();
        assert_eq!(tx.commit(true).unwrap(), TwoPhaseOutcome::FinishOk);
        assert_eq!(tx.status(), ActionStatus::Committed);
        assert!(fx.store.all_types().unwrap().is_empty());
        assert!(fx.registry.is_empty());

        let tx = fx.begin();
        assert_eq!(tx.prepare().unwrap(), TwoPhaseOutcome::PrepareReadOnly);
        assert_eq!(tx.commit(true).unwrap(), TwoPhaseOutcome::FinishOk);
        assert!(fx.store.all_types().unwrap().is_empty());
    }

    #[test]
    fn refused_prepare_rolls_everything_back() {
        let fx = fixture();
        let tx = fx.begin();
        let ok = fx.rm("ok");
        let refusing = fx.rm("refusing");
        refusing.fail_prepare(XaError::ResourceFailure("disk full".into()));
        let object = fx.object();

        tx.write_object(object, "/Objects/Account", b"a".to_vec(), b"b".to_vec())
            .unwrap();
        let ok_xid = tx.enlist_resource(ok.clone()).unwrap();
        tx.enlist_resource(refusing.clone()).unwrap();

        assert_eq!(tx.commit(true).unwrap(), TwoPhaseOutcome::PrepareNotOk);
        assert_eq!(tx.status(), ActionStatus::Aborted);
        assert!(ok.calls().contains(&XaCall::Rollback(ok_xid)));
        assert_eq!(
            fx.store.current_state(object, "/Objects/Account").unwrap(),
            StoreState::Unknown
        );
        assert_eq!(
            fx.store.current_state(tx.uid(), COORDINATOR_TYPE).unwrap(),
            StoreState::Unknown
        );
        assert!(fx.registry.is_empty());
    }

    #[test]
    fn one_phase_heuristic_commit_is_ok_and_forgettable() {
        let fx = fixture();
        let tx = fx.begin();
        let rm = fx.rm("db");
        rm.fail_commit(XaError::HeuristicCommit);
        let xid = tx.enlist_resource(rm.clone()).unwrap();

        assert_eq!(tx.commit(true).unwrap(), TwoPhaseOutcome::FinishOk);
        assert_eq!(rm.calls(), vec![XaCall::Commit { xid: xid.clone(), one_phase: true }]);
        assert_eq!(tx.counts().heuristic, 1);
        assert!(fx.registry.contains(tx.uid()));

        assert!(tx.forget_heuristics().unwrap());
        assert!(rm.calls().contains(&XaCall::Forget(xid)));
        assert_eq!(tx.status(), ActionStatus::Committed);
        assert!(fx.registry.is_empty());
        assert_eq!(
            fx.store.current_state(tx.uid(), COORDINATOR_TYPE).unwrap(),
            StoreState::Unknown
        );
    }

    #[test]
    fn each_record_is_decided_exactly_once() {
        let fx = fixture();
        let tx = fx.begin();
        let a = fx.rm("a");
        let b = fx.rm("b");
        let xa = tx.enlist_resource(a.clone()).unwrap();
        let xb = tx.enlist_resource(b.clone()).unwrap();

        assert_eq!(tx.commit(true).unwrap(), TwoPhaseOutcome::FinishOk);
        assert_eq!(
            a.calls(),
            vec![XaCall::Prepare(xa.clone()), XaCall::Commit { xid: xa, one_phase: false }]
        );
        assert_eq!(
            b.calls(),
            vec![XaCall::Prepare(xb.clone()), XaCall::Commit { xid: xb, one_phase: false }]
        );

        assert!(matches!(
            tx.commit(true),
            Err(CoordinatorError::InvalidState { .. })
        ));
        assert_eq!(a.calls().len(), 2);
    }

    #[test]
    fn worst_heuristic_wins_and_log_survives() {
        let fx = fixture();
        let tx = fx.begin();
        let a = fx.rm("a");
        let b = fx.rm("b");
        let c = fx.rm("c");
        a.fail_commit(XaError::HeuristicRollback);
        b.fail_commit(XaError::HeuristicMixed);
        tx.enlist_resource(a).unwrap();
        tx.enlist_resource(b).unwrap();
        tx.enlist_resource(c).unwrap();

        assert_eq!(tx.commit(true).unwrap(), TwoPhaseOutcome::HeuristicMixed);
        assert_eq!(tx.status(), ActionStatus::HeuristicMixed);
        assert_eq!(tx.heuristic_decision(), Some(TwoPhaseOutcome::HeuristicMixed));
        assert_eq!(tx.counts().heuristic, 2);
        assert_eq!(
            fx.store.current_state(tx.uid(), COORDINATOR_TYPE).unwrap(),
            StoreState::Committed
        );
    }

    #[test]
    fn heuristics_hidden_unless_reported() {
        let fx = fixture();
        let tx = fx.begin();
        let a = fx.rm("a");
        a.fail_commit(XaError::HeuristicRollback);
        tx.enlist_resource(a).unwrap();
        tx.enlist_resource(fx.rm("b")).unwrap();
        assert_eq!(tx.commit(false).unwrap(), TwoPhaseOutcome::FinishError);
        assert_eq!(tx.status(), ActionStatus::HeuristicRollback);
    }

    #[test]
    fn finish_error_is_hazard_and_replay_resolves() {
        let fx = fixture();
        let tx = fx.begin();
        let flaky = fx.rm("flaky");
        flaky.fail_commit(XaError::ResourceFailure("timeout".into()));
        tx.enlist_resource(flaky.clone()).unwrap();
        tx.enlist_resource(fx.rm("steady")).unwrap();

        assert_eq!(tx.commit(true).unwrap(), TwoPhaseOutcome::HeuristicHazard);
        assert_eq!(tx.counts().failed, 1);
        assert!(fx.registry.is_empty());

        // rebuild from the log as recovery would
        let resources = Arc::new(ResourceDirectory::new());
        resources.register(flaky.clone());
        let log = fx
            .store
            .read_committed(tx.uid(), COORDINATOR_TYPE)
            .unwrap()
            .unwrap();
        let restored =
            Coordinator::restore(log, fx.env.clone(), &fx.restore_ctx(resources)).unwrap();
        assert_eq!(restored.status(), ActionStatus::Committing);
        assert_eq!(restored.counts().failed, 1);

        flaky.heal();
        assert_eq!(restored.replay(ReplayDirection::Commit), TwoPhaseOutcome::FinishOk);
        assert!(restored.is_resolved());
        assert_eq!(
            fx.store.current_state(tx.uid(), COORDINATOR_TYPE).unwrap(),
            StoreState::Unknown
        );
    }

    #[test]
    fn prepared_log_round_trips() {
        let fx = fixture();
        let tx = fx.begin();
        let object = fx.object();
        tx.write_object(object, "/Objects/Account", b"10".to_vec(), b"20".to_vec())
            .unwrap();
        let rm = fx.rm("db");
        tx.enlist_resource(rm.clone()).unwrap();

        assert_eq!(tx.prepare().unwrap(), TwoPhaseOutcome::PrepareOk);
        assert_eq!(tx.status(), ActionStatus::Prepared);

        let resources = Arc::new(ResourceDirectory::new());
        resources.register(rm);
        let log = fx
            .store
            .read_committed(tx.uid(), COORDINATOR_TYPE)
            .unwrap()
            .unwrap();
        let restored =
            Coordinator::restore(log, fx.env.clone(), &fx.restore_ctx(resources)).unwrap();
        assert_eq!(restored.uid(), tx.uid());
        assert_eq!(restored.status(), ActionStatus::Prepared);
        assert_eq!(restored.counts().prepared, 2);
        assert_eq!(restored.hierarchy(), tx.hierarchy());

        assert_eq!(tx.commit(true).unwrap(), TwoPhaseOutcome::FinishOk);
        let image = fx.committed_image(object);
        assert_eq!(image.after, b"20");
        assert_eq!((image.process, image.transaction), (fx.env.process_uid, tx.uid()));
    }

    #[test]
    fn nested_commit_merges_into_parent() {
        let fx = fixture();
        let parent = fx.begin();
        let object = fx.object();
        parent
            .write_object(object, "/Objects/Account", b"v0".to_vec(), b"v1".to_vec())
            .unwrap();

        let child = Coordinator::new_nested(fx.object(), &parent, None).unwrap();
        assert_eq!(child.hierarchy().depth(), 2);
        child
            .write_object(object, "/Objects/Account", b"v1".to_vec(), b"v2".to_vec())
            .unwrap();
        assert!(matches!(child.prepare(), Err(CoordinatorError::WrongKind { .. })));
        assert_eq!(child.commit(true).unwrap(), TwoPhaseOutcome::FinishOk);
        assert_eq!(child.status(), ActionStatus::Committed);
        // nothing reaches the store before the top level commits
        assert_eq!(
            fx.store.current_state(object, "/Objects/Account").unwrap(),
            StoreState::Unknown
        );
        assert_eq!(parent.counts().pending, 1);

        assert_eq!(parent.commit(true).unwrap(), TwoPhaseOutcome::FinishOk);
        let image = fx.committed_image(object);
        assert_eq!(image.before, b"v0");
        assert_eq!(image.after, b"v2");
        // the merged record names the top-level transaction
        assert_eq!(image.transaction, parent.uid());
    }

    #[test]
    fn nested_abort_discards_branch_and_parent_aborts_stragglers() {
        let fx = fixture();
        let parent = fx.begin();
        let child = Coordinator::new_nested(fx.object(), &parent, None).unwrap();
        child
            .write_object(fx.object(), "/Objects/Account", vec![], b"x".to_vec())
            .unwrap();
        assert_eq!(child.abort().unwrap(), TwoPhaseOutcome::FinishOk);
        assert_eq!(parent.counts().pending, 0);

        let straggler = Coordinator::new_nested(fx.object(), &parent, None).unwrap();
        assert_eq!(parent.commit(true).unwrap(), TwoPhaseOutcome::FinishOk);
        assert_eq!(straggler.status(), ActionStatus::Aborted);
        assert!(matches!(
            straggler.commit(true),
            Err(CoordinatorError::InvalidState { .. })
        ));
    }

    #[test]
    fn rollback_only_refuses_work_and_commit() {
        let fx = fixture();
        let tx = fx.begin();
        let rm = fx.rm("db");
        let xid = tx.enlist_resource(rm.clone()).unwrap();
        tx.set_rollback_only().unwrap();
        assert_eq!(tx.status(), ActionStatus::MarkedRollback);
        assert!(matches!(
            tx.write_object(fx.object(), "/Objects/Account", vec![], vec![]),
            Err(CoordinatorError::RollbackOnly(_))
        ));
        assert_eq!(tx.commit(true).unwrap(), TwoPhaseOutcome::PrepareNotOk);
        assert_eq!(tx.status(), ActionStatus::Aborted);
        assert_eq!(rm.calls(), vec![XaCall::Rollback(xid)]);
    }

    #[test]
    fn duplicate_branch_is_rejected() {
        let fx = fixture();
        let tx = fx.begin();
        let rm = fx.rm("db");
        let xid = Xid::new(tx.uid(), fx.object());
        let record = |uid| {
            ParticipantRecord::Resource(ResourceRecord::new(
                uid,
                xid.clone(),
                Arc::clone(&rm) as Arc<dyn XaResource>,
            ))
        };
        tx.enlist(record(fx.object())).unwrap();
        assert!(matches!(
            tx.enlist(record(fx.object())),
            Err(CoordinatorError::DuplicateResource { .. })
        ));
    }

    #[test]
    fn expire_only_touches_undecided_transactions() {
        let fx = fixture();
        let active = fx.begin();
        assert_eq!(active.expire(), Some(ActionStatus::Active));
        assert_eq!(active.expire(), None);
        assert!(matches!(
            active.ensure_active(),
            Err(CoordinatorError::RollbackOnly(_))
        ));

        let prepared = fx.begin();
        prepared.enlist_resource(fx.rm("a")).unwrap();
        prepared.enlist_resource(fx.rm("b")).unwrap();
        prepared.prepare().unwrap();
        assert_eq!(prepared.expire(), None);
        assert_eq!(prepared.commit(true).unwrap(), TwoPhaseOutcome::FinishOk);
    }
}
