//! Crash-and-recover scenarios against a shared store
//!
//! A "crash" is simulated by dropping one process context and building a
//! second one, with a different process identity, over the same store.

use icanact_two_phase::{
    ActionStatus, InMemoryObjectStore, NoOpObserver, ObjectImage, ObjectStore, ProcessContext,
    StoreState, TransactionConfig, TwoPhaseOutcome, Uid, UidGenerator, COORDINATOR_TYPE,
};
use std::sync::Arc;

const ACCOUNT: &str = "/Objects/Account";

fn process(store: &Arc<InMemoryObjectStore>, id: u32) -> ProcessContext {
    ProcessContext::with_uid_generator(
        TransactionConfig::default(),
        Arc::clone(store) as Arc<dyn ObjectStore>,
        Arc::new(NoOpObserver),
        Arc::new(UidGenerator::with_parts(1, id, 1)),
    )
}

/// After state of the committed object image
fn committed_bytes(store: &InMemoryObjectStore, object: Uid) -> Option<Vec<u8>> {
    store
        .read_committed(object, ACCOUNT)
        .unwrap()
        .map(|mut state| ObjectImage::unpack(&mut state).unwrap().after)
}

#[test]
fn crash_after_prepare_is_committed_by_recovery() {
    let store = Arc::new(InMemoryObjectStore::new());
    let crashed = process(&store, 1);
    let (alice, bob) = (crashed.next_uid(), crashed.next_uid());
    let tx = crashed.begin().unwrap();
    tx.write_object(alice, ACCOUNT, b"100".to_vec(), b"70".to_vec())
        .unwrap();
    tx.write_object(bob, ACCOUNT, b"0".to_vec(), b"30".to_vec())
        .unwrap();
    assert_eq!(tx.prepare().unwrap(), TwoPhaseOutcome::PrepareOk);
    let uid = tx.uid();
    assert_eq!(
        store.current_state(uid, COORDINATOR_TYPE).unwrap(),
        StoreState::Committed
    );
    let mut shadow = store.read_uncommitted(alice, ACCOUNT).unwrap().unwrap();
    let image = ObjectImage::unpack(&mut shadow).unwrap();
    assert_eq!((image.process, image.transaction), (crashed.process_uid(), uid));
    drop(tx);
    drop(crashed);

    let restarted = process(&store, 2);
    let report = restarted.recovery_manager().scan();
    assert_eq!(report.resolved, 1);
    assert_eq!(committed_bytes(&store, alice).as_deref(), Some(&b"70"[..]));
    assert_eq!(committed_bytes(&store, bob).as_deref(), Some(&b"30"[..]));
    assert_eq!(
        store.current_state(uid, COORDINATOR_TYPE).unwrap(),
        StoreState::Unknown
    );
    assert_eq!(restarted.stats().recovered, 1);

    // a second scan has nothing to do
    let report = restarted.recovery_manager().scan();
    assert_eq!(report.scanned, 0);
}

#[test]
fn crash_midway_through_phase_two_finishes_the_rest() {
    let store = Arc::new(InMemoryObjectStore::new());
    let crashed = process(&store, 1);
    let (alice, bob) = (crashed.next_uid(), crashed.next_uid());
    let tx = crashed.begin().unwrap();
    tx.write_object(alice, ACCOUNT, b"1".to_vec(), b"2".to_vec())
        .unwrap();
    tx.write_object(bob, ACCOUNT, b"3".to_vec(), b"4".to_vec())
        .unwrap();
    tx.prepare().unwrap();
    // alice's shadow was promoted before the crash, bob's was not
    assert!(store.commit_state(alice, ACCOUNT).unwrap());
    drop(tx);
    drop(crashed);

    let restarted = process(&store, 2);
    assert_eq!(restarted.recovery_manager().scan().resolved, 1);
    assert_eq!(committed_bytes(&store, alice).as_deref(), Some(&b"2"[..]));
    assert_eq!(committed_bytes(&store, bob).as_deref(), Some(&b"4"[..]));
    assert_eq!(store.current_state(bob, ACCOUNT).unwrap(), StoreState::Committed);
}

#[test]
fn crash_before_prepare_leaves_nothing_and_presumes_abort() {
    let store = Arc::new(InMemoryObjectStore::new());
    let crashed = process(&store, 1);
    let object = crashed.next_uid();
    let tx = crashed.begin().unwrap();
    tx.write_object(object, ACCOUNT, vec![], b"draft".to_vec())
        .unwrap();
    let uid = tx.uid();
    drop(tx);
    drop(crashed);

    let restarted = process(&store, 2);
    let report = restarted.recovery_manager().scan();
    assert_eq!(report.scanned, 0);
    assert_eq!(
        store.current_state(object, ACCOUNT).unwrap(),
        StoreState::Unknown
    );
    assert_eq!(
        restarted.status_resolver().status(uid, None),
        ActionStatus::Aborted
    );
}

#[test]
fn nested_work_survives_a_crash_through_the_parent_log() {
    let store = Arc::new(InMemoryObjectStore::new());
    let crashed = process(&store, 1);
    let (object, other) = (crashed.next_uid(), crashed.next_uid());
    let parent = crashed.begin().unwrap();
    parent
        .write_object(object, ACCOUNT, b"v0".to_vec(), b"v1".to_vec())
        .unwrap();
    let child = crashed.begin_nested(&parent).unwrap();
    child
        .write_object(object, ACCOUNT, b"v1".to_vec(), b"v2".to_vec())
        .unwrap();
    child
        .write_object(other, ACCOUNT, vec![], b"new".to_vec())
        .unwrap();
    assert_eq!(child.commit(true).unwrap(), TwoPhaseOutcome::FinishOk);
    assert_eq!(parent.counts().pending, 2);
    assert_eq!(parent.prepare().unwrap(), TwoPhaseOutcome::PrepareOk);
    drop(child);
    drop(parent);
    drop(crashed);

    let restarted = process(&store, 2);
    assert_eq!(restarted.recovery_manager().scan().resolved, 1);
    assert_eq!(committed_bytes(&store, object).as_deref(), Some(&b"v2"[..]));
    assert_eq!(committed_bytes(&store, other).as_deref(), Some(&b"new"[..]));
}

#[test]
fn disposal_is_not_logged_and_applies_on_commit() {
    let store = Arc::new(InMemoryObjectStore::new());
    let ctx = process(&store, 1);
    let (kept, doomed) = (ctx.next_uid(), ctx.next_uid());

    let setup = ctx.begin().unwrap();
    setup
        .write_object(doomed, ACCOUNT, vec![], b"old".to_vec())
        .unwrap();
    assert_eq!(setup.commit(true).unwrap(), TwoPhaseOutcome::FinishOk);
    assert_eq!(ctx.stats().one_phase_commits, 1);

    let tx = ctx.begin().unwrap();
    tx.write_object(kept, ACCOUNT, vec![], b"fresh".to_vec())
        .unwrap();
    tx.dispose_object(doomed, ACCOUNT).unwrap();
    assert_eq!(tx.commit(true).unwrap(), TwoPhaseOutcome::FinishOk);
    assert_eq!(committed_bytes(&store, kept).as_deref(), Some(&b"fresh"[..]));
    assert_eq!(
        store.current_state(doomed, ACCOUNT).unwrap(),
        StoreState::Unknown
    );
}
