//! Read/write lock manager with nested-scope ownership
//!
//! Every locked object has a chain of locks. A lock is owned by the deepest
//! scope of the requester's hierarchy; locks held by the requester's own
//! scope or any enclosing scope never conflict with it.

use crate::record::{LockRecord, ParticipantRecord};
use crate::{ActionHierarchy, Coordinator, CoordinatorError, RetryPolicy, Uid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared
    Read,
    /// Exclusive
    Write,
}

/// Lifecycle of a lock in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockStatus {
    /// Built but not granted
    Free,
    /// Granted to its owner
    Held,
    /// Handed up to an enclosing scope on nested commit
    Retained,
}

/// A single lock request or grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    mode: LockMode,
    owners: ActionHierarchy,
    status: LockStatus,
}

impl Lock {
    /// New, ungranted lock for the scope at the bottom of `owners`
    pub fn new(mode: LockMode, owners: ActionHierarchy) -> Self {
        Self {
            mode,
            owners,
            status: LockStatus::Free,
        }
    }

    /// Lock mode
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Owning scope (deepest entry of the hierarchy)
    pub fn owner(&self) -> Option<Uid> {
        self.owners.deepest()
    }

    /// Full owner hierarchy
    pub fn owners(&self) -> &ActionHierarchy {
        &self.owners
    }

    /// Current status
    pub fn status(&self) -> LockStatus {
        self.status
    }

    /// Would granting `self` clash with `held`?
    pub fn conflicts_with(&self, held: &Lock) -> bool {
        if self.owner() == held.owner() {
            return false;
        }
        if held.owners.is_ancestor_of(&self.owners) {
            return false;
        }
        !(self.mode == LockMode::Read && held.mode == LockMode::Read)
    }

    /// Hand the lock to the enclosing scope. Returns false for a top-level lock.
    pub fn propagate(&mut self) -> bool {
        if self.owners.depth() < 2 {
            return false;
        }
        self.owners.pop();
        self.status = LockStatus::Retained;
        true
    }
}

/// Result of a lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// Lock granted (or already held)
    Granted,
    /// Conflicting lock still held after every retry
    Refused,
}

/// Lock manager for a family of objects
pub struct LockManager {
    name: Box<str>,
    chains: Mutex<HashMap<Uid, Vec<Lock>>>,
    retry: RetryPolicy,
}

impl LockManager {
    /// Manager named `name` with the given acquisition retry policy
    pub fn new(name: &str, retry: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            chains: Mutex::new(HashMap::new()),
            retry,
        }
    }

    /// Manager name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn chains(&self) -> std::sync::MutexGuard<'_, HashMap<Uid, Vec<Lock>>> {
        self.chains
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Single non-blocking attempt
    pub fn try_lock(&self, object: Uid, lock: &Lock) -> LockResult {
        let mut chains = self.chains();
        let chain = chains.entry(object).or_default();
        if chain.iter().any(|held| lock.conflicts_with(held)) {
            return LockResult::Refused;
        }
        // reentrant: an existing lock of the same owner covers the request
        if let Some(existing) = chain
            .iter_mut()
            .find(|held| held.owner() == lock.owner())
        {
            if existing.mode < lock.mode {
                existing.mode = lock.mode;
            }
            return LockResult::Granted;
        }
        let mut granted = lock.clone();
        granted.status = LockStatus::Held;
        chain.push(granted);
        LockResult::Granted
    }

    /// Acquire with bounded retry and backoff, then refuse
    pub fn set_lock(&self, object: Uid, lock: &Lock) -> LockResult {
        let attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=attempts {
            if self.try_lock(object, lock) == LockResult::Granted {
                return LockResult::Granted;
            }
            if attempt < attempts {
                std::thread::sleep(self.retry.delay_for_attempt(attempt));
            }
        }
        tracing::debug!(
            manager = %self.name,
            object = %object,
            owner = ?lock.owner(),
            mode = ?lock.mode,
            "Lock refused"
        );
        LockResult::Refused
    }

    /// Acquire a lock for `coordinator` and enlist the matching lock record
    pub fn acquire(
        self: &Arc<Self>,
        coordinator: &Coordinator,
        object: Uid,
        mode: LockMode,
    ) -> Result<LockResult, CoordinatorError> {
        coordinator.ensure_active()?;
        let lock = Lock::new(mode, coordinator.hierarchy().clone());
        if self.set_lock(object, &lock) == LockResult::Refused {
            return Ok(LockResult::Refused);
        }
        let record = LockRecord::new(
            coordinator.new_record_uid(),
            Arc::clone(self),
            object,
            coordinator.hierarchy().clone(),
            mode,
        );
        if let Err(e) = coordinator.enlist(ParticipantRecord::Lock(record)) {
            self.release_all(object, coordinator.uid());
            return Err(e);
        }
        Ok(LockResult::Granted)
    }

    /// Release every lock `owner` holds on `object`
    pub fn release_all(&self, object: Uid, owner: Uid) -> usize {
        let mut chains = self.chains();
        let Some(chain) = chains.get_mut(&object) else {
            return 0;
        };
        let before = chain.len();
        chain.retain(|held| held.owner() != Some(owner));
        let released = before - chain.len();
        if chain.is_empty() {
            chains.remove(&object);
        }
        released
    }

    /// Release only read locks `owner` holds on `object`
    pub fn release_read_locks(&self, object: Uid, owner: Uid) -> usize {
        let mut chains = self.chains();
        let Some(chain) = chains.get_mut(&object) else {
            return 0;
        };
        let before = chain.len();
        chain.retain(|held| !(held.owner() == Some(owner) && held.mode == LockMode::Read));
        let released = before - chain.len();
        if chain.is_empty() {
            chains.remove(&object);
        }
        released
    }

    /// Hand locks owned by the deepest scope of `hierarchy` up one level.
    ///
    /// A lock the parent already holds in an equal or stronger mode absorbs
    /// the child's lock.
    pub fn propagate(&self, object: Uid, hierarchy: &ActionHierarchy) -> usize {
        let (Some(child), Some(parent)) = (hierarchy.deepest(), hierarchy.parent()) else {
            return 0;
        };
        let mut chains = self.chains();
        let Some(chain) = chains.get_mut(&object) else {
            return 0;
        };
        let mut moved = 0;
        let mut index = 0;
        while index < chain.len() {
            if chain[index].owner() != Some(child) {
                index += 1;
                continue;
            }
            let mode = chain[index].mode;
            let parent_lock = chain
                .iter()
                .position(|held| held.owner() == Some(parent));
            match parent_lock {
                Some(p) => {
                    if chain[p].mode < mode {
                        chain[p].mode = mode;
                    }
                    chain.remove(index);
                }
                None => {
                    chain[index].propagate();
                    index += 1;
                }
            }
            moved += 1;
        }
        moved
    }

    /// Snapshot of the chain for `object`
    pub fn locks_on(&self, object: Uid) -> Vec<Lock> {
        self.chains().get(&object).cloned().unwrap_or_default()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u32) -> Uid {
        Uid::from_parts(1, 1, 1, n)
    }

    fn lock(mode: LockMode, owner: u32) -> Lock {
        Lock::new(mode, ActionHierarchy::top_level(uid(owner)))
    }

    #[test]
    fn conflict_table() {
        use LockMode::*;
        // write/write, differing owners
        assert!(lock(Write, 1).conflicts_with(&lock(Write, 2)));
        // read/read
        assert!(!lock(Read, 1).conflicts_with(&lock(Read, 2)));
        // read/write, same owner
        assert!(!lock(Read, 1).conflicts_with(&lock(Write, 1)));
        assert!(!lock(Write, 1).conflicts_with(&lock(Read, 1)));
        // read/write, differing owners
        assert!(lock(Read, 1).conflicts_with(&lock(Write, 2)));
        assert!(lock(Write, 1).conflicts_with(&lock(Read, 2)));
    }

    #[test]
    fn nested_scope_does_not_conflict_with_its_ancestors() {
        let top = ActionHierarchy::top_level(uid(1));
        let child = top.nested(uid(2));
        let held = Lock::new(LockMode::Write, top.clone());
        let request = Lock::new(LockMode::Write, child);
        assert!(!request.conflicts_with(&held));
        // the other direction: a parent asking while a child holds conflicts
        assert!(Lock::new(LockMode::Write, top).conflicts_with(&request));
    }

    #[test]
    fn refused_after_bounded_retries() {
        let manager = LockManager::new("accounts", RetryPolicy::immediate(3));
        let object = uid(100);
        assert_eq!(manager.set_lock(object, &lock(LockMode::Write, 1)), LockResult::Granted);
        assert_eq!(manager.set_lock(object, &lock(LockMode::Read, 2)), LockResult::Refused);
        assert_eq!(manager.set_lock(object, &lock(LockMode::Read, 1)), LockResult::Granted);
        assert_eq!(manager.locks_on(object).len(), 1);

        assert_eq!(manager.release_all(object, uid(1)), 1);
        assert_eq!(manager.set_lock(object, &lock(LockMode::Read, 2)), LockResult::Granted);
    }

    #[test]
    fn propagate_hands_lock_to_parent() {
        let manager = LockManager::new("accounts", RetryPolicy::immediate(1));
        let object = uid(200);
        let top = ActionHierarchy::top_level(uid(1));
        let child = top.nested(uid(2));

        let request = Lock::new(LockMode::Write, child.clone());
        assert_eq!(manager.set_lock(object, &request), LockResult::Granted);
        assert_eq!(manager.propagate(object, &child), 1);

        let chain = manager.locks_on(object);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].owner(), Some(uid(1)));
        assert_eq!(chain[0].status(), LockStatus::Retained);
        // still held: another transaction is refused
        assert_eq!(manager.try_lock(object, &lock(LockMode::Read, 9)), LockResult::Refused);
    }

    #[test]
    fn propagate_merges_into_existing_parent_lock() {
        let manager = LockManager::new("accounts", RetryPolicy::immediate(1));
        let object = uid(300);
        let top = ActionHierarchy::top_level(uid(1));
        let child = top.nested(uid(2));

        manager.set_lock(object, &Lock::new(LockMode::Read, top));
        manager.set_lock(object, &Lock::new(LockMode::Write, child.clone()));
        manager.propagate(object, &child);

        let chain = manager.locks_on(object);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].mode(), LockMode::Write);
        assert_eq!(chain[0].owner(), Some(uid(1)));
    }
}
