//! Process-local table of live coordinators

use crate::{Coordinator, Uid};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Live coordinators by transaction id.
///
/// Owned by the process context. Recovery and the status responder consult
/// it before the store so a running transaction is never replayed.
#[derive(Default)]
pub struct TransactionRegistry {
    live: RwLock<HashMap<Uid, Arc<Coordinator>>>,
}

impl TransactionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uid, Arc<Coordinator>>> {
        self.live.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uid, Arc<Coordinator>>> {
        self.live
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a coordinator unless its uid is taken. Returns false if
    /// another coordinator already owns the uid.
    pub fn insert_if_absent(&self, coordinator: Arc<Coordinator>) -> bool {
        let mut live = self.write();
        match live.entry(coordinator.uid()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(coordinator);
                true
            }
        }
    }

    /// Coordinator for `uid`
    pub fn get(&self, uid: Uid) -> Option<Arc<Coordinator>> {
        self.read().get(&uid).cloned()
    }

    /// Drop the entry for `uid`
    pub fn remove(&self, uid: Uid) -> Option<Arc<Coordinator>> {
        self.write().remove(&uid)
    }

    /// Is `uid` live?
    pub fn contains(&self, uid: Uid) -> bool {
        self.read().contains_key(&uid)
    }

    /// Every live coordinator
    pub fn snapshot(&self) -> Vec<Arc<Coordinator>> {
        self.read().values().cloned().collect()
    }

    /// Number of live coordinators
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// No live coordinators
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl std::fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRegistry")
            .field("live", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryObjectStore, NoOpObserver, ObjectStore, ProcessContext, TransactionConfig};

    #[test]
    fn one_coordinator_per_uid() {
        let ctx = ProcessContext::new(
            TransactionConfig::default(),
            Arc::new(InMemoryObjectStore::new()) as Arc<dyn ObjectStore>,
            Arc::new(NoOpObserver),
        );
        let tx = ctx.begin().unwrap();
        let registry = ctx.registry();
        assert!(registry.contains(tx.uid()));
        assert!(!registry.insert_if_absent(Arc::clone(&tx)));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(tx.uid()).is_some());
        assert!(registry.get(tx.uid()).is_none());
        assert!(registry.insert_if_absent(Arc::clone(&tx)));
        assert_eq!(registry.snapshot().len(), 1);
    }
}
