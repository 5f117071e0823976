//! In-memory object store

use super::{validate_type_name, ObjectStore, StoreError, StoreState};
use crate::{InputObjectState, OutputObjectState, Uid};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

#[derive(Default, Clone)]
struct Slot {
    committed: Option<Vec<u8>>,
    uncommitted: Option<Vec<u8>>,
    hidden: bool,
}

impl Slot {
    fn state(&self) -> StoreState {
        StoreState::from_flags(
            self.committed.is_some(),
            self.uncommitted.is_some(),
            self.hidden,
        )
    }

    fn is_empty(&self) -> bool {
        self.committed.is_none() && self.uncommitted.is_none()
    }
}

/// Volatile store for tests and for processes that accept losing their log.
///
/// Every mutation runs under the map's write lock, which also provides the
/// per-key writer exclusion.
pub struct InMemoryObjectStore {
    data: RwLock<BTreeMap<Box<str>, HashMap<Uid, Slot>>>,
}

impl InMemoryObjectStore {
    /// Empty store
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
        }
    }

    fn read_slot(&self, uid: Uid, type_name: &str) -> Result<Option<Slot>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Storage(e.to_string().into()))?;
        Ok(data.get(type_name).and_then(|m| m.get(&uid)).cloned())
    }

    fn update<R>(
        &self,
        uid: Uid,
        type_name: &str,
        f: impl FnOnce(&mut Slot) -> R,
    ) -> Result<R, StoreError> {
        validate_type_name(type_name)?;
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Storage(e.to_string().into()))?;
        let slots = data.entry(type_name.into()).or_default();
        let slot = slots.entry(uid).or_default();
        let result = f(slot);
        if slot.is_empty() {
            slots.remove(&uid);
        }
        if slots.is_empty() {
            data.remove(type_name);
        }
        Ok(result)
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn current_state(&self, uid: Uid, type_name: &str) -> Result<StoreState, StoreError> {
        Ok(self
            .read_slot(uid, type_name)?
            .map(|slot| slot.state())
            .unwrap_or(StoreState::Unknown))
    }

    fn read_committed(
        &self,
        uid: Uid,
        type_name: &str,
    ) -> Result<Option<InputObjectState>, StoreError> {
        Ok(self
            .read_slot(uid, type_name)?
            .and_then(|slot| slot.committed)
            .map(|bytes| InputObjectState::new(uid, type_name, bytes)))
    }

    fn read_uncommitted(
        &self,
        uid: Uid,
        type_name: &str,
    ) -> Result<Option<InputObjectState>, StoreError> {
        Ok(self
            .read_slot(uid, type_name)?
            .and_then(|slot| slot.uncommitted)
            .map(|bytes| InputObjectState::new(uid, type_name, bytes)))
    }

    fn write_committed(&self, state: &OutputObjectState) -> Result<(), StoreError> {
        let bytes = state.bytes().to_vec();
        self.update(state.uid(), state.type_name(), |slot| {
            slot.committed = Some(bytes);
        })
    }

    fn write_uncommitted(&self, state: &OutputObjectState) -> Result<(), StoreError> {
        let bytes = state.bytes().to_vec();
        self.update(state.uid(), state.type_name(), |slot| {
            slot.uncommitted = Some(bytes);
        })
    }

    fn commit_state(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        self.update(uid, type_name, |slot| match slot.uncommitted.take() {
            Some(bytes) => {
                slot.committed = Some(bytes);
                true
            }
            None => false,
        })
    }

    fn remove_committed(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        self.update(uid, type_name, |slot| slot.committed.take().is_some())
    }

    fn remove_uncommitted(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        self.update(uid, type_name, |slot| slot.uncommitted.take().is_some())
    }

    fn hide_state(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        self.update(uid, type_name, |slot| {
            if slot.is_empty() || slot.hidden {
                return false;
            }
            slot.hidden = true;
            true
        })
    }

    fn reveal_state(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        self.update(uid, type_name, |slot| std::mem::replace(&mut slot.hidden, false))
    }

    fn all_types(&self) -> Result<Vec<Box<str>>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Storage(e.to_string().into()))?;
        Ok(data.keys().cloned().collect())
    }

    fn all_obj_uids(&self, type_name: &str) -> Result<Vec<Uid>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Storage(e.to_string().into()))?;
        let mut uids: Vec<Uid> = data
            .get(type_name)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        uids.sort();
        Ok(uids)
    }
}
