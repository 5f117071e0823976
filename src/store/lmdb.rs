//! LMDB-backed object store (feature `lmdb`)

use super::{validate_type_name, Envelope, ObjectStore, StoreError, StoreState};
use crate::{InputObjectState, OutputObjectState, Uid};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use std::collections::BTreeSet;
use std::path::Path;

const SEPARATOR: char = '\u{1f}';
const COMMITTED: &str = "c";
const UNCOMMITTED: &str = "u";
const HIDDEN: &str = "h";

/// Object store kept in a single LMDB database.
pub struct LmdbObjectStore {
    env: Env,
    db: Database<Str, Bytes>,
}

fn storage(e: heed::Error) -> StoreError {
    StoreError::Storage(e.to_string().into())
}

fn key(uid: Uid, type_name: &str, version: &str) -> String {
    format!("{type_name}{SEPARATOR}{uid}{SEPARATOR}{version}")
}

fn split_key(key: &str) -> Option<(&str, Uid, &str)> {
    let mut parts = key.split(SEPARATOR);
    let type_name = parts.next()?;
    let uid = parts.next()?.parse().ok()?;
    let version = parts.next()?;
    Some((type_name, uid, version))
}

impl LmdbObjectStore {
    /// Open (creating if needed) an environment in `dir`
    pub fn open(dir: impl AsRef<Path>, map_size: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir.as_ref())?;
        // SAFETY: the environment is opened once per directory by this store
        // and never concurrently re-opened inside the same process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(dir.as_ref())
        }
        .map_err(storage)?;
        let mut wtxn = env.write_txn().map_err(storage)?;
        let db: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some("objects"))
            .map_err(storage)?;
        wtxn.commit().map_err(storage)?;
        Ok(Self { env, db })
    }

    fn exists(&self, uid: Uid, type_name: &str, version: &str) -> Result<bool, StoreError> {
        let rtxn = self.env.read_txn().map_err(storage)?;
        Ok(self
            .db
            .get(&rtxn, &key(uid, type_name, version))
            .map_err(storage)?
            .is_some())
    }

    fn read(
        &self,
        uid: Uid,
        type_name: &str,
        version: &str,
    ) -> Result<Option<InputObjectState>, StoreError> {
        validate_type_name(type_name)?;
        let rtxn = self.env.read_txn().map_err(storage)?;
        let Some(raw) = self
            .db
            .get(&rtxn, &key(uid, type_name, version))
            .map_err(storage)?
        else {
            return Ok(None);
        };
        let envelope = Envelope::decode(uid, type_name, raw)?;
        Ok(Some(InputObjectState::new(uid, type_name, envelope.payload)))
    }

    fn write(&self, state: &OutputObjectState, version: &str) -> Result<(), StoreError> {
        validate_type_name(state.type_name())?;
        let bytes =
            Envelope::new(state.uid(), state.type_name(), state.bytes().to_vec()).encode()?;
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        self.db
            .put(&mut wtxn, &key(state.uid(), state.type_name(), version), &bytes)
            .map_err(storage)?;
        wtxn.commit().map_err(storage)
    }

    fn remove(&self, uid: Uid, type_name: &str, version: &str) -> Result<bool, StoreError> {
        validate_type_name(type_name)?;
        let other = if version == COMMITTED { UNCOMMITTED } else { COMMITTED };
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        let removed = self
            .db
            .delete(&mut wtxn, &key(uid, type_name, version))
            .map_err(storage)?;
        if self
            .db
            .get(&wtxn, &key(uid, type_name, other))
            .map_err(storage)?
            .is_none()
        {
            self.db
                .delete(&mut wtxn, &key(uid, type_name, HIDDEN))
                .map_err(storage)?;
        }
        wtxn.commit().map_err(storage)?;
        Ok(removed)
    }
}

impl ObjectStore for LmdbObjectStore {
    fn current_state(&self, uid: Uid, type_name: &str) -> Result<StoreState, StoreError> {
        validate_type_name(type_name)?;
        Ok(StoreState::from_flags(
            self.exists(uid, type_name, COMMITTED)?,
            self.exists(uid, type_name, UNCOMMITTED)?,
            self.exists(uid, type_name, HIDDEN)?,
        ))
    }

    fn read_committed(
        &self,
        uid: Uid,
        type_name: &str,
    ) -> Result<Option<InputObjectState>, StoreError> {
        self.read(uid, type_name, COMMITTED)
    }

    fn read_uncommitted(
        &self,
        uid: Uid,
        type_name: &str,
    ) -> Result<Option<InputObjectState>, StoreError> {
        self.read(uid, type_name, UNCOMMITTED)
    }

    fn write_committed(&self, state: &OutputObjectState) -> Result<(), StoreError> {
        self.write(state, COMMITTED)
    }

    fn write_uncommitted(&self, state: &OutputObjectState) -> Result<(), StoreError> {
        self.write(state, UNCOMMITTED)
    }

    fn commit_state(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        validate_type_name(type_name)?;
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        let shadow_key = key(uid, type_name, UNCOMMITTED);
        let Some(raw) = self
            .db
            .get(&wtxn, &shadow_key)
            .map_err(storage)?
            .map(|raw| raw.to_vec())
        else {
            return Ok(false);
        };
        self.db
            .put(&mut wtxn, &key(uid, type_name, COMMITTED), &raw)
            .map_err(storage)?;
        self.db.delete(&mut wtxn, &shadow_key).map_err(storage)?;
        wtxn.commit().map_err(storage)?;
        Ok(true)
    }

    fn remove_committed(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        self.remove(uid, type_name, COMMITTED)
    }

    fn remove_uncommitted(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        self.remove(uid, type_name, UNCOMMITTED)
    }

    fn hide_state(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        let state = self.current_state(uid, type_name)?;
        if state == StoreState::Unknown || state.is_hidden() {
            return Ok(false);
        }
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        self.db
            .put(&mut wtxn, &key(uid, type_name, HIDDEN), &[])
            .map_err(storage)?;
        wtxn.commit().map_err(storage)?;
        Ok(true)
    }

    fn reveal_state(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        validate_type_name(type_name)?;
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        let removed = self
            .db
            .delete(&mut wtxn, &key(uid, type_name, HIDDEN))
            .map_err(storage)?;
        wtxn.commit().map_err(storage)?;
        Ok(removed)
    }

    fn all_types(&self) -> Result<Vec<Box<str>>, StoreError> {
        let rtxn = self.env.read_txn().map_err(storage)?;
        let mut types = BTreeSet::new();
        for item in self.db.iter(&rtxn).map_err(storage)? {
            let (raw_key, _) = item.map_err(storage)?;
            if let Some((type_name, _, version)) = split_key(raw_key) {
                if version != HIDDEN {
                    types.insert(Box::<str>::from(type_name));
                }
            }
        }
        Ok(types.into_iter().collect())
    }

    fn all_obj_uids(&self, type_name: &str) -> Result<Vec<Uid>, StoreError> {
        validate_type_name(type_name)?;
        let rtxn = self.env.read_txn().map_err(storage)?;
        let prefix = format!("{type_name}{SEPARATOR}");
        let mut uids = BTreeSet::new();
        for item in self.db.prefix_iter(&rtxn, &prefix).map_err(storage)? {
            let (raw_key, _) = item.map_err(storage)?;
            if let Some((_, uid, version)) = split_key(raw_key) {
                if version != HIDDEN {
                    uids.insert(uid);
                }
            }
        }
        Ok(uids.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lmdb_store_promotes_and_enumerates() {
        let dir = tempfile::tempdir().unwrap();
        let store = LmdbObjectStore::open(dir.path(), 16 * 1024 * 1024).unwrap();
        let uid = Uid::from_parts(4, 3, 2, 1);
        let mut out = OutputObjectState::new(uid, "/Objects/Account");
        out.pack_string("balance=10");
        store.write_uncommitted(&out).unwrap();
        assert!(store.commit_state(uid, "/Objects/Account").unwrap());
        assert_eq!(
            store.current_state(uid, "/Objects/Account").unwrap(),
            StoreState::Committed
        );
        assert_eq!(store.all_obj_uids("/Objects/Account").unwrap(), vec![uid]);
        assert_eq!(
            store.all_types().unwrap(),
            vec![Box::<str>::from("/Objects/Account")]
        );
        assert!(store.remove_committed(uid, "/Objects/Account").unwrap());
        assert!(store.all_types().unwrap().is_empty());
    }
}
