//! Directory-backed object store
//!
//! Layout: one directory per type name below the root, one file per stored
//! version (`<uid>` committed, `<uid>.shadow` uncommitted) plus an empty
//! `<uid>.hidden` marker. Writes go to a temp file that is synced and renamed.

use super::{validate_type_name, Envelope, KeyLocks, ObjectStore, StoreError, StoreState};
use crate::{InputObjectState, OutputObjectState, Uid};
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const SHADOW_SUFFIX: &str = ".shadow";
const HIDDEN_SUFFIX: &str = ".hidden";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Clone, Copy)]
enum Version {
    Committed,
    Uncommitted,
    HiddenMarker,
}

/// Object store rooted at a directory.
pub struct FileObjectStore {
    root: PathBuf,
    keys: KeyLocks,
    sync: bool,
}

impl FileObjectStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            keys: KeyLocks::new(),
            sync: true,
        })
    }

    /// Skip fsync on writes. Only for tests.
    pub fn without_sync(mut self) -> Self {
        self.sync = false;
        self
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn type_dir(&self, type_name: &str) -> PathBuf {
        let mut dir = self.root.clone();
        for segment in type_name.split('/').filter(|s| !s.is_empty()) {
            dir.push(segment);
        }
        dir
    }

    fn path(&self, uid: Uid, type_name: &str, version: Version) -> PathBuf {
        let stem = file_stem(uid);
        let name = match version {
            Version::Committed => stem,
            Version::Uncommitted => format!("{stem}{SHADOW_SUFFIX}"),
            Version::HiddenMarker => format!("{stem}{HIDDEN_SUFFIX}"),
        };
        self.type_dir(type_name).join(name)
    }

    fn read_version(
        &self,
        uid: Uid,
        type_name: &str,
        version: Version,
    ) -> Result<Option<InputObjectState>, StoreError> {
        validate_type_name(type_name)?;
        let raw = match fs::read(self.path(uid, type_name, version)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope = Envelope::decode(uid, type_name, &raw)?;
        Ok(Some(InputObjectState::new(uid, type_name, envelope.payload)))
    }

    fn write_version(&self, state: &OutputObjectState, version: Version) -> Result<(), StoreError> {
        validate_type_name(state.type_name())?;
        let _key = self.keys.lock(state.uid(), state.type_name());
        let bytes =
            Envelope::new(state.uid(), state.type_name(), state.bytes().to_vec()).encode()?;
        let target = self.path(state.uid(), state.type_name(), version);
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir)?;
        }
        let temp = target.with_file_name(format!(
            "{}{TEMP_SUFFIX}",
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&bytes)?;
            if self.sync {
                file.sync_all()?;
            }
        }
        fs::rename(&temp, &target)?;
        Ok(())
    }

    /// Only a missing file means absent; any other failure is an error.
    fn exists(&self, uid: Uid, type_name: &str, version: Version) -> Result<bool, StoreError> {
        match fs::metadata(self.path(uid, type_name, version)) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn collect_types(&self, dir: &Path, prefix: &str, out: &mut Vec<Box<str>>) -> io::Result<()> {
        let mut has_entries = false;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if file_type.is_dir() {
                self.collect_types(&entry.path(), &format!("{prefix}/{name}"), out)?;
            } else if parse_entry_name(&name).is_some() {
                has_entries = true;
            }
        }
        if has_entries && !prefix.is_empty() {
            out.push(prefix.into());
        }
        Ok(())
    }
}

fn file_stem(uid: Uid) -> String {
    uid.to_string().replace(':', "_")
}

fn parse_entry_name(name: &str) -> Option<Uid> {
    if name.ends_with(TEMP_SUFFIX) || name.ends_with(HIDDEN_SUFFIX) {
        return None;
    }
    let stem = name.strip_suffix(SHADOW_SUFFIX).unwrap_or(name);
    stem.replace('_', ":").parse().ok()
}

fn remove_if_present(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl ObjectStore for FileObjectStore {
    fn current_state(&self, uid: Uid, type_name: &str) -> Result<StoreState, StoreError> {
        validate_type_name(type_name)?;
        let committed = self.exists(uid, type_name, Version::Committed)?;
        let uncommitted = self.exists(uid, type_name, Version::Uncommitted)?;
        let hidden = self.exists(uid, type_name, Version::HiddenMarker)?;
        Ok(StoreState::from_flags(committed, uncommitted, hidden))
    }

    fn read_committed(
        &self,
        uid: Uid,
        type_name: &str,
    ) -> Result<Option<InputObjectState>, StoreError> {
        self.read_version(uid, type_name, Version::Committed)
    }

    fn read_uncommitted(
        &self,
        uid: Uid,
        type_name: &str,
    ) -> Result<Option<InputObjectState>, StoreError> {
        self.read_version(uid, type_name, Version::Uncommitted)
    }

    fn write_committed(&self, state: &OutputObjectState) -> Result<(), StoreError> {
        self.write_version(state, Version::Committed)
    }

    fn write_uncommitted(&self, state: &OutputObjectState) -> Result<(), StoreError> {
        self.write_version(state, Version::Uncommitted)
    }

    fn commit_state(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        validate_type_name(type_name)?;
        let _key = self.keys.lock(uid, type_name);
        let shadow = self.path(uid, type_name, Version::Uncommitted);
        match fs::rename(&shadow, self.path(uid, type_name, Version::Committed)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_committed(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        validate_type_name(type_name)?;
        let _key = self.keys.lock(uid, type_name);
        let removed = remove_if_present(&self.path(uid, type_name, Version::Committed))?;
        if !self.exists(uid, type_name, Version::Uncommitted)? {
            remove_if_present(&self.path(uid, type_name, Version::HiddenMarker))?;
        }
        Ok(removed)
    }

    fn remove_uncommitted(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        validate_type_name(type_name)?;
        let _key = self.keys.lock(uid, type_name);
        let removed = remove_if_present(&self.path(uid, type_name, Version::Uncommitted))?;
        if !self.exists(uid, type_name, Version::Committed)? {
            remove_if_present(&self.path(uid, type_name, Version::HiddenMarker))?;
        }
        Ok(removed)
    }

    fn hide_state(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        validate_type_name(type_name)?;
        let _key = self.keys.lock(uid, type_name);
        let present = self.exists(uid, type_name, Version::Committed)?
            || self.exists(uid, type_name, Version::Uncommitted)?;
        if !present || self.exists(uid, type_name, Version::HiddenMarker)? {
            return Ok(false);
        }
        fs::File::create(self.path(uid, type_name, Version::HiddenMarker))?;
        Ok(true)
    }

    fn reveal_state(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError> {
        validate_type_name(type_name)?;
        let _key = self.keys.lock(uid, type_name);
        remove_if_present(&self.path(uid, type_name, Version::HiddenMarker))
    }

    fn all_types(&self) -> Result<Vec<Box<str>>, StoreError> {
        let mut types = Vec::new();
        self.collect_types(&self.root, "", &mut types)?;
        types.sort();
        Ok(types)
    }

    fn all_obj_uids(&self, type_name: &str) -> Result<Vec<Uid>, StoreError> {
        validate_type_name(type_name)?;
        let dir = self.type_dir(type_name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut uids = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(uid) = parse_entry_name(&entry.file_name().to_string_lossy()) {
                uids.insert(uid);
            }
        }
        Ok(uids.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPE: &str = "/Transaction/Coordinator";

    fn open() -> (tempfile::TempDir, FileObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::open(dir.path()).unwrap().without_sync();
        (dir, store)
    }

    fn state(uid: Uid, type_name: &str, payload: &[u8]) -> OutputObjectState {
        let mut out = OutputObjectState::new(uid, type_name);
        out.pack_bytes(payload);
        out
    }

    #[test]
    fn survives_reopen() {
        let (dir, store) = open();
        let uid = Uid::from_parts(0xabc, 7, 9, 1);
        store.write_committed(&state(uid, TYPE, b"intentions")).unwrap();
        drop(store);

        let reopened = FileObjectStore::open(dir.path()).unwrap();
        assert_eq!(reopened.current_state(uid, TYPE).unwrap(), StoreState::Committed);
        let mut read = reopened.read_committed(uid, TYPE).unwrap().unwrap();
        assert_eq!(read.unpack_bytes().unwrap(), b"intentions");
        assert_eq!(reopened.all_obj_uids(TYPE).unwrap(), vec![uid]);
    }

    #[test]
    fn shadow_commit_and_hide() {
        let (_dir, store) = open();
        let uid = Uid::from_parts(1, 2, 3, 4);
        store.write_uncommitted(&state(uid, "/Objects/Account", b"v2")).unwrap();
        assert_eq!(
            store.current_state(uid, "/Objects/Account").unwrap(),
            StoreState::Uncommitted
        );
        assert!(store.hide_state(uid, "/Objects/Account").unwrap());
        assert_eq!(
            store.current_state(uid, "/Objects/Account").unwrap(),
            StoreState::UncommittedHidden
        );
        assert!(store.reveal_state(uid, "/Objects/Account").unwrap());
        assert!(store.commit_state(uid, "/Objects/Account").unwrap());
        assert_eq!(
            store.current_state(uid, "/Objects/Account").unwrap(),
            StoreState::Committed
        );
        assert_eq!(store.all_obj_uids("/Objects/Account").unwrap(), vec![uid]);
    }

    #[test]
    fn all_types_lists_nested_directories_with_entries() {
        let (_dir, store) = open();
        let uid = Uid::from_parts(1, 2, 3, 5);
        store.write_committed(&state(uid, TYPE, b"a")).unwrap();
        store
            .write_committed(&state(uid, "/Transaction/Coordinator/Subordinate", b"b"))
            .unwrap();
        assert_eq!(
            store.all_types().unwrap(),
            vec![
                Box::<str>::from("/Transaction/Coordinator"),
                Box::<str>::from("/Transaction/Coordinator/Subordinate"),
            ]
        );
        assert!(store.remove_committed(uid, TYPE).unwrap());
        assert_eq!(
            store.all_types().unwrap(),
            vec![Box::<str>::from("/Transaction/Coordinator/Subordinate")]
        );
    }

    #[test]
    fn corrupt_file_is_reported_not_guessed() {
        let (_dir, store) = open();
        let uid = Uid::from_parts(1, 2, 3, 6);
        let path = store.path(uid, TYPE, Version::Committed);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"garbage").unwrap();
        assert!(matches!(
            store.read_committed(uid, TYPE),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_state_is_an_error_not_absent() {
        let (dir, store) = open();
        let uid = Uid::from_parts(1, 2, 3, 7);
        // a type directory that resolves to itself
        let transaction = dir.path().join("Transaction");
        fs::create_dir_all(&transaction).unwrap();
        std::os::unix::fs::symlink(
            transaction.join("Coordinator"),
            transaction.join("Coordinator"),
        )
        .unwrap();

        assert!(matches!(store.current_state(uid, TYPE), Err(StoreError::Io(_))));
        assert!(matches!(store.read_committed(uid, TYPE), Err(StoreError::Io(_))));
        assert!(store.hide_state(uid, TYPE).is_err());
    }
}
