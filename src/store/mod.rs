//! Durable (uid, type) -> blob store
//!
//! Coordinators keep their intentions log here and persistence records their
//! write-ahead state. Absence of an entry means "aborted or never existed".

mod envelope;
mod file;
#[cfg(feature = "lmdb")]
mod lmdb;
mod memory;

pub use envelope::{Envelope, ENVELOPE_VERSION};
pub use file::FileObjectStore;
#[cfg(feature = "lmdb")]
pub use lmdb::LmdbObjectStore;
pub use memory::InMemoryObjectStore;

use crate::{InputObjectState, OutputObjectState, Uid};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

/// State of a single (uid, type) entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreState {
    /// No entry
    Unknown,
    /// Committed state present
    Committed,
    /// Uncommitted (shadow) state present
    Uncommitted,
    /// Hidden marker without state
    Hidden,
    /// Committed state present but hidden from scans
    CommittedHidden,
    /// Uncommitted state present but hidden from scans
    UncommittedHidden,
}

impl StoreState {
    /// Numeric code of the state
    pub fn code(&self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Committed => 1,
            Self::Uncommitted => 2,
            Self::Hidden => 4,
            Self::CommittedHidden => 5,
            Self::UncommittedHidden => 6,
        }
    }

    /// Entry is hidden from recovery scans
    pub fn is_hidden(&self) -> bool {
        matches!(
            self,
            Self::Hidden | Self::CommittedHidden | Self::UncommittedHidden
        )
    }

    /// Entry holds an uncommitted (shadow) version
    pub fn has_uncommitted(&self) -> bool {
        matches!(self, Self::Uncommitted | Self::UncommittedHidden)
    }

    pub(crate) fn from_flags(committed: bool, uncommitted: bool, hidden: bool) -> Self {
        match (uncommitted, committed, hidden) {
            (true, _, false) => Self::Uncommitted,
            (true, _, true) => Self::UncommittedHidden,
            (false, true, false) => Self::Committed,
            (false, true, true) => Self::CommittedHidden,
            (false, false, true) => Self::Hidden,
            (false, false, false) => Self::Unknown,
        }
    }
}

/// Store failure
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying I/O failed
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A stored blob could not be decoded
    #[error("corrupt entry {uid} of type {type_name}: {reason}")]
    Corrupt {
        /// Entry uid
        uid: Uid,
        /// Entry type
        type_name: Box<str>,
        /// Decoder message
        reason: Box<str>,
    },
    /// Type names are absolute `/`-separated paths
    #[error("invalid type name: {0}")]
    InvalidTypeName(Box<str>),
    /// Backend-specific failure
    #[error("storage error: {0}")]
    Storage(Box<str>),
}

/// Durable object store contract.
pub trait ObjectStore: Send + Sync + 'static {
    /// Current state of an entry
    fn current_state(&self, uid: Uid, type_name: &str) -> Result<StoreState, StoreError>;

    /// Read the committed version, if any
    fn read_committed(
        &self,
        uid: Uid,
        type_name: &str,
    ) -> Result<Option<InputObjectState>, StoreError>;

    /// Read the uncommitted version, if any
    fn read_uncommitted(
        &self,
        uid: Uid,
        type_name: &str,
    ) -> Result<Option<InputObjectState>, StoreError>;

    /// Write (or overwrite) the committed version
    fn write_committed(&self, state: &OutputObjectState) -> Result<(), StoreError>;

    /// Write (or overwrite) the uncommitted version
    fn write_uncommitted(&self, state: &OutputObjectState) -> Result<(), StoreError>;

    /// Promote the uncommitted version to committed. Returns false if there
    /// was no uncommitted version.
    fn commit_state(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError>;

    /// Delete the committed version. Returns false if absent.
    fn remove_committed(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError>;

    /// Delete the uncommitted version. Returns false if absent.
    fn remove_uncommitted(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError>;

    /// Hide an entry from scans. Returns false if there is nothing to hide.
    fn hide_state(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError>;

    /// Undo [`ObjectStore::hide_state`]. Returns false if it was not hidden.
    fn reveal_state(&self, uid: Uid, type_name: &str) -> Result<bool, StoreError>;

    /// Every type name that currently has entries
    fn all_types(&self) -> Result<Vec<Box<str>>, StoreError>;

    /// Every uid with an entry under `type_name`
    fn all_obj_uids(&self, type_name: &str) -> Result<Vec<Uid>, StoreError>;
}

/// Reject type names that are not absolute `/`-separated paths.
pub fn validate_type_name(type_name: &str) -> Result<(), StoreError> {
    let valid = type_name.starts_with('/')
        && type_name.len() > 1
        && type_name[1..].split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTypeName(type_name.into()))
    }
}

const KEY_STRIPES: usize = 64;

/// Striped per-key writer locks: one writer per (uid, type) at a time while
/// different keys proceed in parallel.
pub(crate) struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self {
            stripes: (0..KEY_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub(crate) fn lock(&self, uid: Uid, type_name: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        uid.hash(&mut hasher);
        type_name.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_flags_map_to_vocabulary() {
        assert_eq!(StoreState::from_flags(false, false, false), StoreState::Unknown);
        assert_eq!(StoreState::from_flags(true, false, false), StoreState::Committed);
        assert_eq!(StoreState::from_flags(true, true, false), StoreState::Uncommitted);
        assert_eq!(StoreState::from_flags(true, false, true), StoreState::CommittedHidden);
        assert_eq!(StoreState::from_flags(false, true, true), StoreState::UncommittedHidden);
        assert_eq!(StoreState::from_flags(false, false, true), StoreState::Hidden);
        assert_eq!(StoreState::CommittedHidden.code(), 5);
    }

    #[test]
    fn type_names_must_be_absolute_paths() {
        assert!(validate_type_name("/Transaction/Coordinator").is_ok());
        assert!(validate_type_name("Transaction").is_err());
        assert!(validate_type_name("/").is_err());
        assert!(validate_type_name("/a//b").is_err());
        assert!(validate_type_name("/a/../b").is_err());
    }
}
