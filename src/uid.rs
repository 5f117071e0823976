//! Transaction identity and nesting ancestry

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Globally unique identifier for transactions, records and stored objects.
///
/// Built from the node, the process, the process start epoch and a per-process
/// counter, so two live processes never hand out the same value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid {
    node: u64,
    process: u32,
    epoch: u32,
    counter: u32,
}

impl Uid {
    /// The null identifier
    pub const NIL: Uid = Uid {
        node: 0,
        process: 0,
        epoch: 0,
        counter: 0,
    };

    /// Build a uid from its raw parts
    pub const fn from_parts(node: u64, process: u32, epoch: u32, counter: u32) -> Self {
        Self {
            node,
            process,
            epoch,
            counter,
        }
    }

    /// Is this the null identifier?
    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    /// Node component
    pub fn node(&self) -> u64 {
        self.node
    }

    /// Process component
    pub fn process(&self) -> u32 {
        self.process
    }

    /// Process start epoch (seconds)
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Per-process sequence number
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Fixed-width binary form (20 bytes, big-endian)
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out[..8].copy_from_slice(&self.node.to_be_bytes());
        out[8..12].copy_from_slice(&self.process.to_be_bytes());
        out[12..16].copy_from_slice(&self.epoch.to_be_bytes());
        out[16..].copy_from_slice(&self.counter.to_be_bytes());
        out
    }

    /// Inverse of [`Uid::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 20 {
            return None;
        }
        let mut node = [0u8; 8];
        let mut process = [0u8; 4];
        let mut epoch = [0u8; 4];
        let mut counter = [0u8; 4];
        node.copy_from_slice(&bytes[..8]);
        process.copy_from_slice(&bytes[8..12]);
        epoch.copy_from_slice(&bytes[12..16]);
        counter.copy_from_slice(&bytes[16..]);
        Some(Self {
            node: u64::from_be_bytes(node),
            process: u32::from_be_bytes(process),
            epoch: u32::from_be_bytes(epoch),
            counter: u32::from_be_bytes(counter),
        })
    }
}

impl std::fmt::Debug for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Uid({})", self)
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:x}:{:x}:{:x}:{:x}",
            self.node, self.process, self.epoch, self.counter
        )
    }
}

/// Error parsing the textual uid form
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed uid: {0}")]
pub struct ParseUidError(pub Box<str>);

impl std::str::FromStr for Uid {
    type Err = ParseUidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseUidError(s.into());
        let mut parts = s.trim().split(':');
        let node = parts
            .next()
            .and_then(|p| u64::from_str_radix(p, 16).ok())
            .ok_or_else(bad)?;
        let mut next_u32 = || {
            parts
                .next()
                .and_then(|p| u32::from_str_radix(p, 16).ok())
        };
        let process = next_u32().ok_or_else(bad)?;
        let epoch = next_u32().ok_or_else(bad)?;
        let counter = next_u32().ok_or_else(bad)?;
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Self {
            node,
            process,
            epoch,
            counter,
        })
    }
}

/// Hands out uids for one process.
///
/// Owned by the process context; there is no ambient generator. When the
/// 32-bit counter wraps the carry moves into the epoch, and counter zero is
/// never handed out because it names the process.
pub struct UidGenerator {
    node: u64,
    process: u32,
    epoch: u32,
    sequence: AtomicU64,
}

impl UidGenerator {
    /// Generator for the current OS process on `node`
    pub fn new(node: u64) -> Self {
        let epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Self::with_parts(node, std::process::id(), epoch)
    }

    /// Generator with explicit process identity
    pub fn with_parts(node: u64, process: u32, epoch: u32) -> Self {
        Self {
            node,
            process,
            epoch,
            sequence: AtomicU64::new(1),
        }
    }

    /// Next unique identifier
    pub fn next_uid(&self) -> Uid {
        loop {
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            let counter = sequence as u32;
            if counter == 0 {
                continue;
            }
            let epoch = self.epoch.wrapping_add((sequence >> 32) as u32);
            return Uid::from_parts(self.node, self.process, epoch, counter);
        }
    }

    /// Identifier of the process itself (counter zero)
    pub fn process_uid(&self) -> Uid {
        Uid::from_parts(self.node, self.process, self.epoch, 0)
    }
}

/// Kind of scope an entry in the hierarchy represents
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// Outermost transaction
    TopLevel,
    /// Subtransaction
    Nested,
}

/// Chain of transaction identifiers from the root scope to the current one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ActionHierarchy {
    entries: Vec<(Uid, ActionKind)>,
}

impl ActionHierarchy {
    /// Hierarchy with a single top-level scope
    pub fn top_level(uid: Uid) -> Self {
        Self {
            entries: vec![(uid, ActionKind::TopLevel)],
        }
    }

    /// Hierarchy for a nested scope under `self`
    pub fn nested(&self, uid: Uid) -> Self {
        let mut entries = self.entries.clone();
        entries.push((uid, ActionKind::Nested));
        Self { entries }
    }

    /// Number of scopes
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// No scopes at all
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current (deepest) scope
    pub fn deepest(&self) -> Option<Uid> {
        self.entries.last().map(|(uid, _)| *uid)
    }

    /// Top-level scope
    pub fn root(&self) -> Option<Uid> {
        self.entries.first().map(|(uid, _)| *uid)
    }

    /// Parent of the current scope
    pub fn parent(&self) -> Option<Uid> {
        let len = self.entries.len();
        if len < 2 {
            return None;
        }
        Some(self.entries[len - 2].0)
    }

    /// Does any scope in the chain carry `uid`?
    pub fn contains(&self, uid: Uid) -> bool {
        self.entries.iter().any(|(u, _)| *u == uid)
    }

    /// Is `self` a prefix of `other` (same scope or an ancestor)?
    pub fn is_ancestor_of(&self, other: &ActionHierarchy) -> bool {
        !self.entries.is_empty()
            && self.entries.len() <= other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|(a, b)| a.0 == b.0)
    }

    /// Drop the current scope, returning it
    pub fn pop(&mut self) -> Option<Uid> {
        self.entries.pop().map(|(uid, _)| uid)
    }

    /// Iterate from root to deepest
    pub fn iter(&self) -> impl Iterator<Item = (Uid, ActionKind)> + '_ {
        self.entries.iter().copied()
    }

    pub(crate) fn push(&mut self, uid: Uid, kind: ActionKind) {
        self.entries.push((uid, kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_text_form_parses_back() {
        let gen = UidGenerator::with_parts(0x7f000001, 0x1a2b, 0x65000000);
        let uid = gen.next_uid();
        let text = uid.to_string();
        assert_eq!(text, "7f000001:1a2b:65000000:1");
        assert_eq!(text.parse::<Uid>().unwrap(), uid);
        assert!("7f:1:2".parse::<Uid>().is_err());
        assert!("7f:1:2:3:4".parse::<Uid>().is_err());
        assert!("zz:1:2:3".parse::<Uid>().is_err());
    }

    #[test]
    fn generated_uids_are_distinct_and_not_nil() {
        let gen = UidGenerator::new(1);
        let a = gen.next_uid();
        let b = gen.next_uid();
        assert_ne!(a, b);
        assert!(!a.is_nil());
        assert!(Uid::NIL.is_nil());
        assert_eq!(gen.process_uid().counter(), 0);
    }

    #[test]
    fn counter_wrap_moves_to_next_epoch_and_skips_zero() {
        let gen = UidGenerator::with_parts(1, 2, 3);
        gen.sequence.store(u64::from(u32::MAX), Ordering::Relaxed);
        let last = gen.next_uid();
        assert_eq!((last.epoch(), last.counter()), (3, u32::MAX));
        let wrapped = gen.next_uid();
        assert_eq!((wrapped.epoch(), wrapped.counter()), (4, 1));
        assert_ne!(wrapped, gen.process_uid());
    }

    #[test]
    fn hierarchy_tracks_nesting() {
        let gen = UidGenerator::with_parts(1, 2, 3);
        let top = gen.next_uid();
        let child = gen.next_uid();
        let outer = ActionHierarchy::top_level(top);
        let inner = outer.nested(child);

        assert_eq!(inner.depth(), 2);
        assert_eq!(inner.deepest(), Some(child));
        assert_eq!(inner.root(), Some(top));
        assert_eq!(inner.parent(), Some(top));
        assert!(outer.is_ancestor_of(&inner));
        assert!(!inner.is_ancestor_of(&outer));

        let mut popped = inner.clone();
        assert_eq!(popped.pop(), Some(child));
        assert_eq!(popped, outer);
    }

    #[test]
    fn uid_bytes_round_trip() {
        let uid = Uid::from_parts(9, 8, 7, 6);
        assert_eq!(Uid::from_bytes(&uid.to_bytes()), Some(uid));
        assert_eq!(Uid::from_bytes(&[0u8; 3]), None);
    }
}
