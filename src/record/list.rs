//! Ordered record list with duplicate-resource resolution

use super::ParticipantRecord;

/// How [`RecordList::insert`] handled a record
#[derive(Debug)]
pub enum InsertOutcome {
    /// Appended as a new entry
    Added,
    /// Folded into an existing record for the same resource
    Merged,
    /// Took the place of an existing record for the same resource
    Replaced,
    /// Refused; the record is handed back
    Rejected(ParticipantRecord),
}

impl InsertOutcome {
    /// Did the list take ownership of the record?
    pub fn accepted(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Records in enlistment order
#[derive(Debug, Default)]
pub struct RecordList {
    records: Vec<ParticipantRecord>,
}

impl RecordList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `incoming`, resolving conflicts with records for the same
    /// resource. Replacement wins over merge, merge over add; if every
    /// existing record for the resource accepts a sibling the record is
    /// appended, otherwise it is rejected.
    pub fn insert(&mut self, incoming: ParticipantRecord) -> InsertOutcome {
        let key = incoming.resource_key();
        let mut addable = true;
        let mut target = None;
        for (index, existing) in self.records.iter().enumerate() {
            if existing.resource_key() != key {
                continue;
            }
            if existing.should_replace(&incoming) {
                target = Some((index, true));
                break;
            }
            if existing.should_merge(&incoming) {
                target = Some((index, false));
                break;
            }
            addable &= existing.should_add(&incoming);
        }
        match target {
            Some((index, true)) => {
                self.records[index] = incoming;
                InsertOutcome::Replaced
            }
            Some((index, false)) => {
                self.records[index].merge(incoming);
                InsertOutcome::Merged
            }
            None if addable => {
                self.records.push(incoming);
                InsertOutcome::Added
            }
            None => InsertOutcome::Rejected(incoming),
        }
    }

    /// Append without conflict resolution (log restore)
    pub fn push(&mut self, record: ParticipantRecord) {
        self.records.push(record);
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// No records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in order
    pub fn iter(&self) -> impl Iterator<Item = &ParticipantRecord> {
        self.records.iter()
    }

    /// Mutable records in order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ParticipantRecord> {
        self.records.iter_mut()
    }

    /// Take every record out, leaving the list empty
    pub fn take_all(&mut self) -> Vec<ParticipantRecord> {
        std::mem::take(&mut self.records)
    }

    /// Any record that must be logged?
    pub fn any_durable(&self) -> bool {
        self.records.iter().any(ParticipantRecord::do_save)
    }
}

impl From<Vec<ParticipantRecord>> for RecordList {
    fn from(records: Vec<ParticipantRecord>) -> Self {
        Self { records }
    }
}

impl IntoIterator for RecordList {
    type Item = ParticipantRecord;
    type IntoIter = std::vec::IntoIter<ParticipantRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}
