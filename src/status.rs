//! Transaction status and two-phase outcome vocabularies

use serde::{Deserialize, Serialize};

/// Status of a coordinator, as reported to callers and status queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionStatus {
    /// Running, accepting enlistments
    Active,
    /// Prepare round in progress
    Preparing,
    /// Rollback in progress
    Aborting,
    /// Marked so that the only legal outcome is rollback
    MarkedRollback,
    /// Rolled back
    Aborted,
    /// Every participant voted to commit; decision logged
    Prepared,
    /// Phase-two commit in progress
    Committing,
    /// Committed
    Committed,
    /// Unknown or unreadable
    Invalid,
    /// Some participant rolled back on its own
    HeuristicRollback,
    /// Some participant committed on its own
    HeuristicCommit,
    /// Participants decided differently
    HeuristicMixed,
    /// Participant outcome could not be determined
    HeuristicHazard,
    /// No transaction known
    NoTransaction,
}

impl ActionStatus {
    /// Integer code used on the status-query wire
    pub fn code(&self) -> i32 {
        match self {
            Self::Active => 0,
            Self::Preparing => 1,
            Self::Aborting => 2,
            Self::MarkedRollback => 3,
            Self::Aborted => 4,
            Self::Prepared => 5,
            Self::Committing => 6,
            Self::Committed => 7,
            Self::Invalid => 9,
            Self::HeuristicRollback => 11,
            Self::HeuristicCommit => 12,
            Self::HeuristicMixed => 13,
            Self::HeuristicHazard => 14,
            Self::NoTransaction => 16,
        }
    }

    /// Inverse of [`ActionStatus::code`]; unknown codes map to `Invalid`
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Active,
            1 => Self::Preparing,
            2 => Self::Aborting,
            3 => Self::MarkedRollback,
            4 => Self::Aborted,
            5 => Self::Prepared,
            6 => Self::Committing,
            7 => Self::Committed,
            11 => Self::HeuristicRollback,
            12 => Self::HeuristicCommit,
            13 => Self::HeuristicMixed,
            14 => Self::HeuristicHazard,
            16 => Self::NoTransaction,
            _ => Self::Invalid,
        }
    }

    /// No further protocol work will happen for this status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Committed
                | Self::Aborted
                | Self::HeuristicRollback
                | Self::HeuristicCommit
                | Self::HeuristicMixed
                | Self::HeuristicHazard
        )
    }

    /// Heuristic statuses need an explicit forget
    pub fn is_heuristic(&self) -> bool {
        matches!(
            self,
            Self::HeuristicRollback
                | Self::HeuristicCommit
                | Self::HeuristicMixed
                | Self::HeuristicHazard
        )
    }

    /// Which phase-two direction recovery replays for a persisted status
    pub fn replay_direction(&self) -> Option<ReplayDirection> {
        match self {
            Self::Prepared | Self::Committing | Self::Committed => Some(ReplayDirection::Commit),
            Self::Aborting | Self::Aborted | Self::MarkedRollback => Some(ReplayDirection::Abort),
            _ => None,
        }
    }

    pub(crate) fn from_heuristic(outcome: TwoPhaseOutcome) -> Option<Self> {
        match outcome {
            TwoPhaseOutcome::HeuristicRollback => Some(Self::HeuristicRollback),
            TwoPhaseOutcome::HeuristicCommit => Some(Self::HeuristicCommit),
            TwoPhaseOutcome::HeuristicMixed => Some(Self::HeuristicMixed),
            TwoPhaseOutcome::HeuristicHazard => Some(Self::HeuristicHazard),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Active => "ACTIVE",
            Self::Preparing => "PREPARING",
            Self::Aborting => "ABORTING",
            Self::MarkedRollback => "MARKED_ROLLBACK",
            Self::Aborted => "ABORTED",
            Self::Prepared => "PREPARED",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::Invalid => "INVALID",
            Self::HeuristicRollback => "HEURISTIC_ROLLBACK",
            Self::HeuristicCommit => "HEURISTIC_COMMIT",
            Self::HeuristicMixed => "HEURISTIC_MIXED",
            Self::HeuristicHazard => "HEURISTIC_HAZARD",
            Self::NoTransaction => "NO_TRANSACTION",
        };
        f.write_str(name)
    }
}

/// Direction of a phase-two replay
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayDirection {
    /// Drive commit on every remaining record
    Commit,
    /// Drive abort on every remaining record
    Abort,
}

/// Result of a single participant operation or of a whole phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TwoPhaseOutcome {
    /// Participant promises to commit
    PrepareOk,
    /// Participant has nothing to commit
    PrepareReadOnly,
    /// Participant refuses; the transaction must roll back
    PrepareNotOk,
    /// Phase-two operation done
    FinishOk,
    /// Phase-two operation failed; retry later
    FinishError,
    /// Participant rolled back on its own
    HeuristicRollback,
    /// Participant committed on its own
    HeuristicCommit,
    /// Participant partly committed and partly rolled back
    HeuristicMixed,
    /// Participant state unknown
    HeuristicHazard,
    /// One-phase commit rolled back instead
    OnePhaseError,
}

impl TwoPhaseOutcome {
    /// Is this one of the four heuristic values?
    pub fn is_heuristic(&self) -> bool {
        matches!(
            self,
            Self::HeuristicRollback
                | Self::HeuristicCommit
                | Self::HeuristicMixed
                | Self::HeuristicHazard
        )
    }

    /// Numeric code used in persisted logs
    pub fn code(&self) -> u8 {
        match self {
            Self::PrepareOk => 0,
            Self::PrepareNotOk => 1,
            Self::PrepareReadOnly => 2,
            Self::HeuristicRollback => 3,
            Self::HeuristicCommit => 4,
            Self::HeuristicMixed => 5,
            Self::HeuristicHazard => 6,
            Self::FinishOk => 7,
            Self::FinishError => 8,
            Self::OnePhaseError => 10,
        }
    }

    /// Inverse of [`TwoPhaseOutcome::code`]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::PrepareOk,
            1 => Self::PrepareNotOk,
            2 => Self::PrepareReadOnly,
            3 => Self::HeuristicRollback,
            4 => Self::HeuristicCommit,
            5 => Self::HeuristicMixed,
            6 => Self::HeuristicHazard,
            7 => Self::FinishOk,
            8 => Self::FinishError,
            10 => Self::OnePhaseError,
            _ => return None,
        })
    }

    fn severity(&self) -> u8 {
        match self {
            Self::HeuristicHazard => 4,
            Self::HeuristicMixed => 3,
            Self::HeuristicRollback | Self::HeuristicCommit => 2,
            _ => 0,
        }
    }

    /// Fold another participant's phase-two result into an aggregate.
    ///
    /// HAZARD > MIXED > one-sided heuristic > FINISH_OK; one-sided heuristics
    /// in both directions become MIXED. Non-heuristic values leave the
    /// aggregate unchanged.
    pub fn aggregate(self, other: TwoPhaseOutcome) -> TwoPhaseOutcome {
        if !other.is_heuristic() {
            return self;
        }
        if !self.is_heuristic() {
            return other;
        }
        match (self, other) {
            (Self::HeuristicCommit, Self::HeuristicRollback)
            | (Self::HeuristicRollback, Self::HeuristicCommit) => Self::HeuristicMixed,
            _ if other.severity() > self.severity() => other,
            _ => self,
        }
    }
}

impl std::fmt::Display for TwoPhaseOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PrepareOk => "PREPARE_OK",
            Self::PrepareReadOnly => "PREPARE_READONLY",
            Self::PrepareNotOk => "PREPARE_NOTOK",
            Self::FinishOk => "FINISH_OK",
            Self::FinishError => "FINISH_ERROR",
            Self::HeuristicRollback => "HEURISTIC_ROLLBACK",
            Self::HeuristicCommit => "HEURISTIC_COMMIT",
            Self::HeuristicMixed => "HEURISTIC_MIXED",
            Self::HeuristicHazard => "HEURISTIC_HAZARD",
            Self::OnePhaseError => "ONE_PHASE_ERROR",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TwoPhaseOutcome::*;

    #[test]
    fn opposite_one_sided_heuristics_become_mixed() {
        assert_eq!(HeuristicCommit.aggregate(HeuristicRollback), HeuristicMixed);
        assert_eq!(HeuristicRollback.aggregate(HeuristicCommit), HeuristicMixed);
        assert_eq!(FinishOk.aggregate(HeuristicCommit).aggregate(HeuristicRollback), HeuristicMixed);
    }

    #[test]
    fn hazard_beats_everything() {
        assert_eq!(HeuristicMixed.aggregate(HeuristicHazard), HeuristicHazard);
        assert_eq!(HeuristicHazard.aggregate(HeuristicMixed), HeuristicHazard);
        assert_eq!(HeuristicHazard.aggregate(HeuristicCommit), HeuristicHazard);
        assert_eq!(HeuristicCommit.aggregate(HeuristicMixed), HeuristicMixed);
    }

    #[test]
    fn ok_results_do_not_change_aggregate() {
        assert_eq!(FinishOk.aggregate(FinishOk), FinishOk);
        assert_eq!(HeuristicCommit.aggregate(FinishOk), HeuristicCommit);
        assert_eq!(HeuristicCommit.aggregate(HeuristicCommit), HeuristicCommit);
    }

    #[test]
    fn status_codes_round_trip() {
        for status in [
            ActionStatus::Active,
            ActionStatus::Prepared,
            ActionStatus::Committed,
            ActionStatus::Aborted,
            ActionStatus::HeuristicMixed,
            ActionStatus::NoTransaction,
        ] {
            assert_eq!(ActionStatus::from_code(status.code()), status);
        }
        assert_eq!(ActionStatus::from_code(42), ActionStatus::Invalid);
    }

    #[test]
    fn replay_direction_follows_persisted_status() {
        assert_eq!(ActionStatus::Prepared.replay_direction(), Some(ReplayDirection::Commit));
        assert_eq!(ActionStatus::Committing.replay_direction(), Some(ReplayDirection::Commit));
        assert_eq!(ActionStatus::MarkedRollback.replay_direction(), Some(ReplayDirection::Abort));
        assert_eq!(ActionStatus::Aborting.replay_direction(), Some(ReplayDirection::Abort));
        assert_eq!(ActionStatus::Active.replay_direction(), None);
        assert_eq!(ActionStatus::HeuristicMixed.replay_direction(), None);
    }
}
