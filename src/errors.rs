//! Error types for coordination and recovery
//!
//! Participant failures are not errors: they are classified into
//! [`TwoPhaseOutcome`](crate::TwoPhaseOutcome) values. The types here cover
//! protocol misuse, store I/O and unreadable logs.

use crate::{ActionStatus, StateError, StoreError, Uid};

/// Synchronous protocol-usage and store failures raised by a coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Operation needs an ACTIVE coordinator
    #[error("transaction {uid} is not active (status {status})")]
    NotActive {
        /// Transaction
        uid: Uid,
        /// Status at the time of the call
        status: ActionStatus,
    },
    /// Transaction was marked rollback-only
    #[error("transaction {0} is marked rollback-only")]
    RollbackOnly(Uid),
    /// The same resource is already enlisted
    #[error("resource {resource} already enlisted in transaction {uid}")]
    DuplicateResource {
        /// Transaction
        uid: Uid,
        /// Resource description
        resource: Box<str>,
    },
    /// Operation not legal in the current status
    #[error("cannot {operation} transaction {uid} in status {status}")]
    InvalidState {
        /// Transaction
        uid: Uid,
        /// Current status
        status: ActionStatus,
        /// Attempted operation
        operation: &'static str,
    },
    /// A transaction with this uid is already registered
    #[error("transaction {0} already exists")]
    AlreadyExists(Uid),
    /// Nested-only or top-level-only operation used on the wrong kind
    #[error("operation {operation} not supported on {kind} transaction {uid}")]
    WrongKind {
        /// Transaction
        uid: Uid,
        /// "nested" or "top-level"
        kind: &'static str,
        /// Attempted operation
        operation: &'static str,
    },
    /// Store I/O failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure while recovering a persisted transaction.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Store I/O failed
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Log entry could not be unpacked
    #[error("unreadable log for {uid}: {source}")]
    Unreadable {
        /// Transaction
        uid: Uid,
        /// Decoder error
        #[source]
        source: StateError,
    },
    /// Log entry decoded but is inconsistent
    #[error("corrupt log for {uid}: {reason}")]
    Corrupt {
        /// Transaction
        uid: Uid,
        /// Description
        reason: Box<str>,
    },
    /// No log entry exists
    #[error("no log for {uid} under {type_name}")]
    NotFound {
        /// Transaction
        uid: Uid,
        /// Store type
        type_name: Box<str>,
    },
    /// A live coordinator owns this transaction
    #[error("transaction {0} is live in this process")]
    Live(Uid),
    /// Coordinator refused the operation
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Result alias for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
