//! Two-Phase Commit Coordinator with Durable Recovery
//!
//! An in-process transaction coordinator: participants enlist as records,
//! the coordinator drives them through prepare and commit (or a one-phase
//! commit when only one durable participant is involved), keeps an
//! intentions log in an object store, and a recovery manager replays
//! whatever a crash left behind.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // 1. Build a process context over a store
//! let ctx = ProcessContext::new(
//!     TransactionConfig::default(),
//!     Arc::new(InMemoryObjectStore::new()),
//!     Arc::new(TracingObserver),
//! );
//!
//! // 2. Begin, enlist work, commit
//! let tx = ctx.begin()?;
//! tx.write_object(account, "/Objects/Account", before, after)?;
//! tx.enlist_resource(database)?;
//! let outcome = tx.commit(true)?;
//!
//! // 3. Run the background services
//! let reaper = ctx.reaper().spawn();
//! let recovery = ctx.recovery_manager().spawn();
//! ```

#![warn(missing_docs)]

// === Core Types ===
mod errors;
mod object_state;
mod status;
mod uid;

// === Configuration ===
mod config;

// === Storage ===
mod store;

// === Protocol ===
mod coordinator;
pub mod record;
mod registry;

// === Concurrency Control ===
mod lock;

// === Process Services ===
mod background;
mod context;
mod reaper;
mod recovery;
mod status_query;

// === Observability ===
mod observer;
mod stats;

// === Test Harness ===
#[cfg(any(test, feature = "test-harness"))]
pub mod testing;

// === Re-exports ===

// Types
pub use object_state::{InputObjectState, OutputObjectState, StateError};
pub use status::{ActionStatus, ReplayDirection, TwoPhaseOutcome};
pub use uid::{ActionHierarchy, ActionKind, ParseUidError, Uid, UidGenerator};

// Errors
pub use errors::{CoordinatorError, RecoveryError, Result};

// Configuration
pub use config::{
    RecoveryConfig, RetryPolicy, TransactionConfig, COORDINATOR_TYPE, SUBORDINATE_TYPE,
};

// Storage
#[cfg(feature = "lmdb")]
pub use store::LmdbObjectStore;
pub use store::{
    validate_type_name, FileObjectStore, InMemoryObjectStore, ObjectStore, StoreError, StoreState,
};

// Protocol
pub use coordinator::{Coordinator, RecordCounts};
pub use record::{
    ObjectImage, ParticipantRecord, RecordKind, ResourceDirectory, XaError, XaResource, XaVote,
    Xid,
};
pub use registry::TransactionRegistry;

// Locking
pub use lock::{Lock, LockManager, LockMode, LockResult, LockStatus};

// Process services
pub use context::{ProcessContext, TransactionScope};
pub use reaper::{Reaper, ReaperHandle};
pub use recovery::{RecoveryHandle, RecoveryManager, ReplayResult, ScanReport};
pub use status_query::{
    ProtocolError, StatusClient, StatusServer, StatusServerHandle, TransactionStatusResolver,
};

// Observability
pub use observer::{NoOpObserver, TracingObserver, TransactionObserver};
pub use stats::{TransactionStats, TransactionStatsSnapshot};
