use thiserror::Error;

use crate::ids::{AllocationId, ExperimentId, RequestId, ReservationId, TrialId};
use crate::state::State;

/// Main error type for the Tuner system
#[derive(Error, Debug)]
pub enum TnError {
    #[error("Experiment error: {0}")]
    Experiment(#[from] ExperimentError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Searcher error: {0}")]
    Searcher(#[from] SearcherError),

    #[error("Resource manager error: {0}")]
    ResourceManager(#[from] RmError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors returned by experiment requests
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExperimentError {
    /// The requested transition is not allowed from the current state.
    #[error("failed precondition: experiment in state {current} cannot move to {requested}")]
    FailedPrecondition { current: State, requested: State },

    #[error("experiment not found: {0}")]
    NotFound(ExperimentId),

    #[error("no trial for request {0}")]
    UnknownRequest(RequestId),

    #[error("operation mismatch for request {request_id}: {message}")]
    OperationMismatch {
        request_id: RequestId,
        message: String,
    },

    #[error("experiment {0} is no longer running")]
    Stopped(ExperimentId),
}

/// Trial-level errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrialError {
    #[error("stale message for allocation {got}, current is {current:?}")]
    StaleAllocation {
        got: AllocationId,
        current: Option<AllocationId>,
    },

    #[error("trial {0} is no longer running")]
    Stopped(RequestId),

    #[error("trial has no allocation")]
    NoAllocation,
}

/// Allocation-level errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AllocationError {
    #[error("unknown reservation {0}")]
    UnknownReservation(ReservationId),

    #[error("allocation {0} is not preemptible")]
    NotPreemptible(AllocationId),

    #[error("allocation {0} has no resources yet")]
    NotStarted(AllocationId),

    #[error("allocation {0} has already exited")]
    Exited(AllocationId),
}

/// Persistence errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("experiment not found: {0}")]
    ExperimentNotFound(ExperimentId),

    #[error("trial not found: {0}")]
    TrialNotFound(TrialId),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("session not found for experiment {0}")]
    SessionNotFound(ExperimentId),

    #[error("snapshot save failed: {0}")]
    SnapshotFailed(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by a searcher
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearcherError {
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),

    #[error("search space has no points left")]
    Exhausted,

    #[error("searcher state could not be restored: {0}")]
    Restore(String),

    #[error("searcher failure: {0}")]
    Failed(String),
}

/// Errors returned by a resource manager
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RmError {
    /// The resource manager does not implement the request.
    #[error("unsupported by resource manager: {0}")]
    Unsupported(String),

    #[error("resource pool not found: {0}")]
    PoolNotFound(String),

    #[error("resource pool {pool} cannot fit {slots} slots")]
    InsufficientSlots { pool: String, slots: u32 },

    #[error("allocation not found: {0}")]
    AllocationNotFound(AllocationId),

    #[error("resource manager unavailable: {0}")]
    Unavailable(String),
}

/// Snapshot decoding errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SnapshotError {
    #[error("snapshot version {found} is newer than supported version {supported}")]
    TooNew { found: u32, supported: u32 },

    #[error("no shim registered to upgrade snapshot version {0}")]
    MissingShim(u32),

    #[error("malformed snapshot: {0}")]
    Malformed(String),
}

/// Result type alias for Tuner operations
pub type TnResult<T> = Result<T, TnError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::errors::TnError::Validation(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::errors::TnError::Config(format!($($arg)*))
    };
}
