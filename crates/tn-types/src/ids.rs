use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Persisted experiment identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(pub i32);

/// Persisted trial identifier, assigned on the trial's first allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialId(pub i32);

/// Searcher-minted identifier for a trial-to-be. Stable across master restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduling group identifier shared by every task of an experiment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Task ids are derived from the owning experiment and the request id so
    /// that a restored trial keeps the same task.
    pub fn for_trial(experiment_id: ExperimentId, request_id: RequestId) -> Self {
        Self(format!("{}.{}", experiment_id, request_id))
    }

    pub fn for_gc(experiment_id: ExperimentId) -> Self {
        Self(format!("{}.gc.{}", experiment_id, Uuid::new_v4()))
    }
}

/// Identifies one allocation attempt of a task: `<task id>.<run id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(pub String);

impl AllocationId {
    pub fn new(task_id: &TaskId, run_id: u32) -> Self {
        Self(format!("{}.{}", task_id.0, run_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(pub String);

impl ReservationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_inner!(ExperimentId, TrialId, RequestId, JobId, TaskId, AllocationId, ReservationId);
