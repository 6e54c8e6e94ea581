use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tn_types::{
    AllocationId, ExperimentConfig, ExperimentId, HParams, JobId, RequestId, State, TaskId, TrialId,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRow {
    pub id: ExperimentId,
    pub job_id: JobId,
    pub config: ExperimentConfig,
    pub state: State,
    /// Why the experiment entered its current state.
    pub reason: String,
    pub progress: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// A trial that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrial {
    pub experiment_id: ExperimentId,
    pub request_id: RequestId,
    pub task_id: TaskId,
    pub hparams: HParams,
    pub seed: u32,
    pub warm_start_checkpoint: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRow {
    pub id: TrialId,
    pub experiment_id: ExperimentId,
    pub request_id: RequestId,
    pub task_id: TaskId,
    pub hparams: HParams,
    pub seed: u32,
    pub warm_start_checkpoint: Option<Uuid>,
    pub state: State,
    pub run_id: u32,
    pub restarts: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRow {
    pub allocation_id: AllocationId,
    pub task_id: TaskId,
    pub slots: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
}

impl AllocationRow {
    pub fn new(allocation_id: AllocationId, task_id: TaskId, slots: u32) -> Self {
        Self {
            allocation_id,
            task_id,
            slots,
            start_time: Utc::now(),
            end_time: None,
            exit_reason: None,
        }
    }
}

/// One line of operator-visible task output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    pub task_id: TaskId,
    pub allocation_id: Option<AllocationId>,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl TaskLog {
    pub fn new(task_id: TaskId, allocation_id: Option<AllocationId>, message: impl Into<String>) -> Self {
        Self {
            task_id,
            allocation_id,
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub version: u32,
    pub content: Vec<u8>,
}

/// The trial half of an atomic snapshot write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialSnapshotWrite {
    pub trial_id: TrialId,
    pub request_id: RequestId,
    pub content: Vec<u8>,
}
