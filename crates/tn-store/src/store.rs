use async_trait::async_trait;
use uuid::Uuid;

use tn_types::{
    AllocationId, Checkpoint, ExperimentConfig, ExperimentId, JobId, RequestId, State,
    StateWithReason, StoreError, TaskId, TrialId,
};

use crate::rows::{
    AllocationRow, ExperimentRow, NewTrial, SnapshotRecord, TaskLog, TrialRow, TrialSnapshotWrite,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable state shared by every experiment and trial actor.
///
/// Implementations must be safe for concurrent use.
#[async_trait]
pub trait Store: Send + Sync {
    // Experiments
    async fn add_experiment(&self, config: ExperimentConfig, job_id: JobId) -> StoreResult<ExperimentRow>;
    async fn experiment(&self, id: ExperimentId) -> StoreResult<ExperimentRow>;
    async fn non_terminal_experiments(&self) -> StoreResult<Vec<ExperimentRow>>;
    async fn save_experiment_state(&self, id: ExperimentId, state: &StateWithReason) -> StoreResult<()>;
    async fn save_experiment_progress(&self, id: ExperimentId, progress: f64) -> StoreResult<()>;
    async fn save_experiment_config(&self, id: ExperimentId, config: &ExperimentConfig) -> StoreResult<()>;

    // Trials
    async fn add_trial(&self, trial: NewTrial) -> StoreResult<TrialId>;
    async fn trial(&self, id: TrialId) -> StoreResult<TrialRow>;
    async fn trial_by_request_id(
        &self,
        experiment_id: ExperimentId,
        request_id: RequestId,
    ) -> StoreResult<Option<TrialRow>>;
    async fn update_trial_state(&self, id: TrialId, state: State) -> StoreResult<()>;
    async fn update_trial_run_id(&self, id: TrialId, run_id: u32) -> StoreResult<()>;
    async fn update_trial_restarts(&self, id: TrialId, restarts: u32) -> StoreResult<()>;

    // Allocations
    async fn add_allocation(&self, allocation: AllocationRow) -> StoreResult<()>;
    async fn complete_allocation(&self, id: &AllocationId, exit_reason: Option<String>) -> StoreResult<()>;
    async fn allocations_for_task(&self, task_id: &TaskId) -> StoreResult<Vec<AllocationRow>>;

    // Snapshots
    /// Writes the experiment snapshot and, if given, the trial snapshot as one
    /// atomic step.
    async fn save_snapshot(
        &self,
        experiment_id: ExperimentId,
        trial: Option<TrialSnapshotWrite>,
        version: u32,
        experiment_snapshot: Vec<u8>,
    ) -> StoreResult<()>;
    async fn experiment_snapshot(&self, id: ExperimentId) -> StoreResult<Option<SnapshotRecord>>;
    async fn trial_snapshot(&self, id: TrialId) -> StoreResult<Option<SnapshotRecord>>;
    async fn delete_snapshots_for_experiment(&self, id: ExperimentId) -> StoreResult<()>;

    // Checkpoints
    async fn add_checkpoint(&self, checkpoint: Checkpoint) -> StoreResult<()>;
    async fn checkpoint(&self, uuid: Uuid) -> StoreResult<Option<Checkpoint>>;
    async fn latest_checkpoint_for_trial(&self, id: TrialId) -> StoreResult<Option<Checkpoint>>;
    async fn experiment_checkpoints(&self, id: ExperimentId) -> StoreResult<Vec<Checkpoint>>;
    async fn mark_checkpoints_deleted(&self, uuids: &[Uuid]) -> StoreResult<()>;

    // Sessions
    /// Issues a session token for `owner`, reusing an existing one.
    async fn start_session(&self, owner: &str) -> StoreResult<String>;
    async fn delete_session(&self, owner: &str) -> StoreResult<()>;

    // Task logs
    async fn add_task_logs(&self, logs: Vec<TaskLog>) -> StoreResult<()>;
    async fn task_logs(&self, task_id: &TaskId) -> StoreResult<Vec<TaskLog>>;
}
