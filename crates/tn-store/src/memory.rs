use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use uuid::Uuid;

use tn_types::{
    AllocationId, Checkpoint, CheckpointState, ExperimentConfig, ExperimentId, JobId, RequestId,
    State, StateWithReason, StoreError, TaskId, TrialId,
};

use crate::rows::{
    AllocationRow, ExperimentRow, NewTrial, SnapshotRecord, TaskLog, TrialRow, TrialSnapshotWrite,
};
use crate::store::{Store, StoreResult};

/// Relational part of the store; guarded by one lock so that multi-row
/// writes such as snapshots are atomic.
#[derive(Debug, Clone, Default)]
struct Tables {
    next_experiment_id: i32,
    next_trial_id: i32,
    experiments: BTreeMap<ExperimentId, ExperimentRow>,
    trials: BTreeMap<TrialId, TrialRow>,
    allocations: BTreeMap<AllocationId, AllocationRow>,
    checkpoints: BTreeMap<Uuid, Checkpoint>,
    experiment_snapshots: BTreeMap<ExperimentId, SnapshotRecord>,
    trial_snapshots: BTreeMap<TrialId, (ExperimentId, SnapshotRecord)>,
}

/// In-memory [`Store`] for sandbox masters and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    sessions: DashMap<String, String>,
    logs: DashMap<TaskId, Vec<TaskLog>>,
    fail_snapshots: AtomicBool,
    fail_checkpoint_deletes: AtomicBool,
    failing_trial_lookups: DashMap<RequestId, ()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep copy of the current contents.
    pub fn fork(&self) -> Self {
        let sessions = DashMap::new();
        for entry in self.sessions.iter() {
            sessions.insert(entry.key().clone(), entry.value().clone());
        }
        let logs = DashMap::new();
        for entry in self.logs.iter() {
            logs.insert(entry.key().clone(), entry.value().clone());
        }
        Self {
            tables: RwLock::new(self.tables.read().clone()),
            sessions,
            logs,
            fail_snapshots: AtomicBool::new(self.fail_snapshots.load(Ordering::SeqCst)),
            fail_checkpoint_deletes: AtomicBool::new(self.fail_checkpoint_deletes.load(Ordering::SeqCst)),
            failing_trial_lookups: self.failing_trial_lookups.clone(),
        }
    }

    /// Makes every subsequent `save_snapshot` fail.
    pub fn set_snapshot_failure(&self, fail: bool) {
        self.fail_snapshots.store(fail, Ordering::SeqCst);
    }

    /// Makes `trial_by_request_id` fail for one request.
    pub fn fail_trial_lookup(&self, request_id: RequestId) {
        self.failing_trial_lookups.insert(request_id, ());
    }

    /// Makes every subsequent `mark_checkpoints_deleted` fail.
    pub fn set_checkpoint_delete_failure(&self, fail: bool) {
        self.fail_checkpoint_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn has_session(&self, owner: &str) -> bool {
        self.sessions.contains_key(owner)
    }

    pub fn trials_for_experiment(&self, id: ExperimentId) -> Vec<TrialRow> {
        self.tables
            .read()
            .trials
            .values()
            .filter(|t| t.experiment_id == id)
            .cloned()
            .collect()
    }

    fn with_trial<F>(&self, id: TrialId, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut TrialRow),
    {
        let mut tables = self.tables.write();
        let trial = tables.trials.get_mut(&id).ok_or(StoreError::TrialNotFound(id))?;
        f(trial);
        Ok(())
    }

    fn with_experiment<F>(&self, id: ExperimentId, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut ExperimentRow),
    {
        let mut tables = self.tables.write();
        let experiment = tables
            .experiments
            .get_mut(&id)
            .ok_or(StoreError::ExperimentNotFound(id))?;
        f(experiment);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_experiment(&self, config: ExperimentConfig, job_id: JobId) -> StoreResult<ExperimentRow> {
        let mut tables = self.tables.write();
        tables.next_experiment_id += 1;
        let row = ExperimentRow {
            id: ExperimentId(tables.next_experiment_id),
            job_id,
            config,
            state: State::Active,
            reason: String::new(),
            progress: 0.0,
            start_time: Utc::now(),
            end_time: None,
        };
        tables.experiments.insert(row.id, row.clone());
        Ok(row)
    }

    async fn experiment(&self, id: ExperimentId) -> StoreResult<ExperimentRow> {
        self.tables
            .read()
            .experiments
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExperimentNotFound(id))
    }

    async fn non_terminal_experiments(&self) -> StoreResult<Vec<ExperimentRow>> {
        Ok(self
            .tables
            .read()
            .experiments
            .values()
            .filter(|e| !e.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn save_experiment_state(&self, id: ExperimentId, state: &StateWithReason) -> StoreResult<()> {
        self.with_experiment(id, |e| {
            e.state = state.state;
            e.reason = state.reason.clone();
            if state.state.is_terminal() {
                e.end_time = Some(Utc::now());
            }
        })
    }

    async fn save_experiment_progress(&self, id: ExperimentId, progress: f64) -> StoreResult<()> {
        self.with_experiment(id, |e| e.progress = progress)
    }

    async fn save_experiment_config(&self, id: ExperimentId, config: &ExperimentConfig) -> StoreResult<()> {
        self.with_experiment(id, |e| e.config = config.clone())
    }

    async fn add_trial(&self, trial: NewTrial) -> StoreResult<TrialId> {
        let mut tables = self.tables.write();
        if !tables.experiments.contains_key(&trial.experiment_id) {
            return Err(StoreError::ExperimentNotFound(trial.experiment_id));
        }
        tables.next_trial_id += 1;
        let id = TrialId(tables.next_trial_id);
        tables.trials.insert(
            id,
            TrialRow {
                id,
                experiment_id: trial.experiment_id,
                request_id: trial.request_id,
                task_id: trial.task_id,
                hparams: trial.hparams,
                seed: trial.seed,
                warm_start_checkpoint: trial.warm_start_checkpoint,
                state: State::Active,
                run_id: 0,
                restarts: 0,
                start_time: Utc::now(),
                end_time: None,
            },
        );
        Ok(id)
    }

    async fn trial(&self, id: TrialId) -> StoreResult<TrialRow> {
        self.tables
            .read()
            .trials
            .get(&id)
            .cloned()
            .ok_or(StoreError::TrialNotFound(id))
    }

    async fn trial_by_request_id(
        &self,
        experiment_id: ExperimentId,
        request_id: RequestId,
    ) -> StoreResult<Option<TrialRow>> {
        if self.failing_trial_lookups.contains_key(&request_id) {
            return Err(StoreError::Backend(format!("trial lookup failed for {}", request_id)));
        }
        Ok(self
            .tables
            .read()
            .trials
            .values()
            .find(|t| t.experiment_id == experiment_id && t.request_id == request_id)
            .cloned())
    }

    async fn update_trial_state(&self, id: TrialId, state: State) -> StoreResult<()> {
        self.with_trial(id, |t| {
            t.state = state;
            if state.is_terminal() {
                t.end_time = Some(Utc::now());
            }
        })
    }

    async fn update_trial_run_id(&self, id: TrialId, run_id: u32) -> StoreResult<()> {
        self.with_trial(id, |t| t.run_id = run_id)
    }

    async fn update_trial_restarts(&self, id: TrialId, restarts: u32) -> StoreResult<()> {
        self.with_trial(id, |t| t.restarts = restarts)
    }

    async fn add_allocation(&self, allocation: AllocationRow) -> StoreResult<()> {
        self.tables
            .write()
            .allocations
            .insert(allocation.allocation_id.clone(), allocation);
        Ok(())
    }

    async fn complete_allocation(&self, id: &AllocationId, exit_reason: Option<String>) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let row = tables
            .allocations
            .get_mut(id)
            .ok_or_else(|| StoreError::Backend(format!("allocation {} not found", id)))?;
        row.end_time = Some(Utc::now());
        row.exit_reason = exit_reason;
        Ok(())
    }

    async fn allocations_for_task(&self, task_id: &TaskId) -> StoreResult<Vec<AllocationRow>> {
        Ok(self
            .tables
            .read()
            .allocations
            .values()
            .filter(|a| &a.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn save_snapshot(
        &self,
        experiment_id: ExperimentId,
        trial: Option<TrialSnapshotWrite>,
        version: u32,
        experiment_snapshot: Vec<u8>,
    ) -> StoreResult<()> {
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(StoreError::SnapshotFailed("snapshot writes disabled".into()));
        }
        let mut tables = self.tables.write();
        if !tables.experiments.contains_key(&experiment_id) {
            return Err(StoreError::ExperimentNotFound(experiment_id));
        }
        if let Some(trial) = trial {
            tables.trial_snapshots.insert(
                trial.trial_id,
                (
                    experiment_id,
                    SnapshotRecord {
                        version,
                        content: trial.content,
                    },
                ),
            );
        }
        tables.experiment_snapshots.insert(
            experiment_id,
            SnapshotRecord {
                version,
                content: experiment_snapshot,
            },
        );
        debug!(experiment_id = %experiment_id, version, "snapshot saved");
        Ok(())
    }

    async fn experiment_snapshot(&self, id: ExperimentId) -> StoreResult<Option<SnapshotRecord>> {
        Ok(self.tables.read().experiment_snapshots.get(&id).cloned())
    }

    async fn trial_snapshot(&self, id: TrialId) -> StoreResult<Option<SnapshotRecord>> {
        Ok(self
            .tables
            .read()
            .trial_snapshots
            .get(&id)
            .map(|(_, record)| record.clone()))
    }

    async fn delete_snapshots_for_experiment(&self, id: ExperimentId) -> StoreResult<()> {
        let mut tables = self.tables.write();
        tables.experiment_snapshots.remove(&id);
        tables.trial_snapshots.retain(|_, (experiment_id, _)| *experiment_id != id);
        Ok(())
    }

    async fn add_checkpoint(&self, checkpoint: Checkpoint) -> StoreResult<()> {
        self.tables
            .write()
            .checkpoints
            .insert(checkpoint.uuid, checkpoint);
        Ok(())
    }

    async fn checkpoint(&self, uuid: Uuid) -> StoreResult<Option<Checkpoint>> {
        Ok(self.tables.read().checkpoints.get(&uuid).cloned())
    }

    async fn latest_checkpoint_for_trial(&self, id: TrialId) -> StoreResult<Option<Checkpoint>> {
        Ok(self
            .tables
            .read()
            .checkpoints
            .values()
            .filter(|c| c.trial_id == id && c.state == CheckpointState::Active)
            .max_by(|a, b| {
                a.total_batches
                    .cmp(&b.total_batches)
                    .then(a.reported_at.cmp(&b.reported_at))
            })
            .cloned())
    }

    async fn experiment_checkpoints(&self, id: ExperimentId) -> StoreResult<Vec<Checkpoint>> {
        Ok(self
            .tables
            .read()
            .checkpoints
            .values()
            .filter(|c| c.experiment_id == id)
            .cloned()
            .collect())
    }

    async fn mark_checkpoints_deleted(&self, uuids: &[Uuid]) -> StoreResult<()> {
        if self.fail_checkpoint_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("checkpoint writes disabled".into()));
        }
        let mut tables = self.tables.write();
        for uuid in uuids {
            if let Some(ckpt) = tables.checkpoints.get_mut(uuid) {
                ckpt.state = CheckpointState::Deleted;
            }
        }
        Ok(())
    }

    async fn start_session(&self, owner: &str) -> StoreResult<String> {
        Ok(self
            .sessions
            .entry(owner.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone())
    }

    async fn delete_session(&self, owner: &str) -> StoreResult<()> {
        self.sessions.remove(owner);
        Ok(())
    }

    async fn add_task_logs(&self, logs: Vec<TaskLog>) -> StoreResult<()> {
        for log in logs {
            self.logs.entry(log.task_id.clone()).or_default().push(log);
        }
        Ok(())
    }

    async fn task_logs(&self, task_id: &TaskId) -> StoreResult<Vec<TaskLog>> {
        Ok(self
            .logs
            .get(task_id)
            .map(|logs| logs.clone())
            .unwrap_or_default())
    }
}
