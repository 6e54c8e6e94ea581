//! Experiment actor: drives the searcher and owns the experiment's trials.
//!
//! Every searcher-visible event is applied and snapshotted before the next
//! message is taken from the mailbox, so the durable snapshot always matches
//! the searcher state that produced it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tn_searcher::{Searcher, SearcherResult};
use tn_store::{Store, TrialSnapshotWrite};
use tn_types::{
    checkpoints_to_gc, CheckpointStorageConfig, Create, ExitedReason, ExperimentConfig, ExperimentError,
    ExperimentId, ExperimentSnapshot, JobId, Operation, RequestId, RmError, State, StateWithReason,
    StoreError, TnError, TrialId, TrialSearcherState, TrialSnapshot, ValidateAfter, SNAPSHOT_VERSION,
};

use crate::checkpoint_gc::{spawn_checkpoint_gc, GcRequest};
use crate::restore::{RestorePlan, TrialRestore};
use crate::rm::RmResult;
use crate::trial::{spawn_trial, RestoredTrial, TrialHandle, TrialInit};
use crate::MasterContext;

type Reply<T = ()> = oneshot::Sender<Result<T, TnError>>;

#[derive(Debug)]
pub enum ExperimentMsg {
    // User requests
    PatchState {
        state: State,
        reply: Reply,
    },
    SetWeight {
        weight: f64,
        reply: Reply,
    },
    SetPriority {
        priority: u32,
        reply: Reply,
    },
    SetMaxSlots {
        max_slots: Option<u32>,
        reply: Reply,
    },
    PatchCheckpointStorage {
        storage: CheckpointStorageConfig,
        reply: Reply,
    },

    // From trials and their runners
    TrialCreated {
        request_id: RequestId,
        trial_id: TrialId,
        snapshot: TrialSnapshot,
    },
    TrialCompleteOperation {
        request_id: RequestId,
        op: ValidateAfter,
        metric: f64,
        reply: Reply,
    },
    TrialReportEarlyExit {
        request_id: RequestId,
        reason: ExitedReason,
        snapshot: Option<(TrialId, TrialSnapshot)>,
    },
    TrialReportProgress {
        request_id: RequestId,
        progress: f64,
    },
    TrialExited {
        request_id: RequestId,
        state: State,
    },

    // Queries
    Trial {
        request_id: RequestId,
        reply: oneshot::Sender<Option<TrialHandle>>,
    },
    Describe {
        reply: oneshot::Sender<ExperimentSummary>,
    },
}

/// Point-in-time view of an experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentSummary {
    pub id: ExperimentId,
    pub state: StateWithReason,
    pub progress: f64,
    pub trial_searcher_state: BTreeMap<RequestId, TrialSearcherState>,
    pub live_trials: BTreeSet<RequestId>,
    pub fault_tolerant: bool,
}

/// Address of a running experiment actor.
#[derive(Debug, Clone)]
pub struct ExperimentHandle {
    id: ExperimentId,
    tx: mpsc::UnboundedSender<ExperimentMsg>,
    state: watch::Receiver<StateWithReason>,
}

impl ExperimentHandle {
    pub fn id(&self) -> ExperimentId {
        self.id
    }

    /// Last published state.
    pub fn state(&self) -> StateWithReason {
        self.state.borrow().clone()
    }

    /// Resolves once the experiment reaches a terminal state or its actor exits.
    pub async fn wait_terminal(&self) -> StateWithReason {
        let mut rx = self.state.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if current.state.is_terminal() {
                return current;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    fn stopped(&self) -> TnError {
        ExperimentError::Stopped(self.id).into()
    }

    async fn ask<T>(&self, msg: ExperimentMsg, rx: oneshot::Receiver<T>) -> Result<T, TnError> {
        self.tx.send(msg).map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }

    async fn request(&self, build: impl FnOnce(Reply) -> ExperimentMsg) -> Result<(), TnError> {
        let (reply, rx) = oneshot::channel();
        self.ask(build(reply), rx).await?
    }

    async fn patch_state(&self, state: State) -> Result<(), TnError> {
        self.request(|reply| ExperimentMsg::PatchState { state, reply }).await
    }

    pub async fn activate(&self) -> Result<(), TnError> {
        self.patch_state(State::Active).await
    }

    pub async fn pause(&self) -> Result<(), TnError> {
        self.patch_state(State::Paused).await
    }

    pub async fn cancel(&self) -> Result<(), TnError> {
        self.patch_state(State::StoppingCanceled).await
    }

    pub async fn kill(&self) -> Result<(), TnError> {
        self.patch_state(State::StoppingKilled).await
    }

    pub async fn set_weight(&self, weight: f64) -> Result<(), TnError> {
        self.request(|reply| ExperimentMsg::SetWeight { weight, reply }).await
    }

    pub async fn set_priority(&self, priority: u32) -> Result<(), TnError> {
        self.request(|reply| ExperimentMsg::SetPriority { priority, reply }).await
    }

    pub async fn set_max_slots(&self, max_slots: Option<u32>) -> Result<(), TnError> {
        self.request(|reply| ExperimentMsg::SetMaxSlots { max_slots, reply }).await
    }

    /// Changes the checkpoint retention policy, collecting anything it no
    /// longer keeps.
    pub async fn patch_checkpoint_storage(&self, storage: CheckpointStorageConfig) -> Result<(), TnError> {
        self.request(|reply| ExperimentMsg::PatchCheckpointStorage { storage, reply })
            .await
    }

    /// A runner finished `op` for a trial and measured `metric`.
    pub async fn complete_trial_operation(
        &self,
        request_id: RequestId,
        op: ValidateAfter,
        metric: f64,
    ) -> Result<(), TnError> {
        self.request(|reply| ExperimentMsg::TrialCompleteOperation {
            request_id,
            op,
            metric,
            reply,
        })
        .await
    }

    /// A runner decided to stop its trial early.
    pub fn report_trial_early_exit(&self, request_id: RequestId, reason: ExitedReason) -> Result<(), TnError> {
        self.tx
            .send(ExperimentMsg::TrialReportEarlyExit {
                request_id,
                reason,
                snapshot: None,
            })
            .map_err(|_| self.stopped())
    }

    pub fn report_trial_progress(&self, request_id: RequestId, progress: f64) -> Result<(), TnError> {
        self.tx
            .send(ExperimentMsg::TrialReportProgress { request_id, progress })
            .map_err(|_| self.stopped())
    }

    pub async fn trial(&self, request_id: RequestId) -> Result<Option<TrialHandle>, TnError> {
        let (reply, rx) = oneshot::channel();
        self.ask(ExperimentMsg::Trial { request_id, reply }, rx).await
    }

    pub async fn describe(&self) -> Result<ExperimentSummary, TnError> {
        let (reply, rx) = oneshot::channel();
        self.ask(ExperimentMsg::Describe { reply }, rx).await
    }
}

/// How an experiment actor begins.
pub(crate) enum ExperimentStart {
    /// Ask the searcher for its initial operations.
    Fresh,
    /// Resume from a durable snapshot.
    Restored(RestorePlan),
}

/// Identity and settings an experiment actor is started with.
pub(crate) struct ExperimentInit {
    pub id: ExperimentId,
    pub job_id: JobId,
    pub config: ExperimentConfig,
    pub state: StateWithReason,
    pub warm_start: Option<Uuid>,
}

pub(crate) fn spawn_experiment(
    ctx: MasterContext,
    init: ExperimentInit,
    searcher: Box<dyn Searcher>,
    start: ExperimentStart,
) -> ExperimentHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(init.state.clone());
    let experiment = Experiment {
        ctx,
        id: init.id,
        job_id: init.job_id,
        config: Arc::new(init.config),
        state: init.state,
        searcher,
        trial_searcher_state: BTreeMap::new(),
        trials: HashMap::new(),
        warm_start: init.warm_start,
        fault_tolerant: true,
        tx: tx.clone(),
        state_tx,
    };
    tokio::spawn(experiment.run(start, rx));
    ExperimentHandle {
        id: init.id,
        tx,
        state: state_rx,
    }
}

/// Default warm-start checkpoint for every trial of an experiment.
pub(crate) async fn resolve_warm_start(
    store: &dyn Store,
    config: &ExperimentConfig,
) -> Result<Option<Uuid>, TnError> {
    if let Some(trial_id) = config.searcher.source_trial_id {
        let checkpoint = store
            .latest_checkpoint_for_trial(trial_id)
            .await?
            .ok_or_else(|| StoreError::CheckpointNotFound(format!("no checkpoint for source trial {}", trial_id)))?;
        return Ok(Some(checkpoint.uuid));
    }
    if let Some(uuid) = config.searcher.source_checkpoint_uuid {
        let checkpoint = store
            .checkpoint(uuid)
            .await?
            .ok_or_else(|| StoreError::CheckpointNotFound(uuid.to_string()))?;
        return Ok(Some(checkpoint.uuid));
    }
    Ok(None)
}

struct Experiment {
    ctx: MasterContext,
    id: ExperimentId,
    job_id: JobId,
    config: Arc<ExperimentConfig>,
    state: StateWithReason,
    searcher: Box<dyn Searcher>,
    trial_searcher_state: BTreeMap<RequestId, TrialSearcherState>,
    trials: HashMap<RequestId, TrialHandle>,
    warm_start: Option<Uuid>,
    /// Cleared after the first failed snapshot write.
    fault_tolerant: bool,
    tx: mpsc::UnboundedSender<ExperimentMsg>,
    state_tx: watch::Sender<StateWithReason>,
}

impl Experiment {
    async fn run(mut self, start: ExperimentStart, mut rx: mpsc::UnboundedReceiver<ExperimentMsg>) {
        info!(experiment_id = %self.id, state = %self.state.state, "experiment started");
        match self.setup_group().await {
            Err(err) => {
                error!(experiment_id = %self.id, error = %err, "failed to configure scheduling group");
                self.update_state(State::StoppingError, format!("failed to configure scheduling group: {}", err))
                    .await;
            }
            Ok(()) => match start {
                ExperimentStart::Fresh => {
                    let ops = self.searcher.initial_operations();
                    self.handle_searcher_ops(ops, None, BTreeSet::new()).await;
                }
                ExperimentStart::Restored(plan) => self.apply_restore(plan).await,
            },
        }

        loop {
            if self.state.state.is_stopping() && self.trials.is_empty() {
                self.stop().await;
                break;
            }
            let Some(msg) = rx.recv().await else { break };
            self.handle(msg).await;
        }
    }

    async fn handle(&mut self, msg: ExperimentMsg) {
        match msg {
            ExperimentMsg::PatchState { state, reply } => {
                let result = self.user_patch_state(state).await;
                let _ = reply.send(result);
            }
            ExperimentMsg::SetWeight { weight, reply } => {
                let _ = reply.send(self.set_weight(weight).await);
            }
            ExperimentMsg::SetPriority { priority, reply } => {
                let _ = reply.send(self.set_priority(priority).await);
            }
            ExperimentMsg::SetMaxSlots { max_slots, reply } => {
                let _ = reply.send(self.set_max_slots(max_slots).await);
            }
            ExperimentMsg::PatchCheckpointStorage { storage, reply } => {
                let _ = reply.send(self.patch_checkpoint_storage(storage).await);
            }
            ExperimentMsg::TrialCreated {
                request_id,
                trial_id,
                snapshot,
            } => {
                debug!(experiment_id = %self.id, %request_id, %trial_id, "trial created");
                let ops = self.searcher.trial_created(request_id);
                self.handle_searcher_ops(ops, Some((trial_id, snapshot)), BTreeSet::new())
                    .await;
            }
            ExperimentMsg::TrialCompleteOperation {
                request_id,
                op,
                metric,
                reply,
            } => {
                let result = self.complete_operation(request_id, op, metric).await;
                let _ = reply.send(result);
            }
            ExperimentMsg::TrialReportEarlyExit {
                request_id,
                reason,
                snapshot,
            } => self.trial_report_early_exit(request_id, reason, snapshot).await,
            ExperimentMsg::TrialReportProgress { request_id, progress } => {
                self.trial_report_progress(request_id, progress).await
            }
            ExperimentMsg::TrialExited { request_id, state } => self.trial_exited(request_id, state).await,
            ExperimentMsg::Trial { request_id, reply } => {
                let _ = reply.send(self.trials.get(&request_id).cloned());
            }
            ExperimentMsg::Describe { reply } => {
                let _ = reply.send(self.summary());
            }
        }
    }

    fn summary(&self) -> ExperimentSummary {
        ExperimentSummary {
            id: self.id,
            state: self.state.clone(),
            progress: self.searcher.progress(),
            trial_searcher_state: self.trial_searcher_state.clone(),
            live_trials: self.trials.keys().copied().collect(),
            fault_tolerant: self.fault_tolerant,
        }
    }

    fn resource_pool(&self) -> String {
        self.config.resources.resource_pool.clone().unwrap_or_default()
    }

    /// Unsupported group settings are not an error.
    fn tolerate_unsupported(&self, setting: &str, result: RmResult<()>) -> RmResult<()> {
        match result {
            Err(RmError::Unsupported(msg)) => {
                debug!(experiment_id = %self.id, setting, %msg, "ignoring unsupported group setting");
                Ok(())
            }
            other => other,
        }
    }

    async fn setup_group(&self) -> RmResult<()> {
        let pool = self.resource_pool();
        let resources = &self.config.resources;
        if let Err(err) = self
            .ctx
            .rm
            .set_group_max_slots(&self.job_id, &pool, resources.max_slots)
            .await
        {
            warn!(experiment_id = %self.id, error = %err, "failed to set group max slots");
        }
        let result = self.ctx.rm.set_group_weight(&self.job_id, &pool, resources.weight).await;
        self.tolerate_unsupported("weight", result)?;
        if let Some(priority) = resources.priority {
            let result = self.ctx.rm.set_group_priority(&self.job_id, &pool, priority).await;
            self.tolerate_unsupported("priority", result)?;
        }
        Ok(())
    }

    async fn save_config(&self) -> Result<(), TnError> {
        Ok(self.ctx.store.save_experiment_config(self.id, &self.config).await?)
    }

    async fn set_weight(&mut self, weight: f64) -> Result<(), TnError> {
        let old = self.config.resources.weight;
        Arc::make_mut(&mut self.config).resources.weight = weight;
        let pool = self.resource_pool();
        let result = self.ctx.rm.set_group_weight(&self.job_id, &pool, weight).await;
        let result = match self.tolerate_unsupported("weight", result) {
            Ok(()) => self.save_config().await,
            Err(err) => Err(err.into()),
        };
        if result.is_err() {
            Arc::make_mut(&mut self.config).resources.weight = old;
        }
        result
    }

    async fn set_priority(&mut self, priority: u32) -> Result<(), TnError> {
        let old = self.config.resources.priority;
        Arc::make_mut(&mut self.config).resources.priority = Some(priority);
        let pool = self.resource_pool();
        let result = self.ctx.rm.set_group_priority(&self.job_id, &pool, priority).await;
        let result = match self.tolerate_unsupported("priority", result) {
            Ok(()) => self.save_config().await,
            Err(err) => Err(err.into()),
        };
        if result.is_err() {
            Arc::make_mut(&mut self.config).resources.priority = old;
        }
        result
    }

    async fn set_max_slots(&mut self, max_slots: Option<u32>) -> Result<(), TnError> {
        let old = self.config.resources.max_slots;
        Arc::make_mut(&mut self.config).resources.max_slots = max_slots;
        let pool = self.resource_pool();
        let result = self.ctx.rm.set_group_max_slots(&self.job_id, &pool, max_slots).await;
        let result = match self.tolerate_unsupported("max slots", result) {
            Ok(()) => self.save_config().await,
            Err(err) => Err(err.into()),
        };
        if result.is_err() {
            Arc::make_mut(&mut self.config).resources.max_slots = old;
        }
        result
    }

    async fn patch_checkpoint_storage(&mut self, storage: CheckpointStorageConfig) -> Result<(), TnError> {
        let old = self.config.checkpoint_storage;
        Arc::make_mut(&mut self.config).checkpoint_storage = storage;
        if let Err(err) = self.save_config().await {
            Arc::make_mut(&mut self.config).checkpoint_storage = old;
            return Err(err);
        }
        self.collect_checkpoints().await?;
        Ok(())
    }

    /// Starts a GC task for every checkpoint the retention policy no longer keeps.
    async fn collect_checkpoints(&self) -> Result<usize, TnError> {
        let checkpoints = self.ctx.store.experiment_checkpoints(self.id).await?;
        let to_delete = checkpoints_to_gc(
            &checkpoints,
            &self.config.checkpoint_storage,
            self.config.searcher.smaller_is_better,
        );
        let count = to_delete.len();
        if count > 0 {
            info!(experiment_id = %self.id, checkpoints = count, "starting checkpoint gc");
            spawn_checkpoint_gc(
                self.ctx.clone(),
                GcRequest {
                    experiment_id: self.id,
                    job_id: self.job_id.clone(),
                    resource_pool: self.resource_pool(),
                    to_delete,
                },
            );
        }
        Ok(count)
    }

    /// Moves to `next`, persists, and tells every live trial. False if the
    /// transition is not allowed.
    async fn update_state(&mut self, next: State, reason: impl Into<String>) -> bool {
        let current = self.state.state;
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!(experiment_id = %self.id, from = %current, to = %next, "rejected experiment transition");
            return false;
        }
        self.state = StateWithReason::new(next, reason);
        info!(
            experiment_id = %self.id,
            from = %current,
            to = %next,
            reason = %self.state.reason,
            "experiment state changed"
        );
        if let Err(err) = self.ctx.store.save_experiment_state(self.id, &self.state).await {
            error!(experiment_id = %self.id, error = %err, "failed to persist experiment state");
        }
        self.state_tx.send_replace(self.state.clone());
        for trial in self.trials.values() {
            trial.patch_state(self.state.clone());
        }
        true
    }

    async fn user_patch_state(&mut self, requested: State) -> Result<(), TnError> {
        let current = self.state.state;
        let finishing = current.is_stopping() || current.is_terminal();
        let reason = match requested {
            State::Active | State::Paused if current == requested => return Ok(()),
            State::Active | State::Paused if finishing => {
                return Err(ExperimentError::FailedPrecondition { current, requested }.into())
            }
            State::StoppingCanceled | State::StoppingKilled if finishing => return Ok(()),
            State::Active => "user requested activation",
            State::Paused => "user requested pause",
            State::StoppingCanceled => "user requested cancellation",
            State::StoppingKilled => "user requested kill",
            _ => return Err(ExperimentError::FailedPrecondition { current, requested }.into()),
        };
        if self.update_state(requested, reason).await {
            Ok(())
        } else {
            Err(ExperimentError::FailedPrecondition { current, requested }.into())
        }
    }

    /// Warm-start checkpoint for one trial; an explicit checkpoint on the
    /// `Create` wins over the experiment default.
    async fn trial_warm_start(&self, create: &Create) -> Option<Uuid> {
        let Some(uuid) = create.checkpoint else {
            return self.warm_start;
        };
        match self.ctx.store.checkpoint(uuid).await {
            Ok(Some(checkpoint)) => Some(checkpoint.uuid),
            Ok(None) => {
                warn!(experiment_id = %self.id, request_id = %create.request_id, %uuid, "warm-start checkpoint not found, using default");
                self.warm_start
            }
            Err(err) => {
                warn!(experiment_id = %self.id, request_id = %create.request_id, error = %err, "failed to resolve warm-start checkpoint");
                self.warm_start
            }
        }
    }

    fn spawn_trial(
        &mut self,
        request_id: RequestId,
        searcher_state: TrialSearcherState,
        warm_start: Option<Uuid>,
        restored: Option<RestoredTrial>,
    ) {
        let init = TrialInit {
            experiment_id: self.id,
            job_id: self.job_id.clone(),
            config: self.config.clone(),
            request_id,
            state: self.state.clone(),
            searcher_state,
            warm_start,
            restored,
        };
        let handle = spawn_trial(self.ctx.clone(), init, self.tx.clone());
        self.trials.insert(request_id, handle);
    }

    /// Applies a searcher batch, tells each touched trial once, then writes
    /// the snapshot. `marker` is the reporting trial's own snapshot, written
    /// in the same step.
    async fn handle_searcher_ops(
        &mut self,
        result: SearcherResult<Vec<Operation>>,
        marker: Option<(TrialId, TrialSnapshot)>,
        mut touched: BTreeSet<RequestId>,
    ) {
        match result {
            Err(err) => {
                error!(experiment_id = %self.id, error = %err, "searcher failed");
                self.update_state(State::StoppingError, format!("searcher error: {}", err))
                    .await;
            }
            Ok(ops) if self.state.state.is_stopping() && !ops.iter().all(|op| matches!(op, Operation::Shutdown(_))) => {
                debug!(experiment_id = %self.id, ops = ops.len(), "dropping searcher operations while stopping");
            }
            Ok(ops) => {
                self.apply_operations(ops, &mut touched).await;
                self.notify_trials(touched);
                self.snapshot_and_save(marker).await;
                return;
            }
        }
        self.notify_trials(touched);
    }

    async fn apply_operations(&mut self, ops: Vec<Operation>, touched: &mut BTreeSet<RequestId>) {
        let mut creates = Vec::new();
        for op in ops {
            debug!(experiment_id = %self.id, %op, "applying searcher operation");
            match op {
                Operation::Create(create) => {
                    let request_id = create.request_id;
                    if self.trial_searcher_state.contains_key(&request_id) {
                        warn!(experiment_id = %self.id, %request_id, "ignoring duplicate create");
                        continue;
                    }
                    let warm_start = self.trial_warm_start(&create).await;
                    self.trial_searcher_state
                        .insert(request_id, TrialSearcherState::created(create));
                    creates.push((request_id, warm_start));
                }
                Operation::ValidateAfter(op) => match self.trial_searcher_state.get_mut(&op.request_id) {
                    Some(state) => {
                        state.op = Some(op);
                        state.complete = false;
                        touched.insert(op.request_id);
                    }
                    None => warn!(experiment_id = %self.id, request_id = %op.request_id, "validate for unknown trial"),
                },
                Operation::Close(op) => match self.trial_searcher_state.get_mut(&op.request_id) {
                    Some(state) => {
                        state.closed = true;
                        touched.insert(op.request_id);
                    }
                    None => warn!(experiment_id = %self.id, request_id = %op.request_id, "close for unknown trial"),
                },
                Operation::Shutdown(shutdown) => {
                    info!(experiment_id = %self.id, failure = shutdown.failure, cancel = shutdown.cancel, "searcher shutdown");
                    let reason = if shutdown.failure {
                        "hp search failed"
                    } else if shutdown.cancel {
                        "hp search canceled"
                    } else {
                        "hp search completed"
                    };
                    self.update_state(shutdown.stopping_state(), reason).await;
                }
            }
        }

        for (request_id, warm_start) in creates {
            if let Some(state) = self.trial_searcher_state.get(&request_id).cloned() {
                touched.remove(&request_id);
                self.spawn_trial(request_id, state, warm_start, None);
            }
        }
    }

    fn notify_trials(&self, touched: BTreeSet<RequestId>) {
        for request_id in touched {
            let trial = self.trials.get(&request_id);
            let state = self.trial_searcher_state.get(&request_id);
            if let (Some(trial), Some(state)) = (trial, state) {
                trial.patch_searcher_state(state.clone());
            }
        }
    }

    fn encode_snapshot(
        &self,
        marker: Option<(TrialId, TrialSnapshot)>,
    ) -> Result<(Option<TrialSnapshotWrite>, Vec<u8>), TnError> {
        let snapshot = ExperimentSnapshot {
            searcher_state: self.searcher.snapshot()?,
            trial_searcher_state: self.trial_searcher_state.clone(),
        };
        let trial = match marker {
            Some((trial_id, trial)) => Some(TrialSnapshotWrite {
                trial_id,
                request_id: trial.request_id,
                content: trial.encode()?,
            }),
            None => None,
        };
        Ok((trial, snapshot.encode()?))
    }

    async fn snapshot_and_save(&mut self, marker: Option<(TrialId, TrialSnapshot)>) {
        if !self.fault_tolerant {
            return;
        }
        let result = match self.encode_snapshot(marker) {
            Ok((trial, content)) => self
                .ctx
                .store
                .save_snapshot(self.id, trial, SNAPSHOT_VERSION, content)
                .await
                .map_err(TnError::from),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            error!(
                experiment_id = %self.id,
                error = %err,
                "failed to snapshot experiment, fault tolerance is lost for this experiment"
            );
            self.fault_tolerant = false;
        }
    }

    async fn complete_operation(
        &mut self,
        request_id: RequestId,
        op: ValidateAfter,
        metric: f64,
    ) -> Result<(), TnError> {
        let state = self
            .trial_searcher_state
            .get_mut(&request_id)
            .ok_or(ExperimentError::UnknownRequest(request_id))?;
        if state.op != Some(op) {
            return Err(ExperimentError::OperationMismatch {
                request_id,
                message: format!("expected {:?}, got {:?}", state.op, op),
            }
            .into());
        }
        if state.complete {
            return Err(ExperimentError::OperationMismatch {
                request_id,
                message: "operation already completed".to_string(),
            }
            .into());
        }
        state.complete = true;
        debug!(experiment_id = %self.id, %request_id, metric, length = op.length, "validation completed");
        let ops = self.searcher.validation_completed(request_id, metric, &op);
        self.handle_searcher_ops(ops, None, BTreeSet::from([request_id])).await;
        Ok(())
    }

    async fn trial_report_early_exit(
        &mut self,
        request_id: RequestId,
        reason: ExitedReason,
        marker: Option<(TrialId, TrialSnapshot)>,
    ) {
        info!(experiment_id = %self.id, %request_id, %reason, "trial exited early");
        let Some(state) = self.trial_searcher_state.get_mut(&request_id) else {
            error!(experiment_id = %self.id, %request_id, "trial has no searcher state on early exit");
            return;
        };
        state.closed = true;
        state.complete = true;
        let ops = self.searcher.trial_exited_early(request_id, reason);
        self.handle_searcher_ops(ops, marker, BTreeSet::from([request_id])).await;
    }

    async fn trial_report_progress(&mut self, request_id: RequestId, progress: f64) {
        if !self.trial_searcher_state.contains_key(&request_id) {
            warn!(experiment_id = %self.id, %request_id, "progress for unknown trial");
            return;
        }
        self.searcher.set_trial_progress(request_id, progress);
        let progress = self.searcher.progress();
        if let Err(err) = self.ctx.store.save_experiment_progress(self.id, progress).await {
            warn!(experiment_id = %self.id, error = %err, "failed to save experiment progress");
        }
        self.snapshot_and_save(None).await;
    }

    async fn trial_exited(&mut self, request_id: RequestId, state: State) {
        debug!(experiment_id = %self.id, %request_id, %state, "trial exited");
        self.trials.remove(&request_id);
        if self.trial_searcher_state.remove(&request_id).is_some() {
            let ops = self.searcher.trial_closed(request_id);
            self.handle_searcher_ops(ops, None, BTreeSet::new()).await;
        }
    }

    async fn apply_restore(&mut self, plan: RestorePlan) {
        self.trial_searcher_state = plan.trial_searcher_state;
        for (request_id, action) in plan.trials {
            let Some(state) = self.trial_searcher_state.get(&request_id).cloned() else {
                continue;
            };
            match action {
                TrialRestore::Replay => {
                    debug!(experiment_id = %self.id, %request_id, "replaying trial create");
                    let warm_start = self.trial_warm_start(&state.create).await;
                    self.spawn_trial(request_id, state, warm_start, None);
                }
                TrialRestore::Finished => {
                    debug!(experiment_id = %self.id, %request_id, "trial finished before restart");
                    self.trial_searcher_state.remove(&request_id);
                    let ops = self.searcher.trial_closed(request_id);
                    self.handle_searcher_ops(ops, None, BTreeSet::new()).await;
                }
                TrialRestore::NotifyCreated(row) => {
                    info!(experiment_id = %self.id, %request_id, trial_id = %row.id, "replaying trial created notification");
                    let restored = RestoredTrial {
                        trial_id: row.id,
                        run_id: row.run_id,
                        restarts: row.restarts,
                    };
                    let warm_start = self.trial_warm_start(&state.create).await;
                    self.spawn_trial(request_id, state, warm_start, Some(restored));
                    let marker = TrialSnapshot {
                        request_id,
                        run_id: row.run_id,
                        restarts: row.restarts,
                    };
                    let ops = self.searcher.trial_created(request_id);
                    self.handle_searcher_ops(ops, Some((row.id, marker)), BTreeSet::new())
                        .await;
                }
                TrialRestore::Resume { row, snapshot } => {
                    let restored = RestoredTrial {
                        trial_id: row.id,
                        run_id: row.run_id.max(snapshot.run_id),
                        restarts: row.restarts.max(snapshot.restarts),
                    };
                    let warm_start = self.trial_warm_start(&state.create).await;
                    self.spawn_trial(request_id, state, warm_start, Some(restored));
                }
            }
        }
        info!(experiment_id = %self.id, trials = self.trials.len(), "experiment restored");
    }

    /// Final teardown once stopping with no live trials.
    async fn stop(&mut self) {
        let terminal = self.state.state.terminal().unwrap_or(State::Errored);
        if terminal == State::Completed {
            if let Err(err) = self.ctx.store.save_experiment_progress(self.id, 1.0).await {
                warn!(experiment_id = %self.id, error = %err, "failed to save final progress");
            }
        }
        let reason = self.state.reason.clone();
        self.update_state(terminal, reason).await;

        if let Err(err) = self.collect_checkpoints().await {
            error!(experiment_id = %self.id, error = %err, "failed to collect checkpoints");
        }
        if let Err(err) = self.ctx.store.delete_snapshots_for_experiment(self.id).await {
            error!(experiment_id = %self.id, error = %err, "failed to delete snapshots");
        }
        if let Err(err) = self.ctx.store.delete_session(&experiment_session(self.id)).await {
            error!(experiment_id = %self.id, error = %err, "failed to delete session");
        }
        info!(experiment_id = %self.id, state = %self.state.state, "experiment shut down");
    }
}

/// Session owner key for an experiment.
pub(crate) fn experiment_session(id: ExperimentId) -> String {
    format!("experiment/{}", id)
}
