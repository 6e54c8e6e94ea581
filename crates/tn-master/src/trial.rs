//! Trial actor: reconciles a trial's desired state against its allocation.
//!
//! A trial asks for a new allocation whenever it has no allocation, still has
//! searcher work outstanding, and is supposed to be active. Every allocation
//! attempt gets a fresh run id; messages carrying any other allocation id are
//! stale and dropped.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tn_store::{AllocationRow, NewTrial, TaskLog};
use tn_types::{
    AllocationError, AllocationId, ExitedReason, ExperimentConfig, ExperimentId, JobId, RequestId,
    State, StateWithReason, TaskId, TnError, TrialError, TrialId, TrialSearcherState, TrialSnapshot,
    ValidateAfter,
};

use crate::allocation::{
    Allocation, AllocationExit, AllocationMsg, AllocationSettings, AllocationTimer, PreemptionWatcher,
    RendezvousWatcher, SelfTimers, TerminateKind,
};
use crate::experiment::ExperimentMsg;
use crate::rm::{AllocateRequest, FittingRequirements, ResourcesAllocated, RmEvent, TaskActorRef};
use crate::task::{RendezvousKeys, TaskSpec, TrialTaskSpec};
use crate::MasterContext;

#[derive(Debug)]
pub enum TrialMsg {
    PatchState(StateWithReason),
    PatchSearcherState(TrialSearcherState),
    Rm(RmEvent),
    /// Anything addressed to one specific allocation of this trial.
    Allocation {
        allocation_id: AllocationId,
        msg: AllocationMsg,
    },
    GetSearcherOp {
        reply: oneshot::Sender<Option<ValidateAfter>>,
    },
    Describe {
        reply: oneshot::Sender<TrialSummary>,
    },
}

fn timer_msg(allocation_id: AllocationId, timer: AllocationTimer) -> TrialMsg {
    TrialMsg::Allocation {
        allocation_id,
        msg: AllocationMsg::Timer(timer),
    }
}

/// Point-in-time view of a trial.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialSummary {
    pub request_id: RequestId,
    pub trial_id: Option<TrialId>,
    pub state: State,
    pub run_id: u32,
    pub restarts: u32,
    pub allocation_id: Option<AllocationId>,
    pub searcher_state: TrialSearcherState,
}

/// Persisted identity a restored trial resumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoredTrial {
    pub trial_id: TrialId,
    pub run_id: u32,
    pub restarts: u32,
}

/// Everything needed to start a trial actor.
#[derive(Debug, Clone)]
pub struct TrialInit {
    pub experiment_id: ExperimentId,
    pub job_id: JobId,
    pub config: Arc<ExperimentConfig>,
    pub request_id: RequestId,
    pub state: StateWithReason,
    pub searcher_state: TrialSearcherState,
    /// Checkpoint to start from when the trial has none of its own.
    pub warm_start: Option<Uuid>,
    pub restored: Option<RestoredTrial>,
}

/// Address of a running trial actor.
#[derive(Debug, Clone)]
pub struct TrialHandle {
    request_id: RequestId,
    tx: mpsc::UnboundedSender<TrialMsg>,
}

impl TrialHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    pub(crate) fn patch_state(&self, state: StateWithReason) {
        let _ = self.tx.send(TrialMsg::PatchState(state));
    }

    pub(crate) fn patch_searcher_state(&self, state: TrialSearcherState) {
        let _ = self.tx.send(TrialMsg::PatchSearcherState(state));
    }

    fn send(&self, msg: TrialMsg) -> Result<(), TnError> {
        self.tx
            .send(msg)
            .map_err(|_| TrialError::Stopped(self.request_id).into())
    }

    async fn ask<T>(&self, msg: TrialMsg, rx: oneshot::Receiver<T>) -> Result<T, TnError> {
        self.send(msg)?;
        rx.await.map_err(|_| TrialError::Stopped(self.request_id).into())
    }

    /// Registers a container's runner for the address exchange.
    pub async fn watch_rendezvous(
        &self,
        allocation_id: AllocationId,
        reservation_id: tn_types::ReservationId,
    ) -> Result<RendezvousWatcher, TnError> {
        let (reply, rx) = oneshot::channel();
        let msg = TrialMsg::Allocation {
            allocation_id,
            msg: AllocationMsg::WatchRendezvous { reservation_id, reply },
        };
        Ok(self.ask(msg, rx).await??)
    }

    pub fn unwatch_rendezvous(
        &self,
        allocation_id: AllocationId,
        reservation_id: tn_types::ReservationId,
    ) -> Result<(), TnError> {
        self.send(TrialMsg::Allocation {
            allocation_id,
            msg: AllocationMsg::UnwatchRendezvous { reservation_id },
        })
    }

    pub async fn watch_preemption(
        &self,
        allocation_id: AllocationId,
        watcher_id: Uuid,
    ) -> Result<PreemptionWatcher, TnError> {
        let (reply, rx) = oneshot::channel();
        let msg = TrialMsg::Allocation {
            allocation_id,
            msg: AllocationMsg::WatchPreemption { watcher_id, reply },
        };
        Ok(self.ask(msg, rx).await??)
    }

    pub fn unwatch_preemption(&self, allocation_id: AllocationId, watcher_id: Uuid) -> Result<(), TnError> {
        self.send(TrialMsg::Allocation {
            allocation_id,
            msg: AllocationMsg::UnwatchPreemption { watcher_id },
        })
    }

    /// The runner is shutting down in response to preemption.
    pub fn ack_preemption(&self, allocation_id: AllocationId) -> Result<(), TnError> {
        self.send(TrialMsg::Allocation {
            allocation_id,
            msg: AllocationMsg::AckPreemption,
        })
    }

    /// The operation the runner should work on, if any is outstanding.
    pub async fn current_op(&self) -> Result<Option<ValidateAfter>, TnError> {
        let (reply, rx) = oneshot::channel();
        self.ask(TrialMsg::GetSearcherOp { reply }, rx).await
    }

    pub async fn describe(&self) -> Result<TrialSummary, TnError> {
        let (reply, rx) = oneshot::channel();
        self.ask(TrialMsg::Describe { reply }, rx).await
    }
}

fn stop_kind(state: State) -> Option<TerminateKind> {
    match state {
        State::StoppingCompleted => Some(TerminateKind::Noop),
        State::StoppingCanceled => Some(TerminateKind::Preempt),
        State::StoppingKilled | State::StoppingError => Some(TerminateKind::Kill),
        _ => None,
    }
}

struct Trial {
    ctx: MasterContext,
    experiment_id: ExperimentId,
    job_id: JobId,
    config: Arc<ExperimentConfig>,
    request_id: RequestId,
    task_id: TaskId,
    id: Option<TrialId>,
    state: StateWithReason,
    searcher_state: TrialSearcherState,
    warm_start: Option<Uuid>,
    run_id: u32,
    restarts: u32,
    allocation: Option<Allocation>,
    tx: mpsc::UnboundedSender<TrialMsg>,
    timers: SelfTimers<TrialMsg>,
    parent: mpsc::UnboundedSender<ExperimentMsg>,
}

/// Starts a trial actor. It reports back to `parent` and exits once it
/// reaches a terminal state.
pub fn spawn_trial(
    ctx: MasterContext,
    init: TrialInit,
    parent: mpsc::UnboundedSender<ExperimentMsg>,
) -> TrialHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let restored = init.restored;
    let trial = Trial {
        ctx,
        experiment_id: init.experiment_id,
        job_id: init.job_id,
        config: init.config,
        request_id: init.request_id,
        task_id: TaskId::for_trial(init.experiment_id, init.request_id),
        id: restored.map(|r| r.trial_id),
        state: init.state,
        searcher_state: init.searcher_state,
        warm_start: init.warm_start,
        run_id: restored.map(|r| r.run_id).unwrap_or(0),
        restarts: restored.map(|r| r.restarts).unwrap_or(0),
        allocation: None,
        tx: tx.clone(),
        timers: SelfTimers::new(tx.clone(), timer_msg),
        parent,
    };
    tokio::spawn(trial.run(rx));
    TrialHandle {
        request_id: init.request_id,
        tx,
    }
}

impl Trial {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TrialMsg>) {
        info!(
            experiment_id = %self.experiment_id,
            request_id = %self.request_id,
            state = %self.state.state,
            "trial started"
        );
        if self.searcher_state.is_finished() {
            self.patch_state(StateWithReason::new(State::StoppingCompleted, "hp search is finished"))
                .await;
        } else if let Some(terminal) = self.state.state.terminal() {
            let reason = self.state.reason.clone();
            self.set_state(StateWithReason::new(terminal, reason)).await;
        } else {
            self.maybe_allocate().await;
        }
        while !self.state.state.is_terminal() {
            let Some(msg) = rx.recv().await else { break };
            self.handle(msg).await;
        }
        info!(
            experiment_id = %self.experiment_id,
            request_id = %self.request_id,
            state = %self.state.state,
            reason = %self.state.reason,
            "trial stopped"
        );
        let _ = self.parent.send(ExperimentMsg::TrialExited {
            request_id: self.request_id,
            state: self.state.state,
        });
    }

    async fn handle(&mut self, msg: TrialMsg) {
        match msg {
            TrialMsg::PatchState(state) => self.patch_state(state).await,
            TrialMsg::PatchSearcherState(state) => self.patch_searcher_state(state).await,
            TrialMsg::Rm(event) => self.rm_event(event).await,
            TrialMsg::Allocation { allocation_id, msg } => self.allocation_msg(allocation_id, msg).await,
            TrialMsg::GetSearcherOp { reply } => {
                let op = if self.searcher_state.complete {
                    None
                } else {
                    self.searcher_state.op
                };
                let _ = reply.send(op);
            }
            TrialMsg::Describe { reply } => {
                let _ = reply.send(self.summary());
            }
        }
    }

    fn summary(&self) -> TrialSummary {
        TrialSummary {
            request_id: self.request_id,
            trial_id: self.id,
            state: self.state.state,
            run_id: self.run_id,
            restarts: self.restarts,
            allocation_id: self.allocation.as_ref().map(|a| a.id().clone()),
            searcher_state: self.searcher_state.clone(),
        }
    }

    fn snapshot(&self) -> TrialSnapshot {
        TrialSnapshot {
            request_id: self.request_id,
            run_id: self.run_id,
            restarts: self.restarts,
        }
    }

    fn is_current(&self, allocation_id: &AllocationId) -> bool {
        self.allocation
            .as_ref()
            .map(|a| a.id() == allocation_id)
            .unwrap_or(false)
    }

    fn drop_stale(&self, allocation_id: &AllocationId) {
        let err = TrialError::StaleAllocation {
            got: allocation_id.clone(),
            current: self.allocation.as_ref().map(|a| a.id().clone()),
        };
        warn!(request_id = %self.request_id, error = %err, "dropping stale message");
    }

    async fn rm_event(&mut self, event: RmEvent) {
        let allocation_id = event.allocation_id().clone();
        if !self.is_current(&allocation_id) {
            self.drop_stale(&allocation_id);
            return;
        }
        match event {
            RmEvent::ResourcesAllocated(msg) => self.resources_allocated(msg).await,
            RmEvent::ReleaseResources(msg) => {
                self.allocation_msg(allocation_id, AllocationMsg::Release(msg)).await
            }
            RmEvent::ContainerStateChanged(msg) => {
                self.allocation_msg(allocation_id, AllocationMsg::ContainerStateChanged(msg))
                    .await
            }
            RmEvent::ContainerLog(log) => {
                let line = TaskLog::new(self.task_id.clone(), Some(allocation_id), log.message);
                if let Err(err) = self.ctx.store.add_task_logs(vec![line]).await {
                    debug!(request_id = %self.request_id, error = %err, "failed to persist container log");
                }
            }
        }
    }

    async fn allocation_msg(&mut self, allocation_id: AllocationId, msg: AllocationMsg) {
        if !self.is_current(&allocation_id) {
            self.drop_stale(&allocation_id);
            msg.reject(AllocationError::Exited(allocation_id));
            return;
        }
        let Some(allocation) = self.allocation.as_mut() else {
            return;
        };
        let exit = match allocation.process(msg, &self.timers) {
            Ok(exit) => exit,
            Err(err) => {
                warn!(request_id = %self.request_id, %allocation_id, error = %err, "allocation rejected message");
                None
            }
        };
        self.flush_allocation_logs().await;
        if let Some(exit) = exit {
            self.on_allocation_exit(exit).await;
        }
    }

    async fn flush_allocation_logs(&mut self) {
        let Some(allocation) = self.allocation.as_mut() else {
            return;
        };
        let allocation_id = allocation.id().clone();
        let lines: Vec<TaskLog> = allocation
            .drain_logs()
            .into_iter()
            .map(|line| TaskLog::new(self.task_id.clone(), Some(allocation_id.clone()), line))
            .collect();
        if lines.is_empty() {
            return;
        }
        if let Err(err) = self.ctx.store.add_task_logs(lines).await {
            debug!(request_id = %self.request_id, error = %err, "failed to persist task logs");
        }
    }

    fn allocation_settings(&self) -> AllocationSettings {
        let master = &self.ctx.config;
        AllocationSettings {
            preemptible: true,
            rendezvous: true,
            kill_cooldown: master.kill_cooldown(),
            rendezvous_timeout: master.rendezvous_timeout(),
            preemption_timeout: self.config.preemption_timeout(master.preemption_timeout()),
        }
    }

    /// Requests a new allocation if the trial needs one. A failed request
    /// counts against the restart budget.
    async fn maybe_allocate(&mut self) {
        loop {
            if self.allocation.is_some()
                || self.searcher_state.complete
                || self.state.state != State::Active
            {
                return;
            }

            let run_id = self.run_id + 1;
            let allocation_id = AllocationId::new(&self.task_id, run_id);
            let request = AllocateRequest {
                allocation_id: allocation_id.clone(),
                task_id: self.task_id.clone(),
                job_id: self.job_id.clone(),
                name: format!("Trial {} (Experiment {})", self.request_id, self.experiment_id),
                slots_needed: self.config.resources.slots_per_trial,
                resource_pool: self.config.resources.resource_pool.clone().unwrap_or_default(),
                fitting_requirements: FittingRequirements::default(),
                non_preemptible: false,
                task_actor: TaskActorRef::new(self.tx.clone(), TrialMsg::Rm),
            };
            self.allocation = Some(Allocation::new(allocation_id.clone(), run_id, self.allocation_settings()));
            debug!(request_id = %self.request_id, %allocation_id, "requesting allocation");

            match self.ctx.rm.allocate(request).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(request_id = %self.request_id, %allocation_id, error = %err, "allocation request failed");
                    self.allocation = None;
                    self.run_id = run_id;
                    let reason = format!("failed to request resources: {}", err);
                    if !self.record_failure(&reason).await {
                        return;
                    }
                }
            }
        }
    }

    async fn resources_allocated(&mut self, msg: ResourcesAllocated) {
        let pending = self.allocation.as_ref().map(Allocation::is_pending).unwrap_or(false);
        if !pending {
            warn!(request_id = %self.request_id, allocation_id = %msg.allocation_id, "ignoring duplicate resources");
            return;
        }
        let allocation_id = msg.allocation_id.clone();
        let slots: u32 = msg.reservations.iter().map(|r| r.summary().slots).sum();
        if let Some(allocation) = self.allocation.as_mut() {
            allocation.resources_allocated(msg.reservations);
        }

        let (trial_id, first) = match self.id {
            Some(id) => (id, false),
            None => {
                let new_trial = NewTrial {
                    experiment_id: self.experiment_id,
                    request_id: self.request_id,
                    task_id: self.task_id.clone(),
                    hparams: self.searcher_state.create.hparams.clone(),
                    seed: self.searcher_state.create.trial_seed,
                    warm_start_checkpoint: self.warm_start,
                };
                match self.ctx.store.add_trial(new_trial).await {
                    Ok(id) => {
                        self.id = Some(id);
                        (id, true)
                    }
                    Err(err) => {
                        error!(request_id = %self.request_id, error = %err, "failed to persist trial");
                        let exit = self
                            .allocation
                            .as_mut()
                            .and_then(|a| a.crash(format!("failed to persist trial: {}", err), &self.timers));
                        if let Some(exit) = exit {
                            self.on_allocation_exit(exit).await;
                        }
                        return;
                    }
                }
            }
        };

        let run_id = self.allocation.as_ref().map(Allocation::run_id).unwrap_or(self.run_id + 1);
        self.run_id = run_id;
        if let Err(err) = self.ctx.store.update_trial_run_id(trial_id, run_id).await {
            warn!(%trial_id, error = %err, "failed to persist run id");
        }
        let row = AllocationRow::new(allocation_id.clone(), self.task_id.clone(), slots);
        if let Err(err) = self.ctx.store.add_allocation(row).await {
            warn!(%trial_id, error = %err, "failed to persist allocation");
        }
        if first {
            let _ = self.parent.send(ExperimentMsg::TrialCreated {
                request_id: self.request_id,
                trial_id,
                snapshot: self.snapshot(),
            });
        }

        let (latest_checkpoint, latest_batch) = self.resume_point(trial_id).await;
        let base = TrialTaskSpec {
            experiment_id: self.experiment_id,
            trial_id,
            request_id: self.request_id,
            run_id,
            hparams: self.searcher_state.create.hparams.clone(),
            trial_seed: self.searcher_state.create.trial_seed,
            latest_checkpoint,
            latest_batch,
            rendezvous: RendezvousKeys {
                allocation_id: allocation_id.clone(),
                rank: 0,
                num_containers: 0,
            },
        };
        if let Some(allocation) = self.allocation.as_mut() {
            let num_containers = allocation.num_containers();
            allocation.start(|rank| {
                let mut spec = base.clone();
                spec.rendezvous.rank = rank;
                spec.rendezvous.num_containers = num_containers;
                TaskSpec::Trial(spec)
            });
        }
        info!(%trial_id, %allocation_id, run_id, "trial allocation started");
    }

    /// Checkpoint and batch the next run resumes from.
    async fn resume_point(&self, trial_id: TrialId) -> (Option<Uuid>, u64) {
        match self.ctx.store.latest_checkpoint_for_trial(trial_id).await {
            Ok(Some(checkpoint)) => (Some(checkpoint.uuid), checkpoint.total_batches),
            Ok(None) => (self.warm_start, 0),
            Err(err) => {
                warn!(%trial_id, error = %err, "failed to look up latest checkpoint");
                (self.warm_start, 0)
            }
        }
    }

    async fn terminate_allocation(&mut self, kind: TerminateKind, reason: &str) {
        let exit = match self.allocation.as_mut() {
            Some(allocation) => allocation.terminate(kind, reason, &self.timers),
            None => return,
        };
        self.flush_allocation_logs().await;
        if let Some(exit) = exit {
            self.on_allocation_exit(exit).await;
        }
    }

    async fn on_allocation_exit(&mut self, exit: AllocationExit) {
        let Some(allocation) = self.allocation.take() else {
            return;
        };
        let allocation_id = allocation.id().clone();
        self.run_id = self.run_id.max(allocation.run_id());
        info!(request_id = %self.request_id, %allocation_id, exit = %exit, "allocation exited");

        if !allocation.is_pending() {
            if let Err(err) = self
                .ctx
                .store
                .complete_allocation(&allocation_id, Some(exit.reason.clone()))
                .await
            {
                warn!(%allocation_id, error = %err, "failed to mark allocation complete");
            }
        }
        if let Err(err) = self.ctx.rm.release(&allocation_id).await {
            debug!(%allocation_id, error = %err, "release failed");
        }

        let expected_stop = self.searcher_state.is_finished() || self.state.state.is_stopping();
        if exit.is_failure() {
            if !self.record_failure(&exit.reason).await {
                return;
            }
        } else if exit.is_user_requested_stop() && !expected_stop {
            self.report_early_exit(ExitedReason::UserCanceled);
            self.set_state(StateWithReason::new(
                State::Completed,
                "trial exited early with a user requested stop",
            ))
            .await;
            return;
        }

        if self.searcher_state.is_finished() {
            self.set_state(StateWithReason::new(State::Completed, "hp search is finished"))
                .await;
            return;
        }
        if let Some(terminal) = self.state.state.terminal() {
            let reason = self.state.reason.clone();
            self.set_state(StateWithReason::new(terminal, reason)).await;
            return;
        }
        self.maybe_allocate().await;
    }

    /// Counts a real failure. Returns false if the trial gave up.
    async fn record_failure(&mut self, reason: &str) -> bool {
        self.restarts += 1;
        if let Some(id) = self.id {
            if let Err(err) = self.ctx.store.update_trial_restarts(id, self.restarts).await {
                warn!(trial_id = %id, error = %err, "failed to persist restarts");
            }
        }
        if self.restarts > self.config.max_restarts {
            warn!(
                request_id = %self.request_id,
                restarts = self.restarts,
                max_restarts = self.config.max_restarts,
                %reason,
                "trial exceeded max restarts"
            );
            self.report_early_exit(ExitedReason::Errored);
            self.set_state(StateWithReason::new(
                State::Errored,
                format!("trial exceeded max restarts: {}", reason),
            ))
            .await;
            return false;
        }
        info!(request_id = %self.request_id, restarts = self.restarts, %reason, "trial failed, restarting");
        true
    }

    fn report_early_exit(&self, reason: ExitedReason) {
        let _ = self.parent.send(ExperimentMsg::TrialReportEarlyExit {
            request_id: self.request_id,
            reason,
            snapshot: self.id.map(|id| (id, self.snapshot())),
        });
    }

    async fn set_state(&mut self, next: StateWithReason) {
        if self.state.state.is_terminal() {
            return;
        }
        info!(
            request_id = %self.request_id,
            from = %self.state.state,
            to = %next.state,
            reason = %next.reason,
            "trial state changed"
        );
        self.state = next;
        if let Some(id) = self.id {
            if let Err(err) = self.ctx.store.update_trial_state(id, self.state.state).await {
                warn!(trial_id = %id, error = %err, "failed to persist trial state");
            }
        }
    }

    async fn patch_state(&mut self, next: StateWithReason) {
        let current = self.state.state;
        if current.is_terminal() || current == next.state {
            return;
        }
        let escalation = current.is_stopping() && next.state.is_stopping();
        if !current.can_transition_to(next.state) && !escalation {
            warn!(request_id = %self.request_id, from = %current, to = %next.state, "ignoring invalid trial transition");
            return;
        }
        let reason = next.reason.clone();
        self.set_state(next).await;

        match self.state.state {
            State::Active => self.maybe_allocate().await,
            State::Paused => self.terminate_allocation(TerminateKind::Preempt, "trial paused").await,
            state => {
                let Some(kind) = stop_kind(state) else { return };
                if self.allocation.is_some() {
                    self.terminate_allocation(kind, &reason).await;
                } else if let Some(terminal) = state.terminal() {
                    self.set_state(StateWithReason::new(terminal, reason)).await;
                }
            }
        }
    }

    async fn patch_searcher_state(&mut self, state: TrialSearcherState) {
        self.searcher_state = state;
        if self.searcher_state.is_finished() {
            self.patch_state(StateWithReason::new(State::StoppingCompleted, "hp search is finished"))
                .await;
        } else if !self.searcher_state.complete {
            self.maybe_allocate().await;
        }
    }
}
