//! One allocation attempt of a task: its reservations, their containers, and
//! the rendezvous and preemption handshakes layered on top.
//!
//! An [`Allocation`] has no task of its own. Its owner calls [`Allocation::process`]
//! from inside its own message loop, and waits are expressed as timers that
//! post back into that loop.

mod preemption;
mod rendezvous;

pub use preemption::{Preemption, PreemptionWatcher};
pub use rendezvous::{Rendezvous, RendezvousInfo, RendezvousWatcher};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tn_types::{AllocationError, AllocationId, ReservationId};

use crate::rm::{
    Address, ContainerFailure, ContainerState, ContainerStateChanged, FailureKind,
    ReleaseResources, Reservation,
};
use crate::task::TaskSpec;

/// How hard to push when ending an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateKind {
    /// Let the containers finish on their own.
    Noop,
    /// Ask the runners to shut down, falling back to a kill.
    Preempt,
    Kill,
}

/// Deferred self-messages an allocation asks its owner to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationTimer {
    RendezvousTimeout,
    PreemptionTimeout,
    KillCooldownExpired,
}

/// Schedules an [`AllocationTimer`] to come back through the owner's mailbox,
/// tagged with the allocation it was armed for.
pub trait TimerSink {
    fn schedule(&self, allocation_id: AllocationId, after: Duration, timer: AllocationTimer);
}

/// [`TimerSink`] backed by a tokio sleep that posts into an actor mailbox.
pub struct SelfTimers<M> {
    tx: mpsc::UnboundedSender<M>,
    wrap: fn(AllocationId, AllocationTimer) -> M,
}

impl<M> SelfTimers<M> {
    pub fn new(tx: mpsc::UnboundedSender<M>, wrap: fn(AllocationId, AllocationTimer) -> M) -> Self {
        Self { tx, wrap }
    }
}

impl<M: Send + 'static> TimerSink for SelfTimers<M> {
    fn schedule(&self, allocation_id: AllocationId, after: Duration, timer: AllocationTimer) {
        let tx = self.tx.clone();
        let msg = (self.wrap)(allocation_id, timer);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(msg);
        });
    }
}

/// Messages an allocation understands. Everything goes through
/// [`Allocation::process`].
#[derive(Debug)]
pub enum AllocationMsg {
    ContainerStateChanged(ContainerStateChanged),
    Release(ReleaseResources),
    Terminate {
        kind: TerminateKind,
        reason: String,
    },
    WatchRendezvous {
        reservation_id: ReservationId,
        reply: oneshot::Sender<Result<RendezvousWatcher, AllocationError>>,
    },
    UnwatchRendezvous {
        reservation_id: ReservationId,
    },
    WatchPreemption {
        watcher_id: Uuid,
        reply: oneshot::Sender<Result<PreemptionWatcher, AllocationError>>,
    },
    UnwatchPreemption {
        watcher_id: Uuid,
    },
    AckPreemption,
    Timer(AllocationTimer),
}

impl AllocationMsg {
    /// Answers any waiting caller with `err` instead of processing.
    pub fn reject(self, err: AllocationError) {
        match self {
            AllocationMsg::WatchRendezvous { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            AllocationMsg::WatchPreemption { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// We killed it while it was still running.
    Killed,
    /// The runner acknowledged preemption and exited.
    Preempted,
    /// Counts against the task's restart budget.
    Failed(FailureKind),
    /// Ended abnormally, but not the task's fault.
    Aborted(FailureKind),
    /// Exited cleanly without being asked to.
    UserRequestedStop,
}

/// Final outcome of an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationExit {
    pub kind: ExitKind,
    pub reason: String,
}

impl AllocationExit {
    pub fn is_failure(&self) -> bool {
        matches!(self.kind, ExitKind::Failed(_))
    }

    pub fn is_user_requested_stop(&self) -> bool {
        self.kind == ExitKind::UserRequestedStop
    }
}

impl fmt::Display for AllocationExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.reason)
    }
}

#[derive(Debug, Clone)]
pub struct AllocationSettings {
    pub preemptible: bool,
    /// Multi-container tasks exchange addresses before starting work.
    pub rendezvous: bool,
    pub kill_cooldown: Duration,
    pub rendezvous_timeout: Duration,
    pub preemption_timeout: Duration,
}

struct ReservationEntry {
    handle: Arc<dyn Reservation>,
    state: ContainerState,
    addresses: Vec<Address>,
    failure: Option<ContainerFailure>,
}

pub struct Allocation {
    id: AllocationId,
    run_id: u32,
    settings: AllocationSettings,
    ranks: Vec<ReservationId>,
    reservations: BTreeMap<ReservationId, ReservationEntry>,
    started: bool,
    rendezvous: Option<Rendezvous>,
    preemption: Option<Preemption>,
    /// Reservations in the order they terminated.
    exited: Vec<ReservationId>,
    killed_while_running: bool,
    kill_requested: bool,
    kill_cooldown: bool,
    crash: Option<String>,
    logs: Vec<String>,
}

impl Allocation {
    pub fn new(id: AllocationId, run_id: u32, settings: AllocationSettings) -> Self {
        let preemption = settings.preemptible.then(Preemption::new);
        Self {
            id,
            run_id,
            settings,
            ranks: Vec::new(),
            reservations: BTreeMap::new(),
            started: false,
            rendezvous: None,
            preemption,
            exited: Vec::new(),
            killed_while_running: false,
            kill_requested: false,
            kill_cooldown: false,
            crash: None,
            logs: Vec::new(),
        }
    }

    pub fn id(&self) -> &AllocationId {
        &self.id
    }

    pub fn run_id(&self) -> u32 {
        self.run_id
    }

    /// Still waiting on the resource manager.
    pub fn is_pending(&self) -> bool {
        self.ranks.is_empty()
    }

    pub fn num_containers(&self) -> usize {
        self.ranks.len()
    }

    pub fn rendezvous_ready(&self) -> bool {
        self.rendezvous.as_ref().map(Rendezvous::is_ready).unwrap_or(false)
    }

    pub fn is_preempted(&self) -> bool {
        self.preemption.as_ref().map(Preemption::is_preempted).unwrap_or(false)
    }

    /// Operator-facing lines produced since the last call.
    pub fn drain_logs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.logs)
    }

    pub fn resources_allocated(&mut self, reservations: Vec<Arc<dyn Reservation>>) {
        for handle in reservations {
            let id = handle.summary().id;
            self.ranks.push(id.clone());
            self.reservations.insert(
                id,
                ReservationEntry {
                    handle,
                    state: ContainerState::Assigned,
                    addresses: Vec::new(),
                    failure: None,
                },
            );
        }
        if self.settings.rendezvous {
            self.rendezvous = Some(Rendezvous::new(self.id.clone(), self.ranks.clone()));
        }
    }

    /// Starts every reservation, handing each its rank.
    pub fn start<F>(&mut self, spec_for_rank: F)
    where
        F: Fn(usize) -> TaskSpec,
    {
        for (rank, id) in self.ranks.iter().enumerate() {
            if let Some(entry) = self.reservations.get(id) {
                entry.handle.start(spec_for_rank(rank), rank);
            }
        }
        self.started = true;
        info!(allocation_id = %self.id, containers = self.ranks.len(), "allocation started");
    }

    /// Records an unrecoverable task-side error and tears the allocation down.
    pub fn crash(&mut self, reason: impl Into<String>, timers: &dyn TimerSink) -> Option<AllocationExit> {
        let reason = reason.into();
        warn!(allocation_id = %self.id, %reason, "allocation crashed");
        self.crash.get_or_insert(reason.clone());
        self.terminate(TerminateKind::Kill, &reason, timers)
    }

    pub fn process(
        &mut self,
        msg: AllocationMsg,
        timers: &dyn TimerSink,
    ) -> Result<Option<AllocationExit>, AllocationError> {
        match msg {
            AllocationMsg::ContainerStateChanged(change) => self.container_state_changed(change, timers),
            AllocationMsg::Release(release) => {
                if !self.settings.preemptible {
                    debug!(allocation_id = %self.id, "ignoring release of non-preemptible allocation");
                    return Ok(None);
                }
                let (kind, reason) = if release.force_kill {
                    (TerminateKind::Kill, "resources forcibly released")
                } else {
                    (TerminateKind::Preempt, "resources preempted")
                };
                Ok(self.terminate(kind, reason, timers))
            }
            AllocationMsg::Terminate { kind, reason } => Ok(self.terminate(kind, &reason, timers)),
            AllocationMsg::WatchRendezvous { reservation_id, reply } => {
                let result = self.watch_rendezvous(&reservation_id, timers);
                let _ = reply.send(result);
                Ok(None)
            }
            AllocationMsg::UnwatchRendezvous { reservation_id } => {
                if let Some(rendezvous) = self.rendezvous.as_mut() {
                    rendezvous.unwatch(&reservation_id);
                }
                Ok(None)
            }
            AllocationMsg::WatchPreemption { watcher_id, reply } => {
                let result = match self.preemption.as_mut() {
                    Some(preemption) => Ok(preemption.watch(watcher_id)),
                    None => Err(AllocationError::NotPreemptible(self.id.clone())),
                };
                let _ = reply.send(result);
                Ok(None)
            }
            AllocationMsg::UnwatchPreemption { watcher_id } => {
                if let Some(preemption) = self.preemption.as_mut() {
                    preemption.unwatch(&watcher_id);
                }
                Ok(None)
            }
            AllocationMsg::AckPreemption => match self.preemption.as_mut() {
                Some(preemption) => {
                    preemption.acknowledge();
                    info!(allocation_id = %self.id, "preemption acknowledged");
                    Ok(None)
                }
                None => Err(AllocationError::NotPreemptible(self.id.clone())),
            },
            AllocationMsg::Timer(timer) => Ok(self.timer_fired(timer, timers)),
        }
    }

    fn watch_rendezvous(
        &mut self,
        reservation_id: &ReservationId,
        timers: &dyn TimerSink,
    ) -> Result<RendezvousWatcher, AllocationError> {
        if !self.started {
            return Err(AllocationError::NotStarted(self.id.clone()));
        }
        let rendezvous = self
            .rendezvous
            .as_mut()
            .ok_or_else(|| AllocationError::NotStarted(self.id.clone()))?;
        let watcher = rendezvous.watch(reservation_id)?;
        if rendezvous.arm_timer() {
            timers.schedule(
                self.id.clone(),
                self.settings.rendezvous_timeout,
                AllocationTimer::RendezvousTimeout,
            );
        }
        if rendezvous.try_ready() {
            info!(allocation_id = %self.id, "all containers are connected successfully");
        }
        Ok(watcher)
    }

    fn container_state_changed(
        &mut self,
        change: ContainerStateChanged,
        timers: &dyn TimerSink,
    ) -> Result<Option<AllocationExit>, AllocationError> {
        let entry = self
            .reservations
            .get_mut(&change.reservation_id)
            .ok_or_else(|| AllocationError::UnknownReservation(change.reservation_id.clone()))?;
        if change.state <= entry.state {
            debug!(
                allocation_id = %self.id,
                reservation_id = %change.reservation_id,
                state = ?change.state,
                "ignoring non-monotonic container state"
            );
            return Ok(None);
        }
        entry.state = change.state;

        match change.state {
            ContainerState::Assigned => Ok(None),
            ContainerState::Running => {
                entry.addresses = change.addresses.clone();
                if let Some(rendezvous) = self.rendezvous.as_mut() {
                    rendezvous.container_started(&change.reservation_id, change.addresses);
                    if rendezvous.arm_timer() {
                        timers.schedule(
                            self.id.clone(),
                            self.settings.rendezvous_timeout,
                            AllocationTimer::RendezvousTimeout,
                        );
                    }
                    if rendezvous.try_ready() {
                        info!(allocation_id = %self.id, "all containers are connected successfully");
                    }
                }
                Ok(None)
            }
            ContainerState::Terminated => {
                entry.failure = change.failure.clone();
                self.exited.push(change.reservation_id.clone());
                match &change.failure {
                    Some(failure) => {
                        self.logs.push(format!("container {} failed: {}", change.reservation_id, failure));
                        Ok(self.terminate(TerminateKind::Kill, "a container failed", timers))
                    }
                    None => Ok(self.terminate(TerminateKind::Noop, "a container exited", timers)),
                }
            }
        }
    }

    fn timer_fired(&mut self, timer: AllocationTimer, timers: &dyn TimerSink) -> Option<AllocationExit> {
        match timer {
            AllocationTimer::RendezvousTimeout => {
                if let Some(message) = self.rendezvous.as_ref().and_then(Rendezvous::timeout_message) {
                    warn!(allocation_id = %self.id, "rendezvous timed out");
                    self.logs.push(message);
                }
                None
            }
            AllocationTimer::PreemptionTimeout => {
                let unacked = self
                    .preemption
                    .as_ref()
                    .map(|p| p.is_preempted() && !p.is_acknowledged())
                    .unwrap_or(false);
                if !unacked {
                    return None;
                }
                self.logs
                    .push("preemption timed out without acknowledgement, killing".to_string());
                self.terminate(TerminateKind::Kill, "preemption timeout", timers)
            }
            AllocationTimer::KillCooldownExpired => {
                self.kill_cooldown = false;
                if self.kill_requested && !self.all_terminated() {
                    debug!(allocation_id = %self.id, "re-sending kill after cooldown");
                    self.kill("containers still running after kill", timers);
                }
                None
            }
        }
    }

    fn all_terminated(&self) -> bool {
        !self.started
            || self
                .reservations
                .values()
                .all(|r| r.state == ContainerState::Terminated)
    }

    /// The single way an allocation ends. Returns the exit status once every
    /// reservation has terminated.
    pub fn terminate(&mut self, kind: TerminateKind, reason: &str, timers: &dyn TimerSink) -> Option<AllocationExit> {
        if self.all_terminated() {
            return Some(self.exit_status());
        }
        match kind {
            TerminateKind::Noop => None,
            TerminateKind::Preempt if !self.exited.is_empty() => None,
            TerminateKind::Preempt if self.rendezvous_ready() && self.preemption.is_some() => {
                let first = self.preemption.as_mut().map(Preemption::preempt).unwrap_or(false);
                if first {
                    info!(allocation_id = %self.id, %reason, "gracefully terminating allocation");
                    self.logs.push(format!("gracefully terminating allocation: {}", reason));
                    timers.schedule(
                        self.id.clone(),
                        self.settings.preemption_timeout,
                        AllocationTimer::PreemptionTimeout,
                    );
                }
                None
            }
            _ => {
                self.kill(reason, timers);
                None
            }
        }
    }

    fn kill(&mut self, reason: &str, timers: &dyn TimerSink) {
        self.kill_requested = true;
        if self.kill_cooldown {
            warn!(allocation_id = %self.id, %reason, "kill suppressed during cooldown");
            return;
        }
        if self.exited.is_empty() {
            self.killed_while_running = true;
        }
        info!(allocation_id = %self.id, %reason, "killing allocation");
        self.logs.push(format!("forcibly terminating allocation: {}", reason));
        for entry in self.reservations.values() {
            if entry.state != ContainerState::Terminated {
                entry.handle.kill();
            }
        }
        self.kill_cooldown = true;
        timers.schedule(
            self.id.clone(),
            self.settings.kill_cooldown,
            AllocationTimer::KillCooldownExpired,
        );
    }

    fn exit_status(&self) -> AllocationExit {
        if let Some(reason) = &self.crash {
            return AllocationExit {
                kind: ExitKind::Failed(FailureKind::TaskError),
                reason: reason.clone(),
            };
        }
        if self.killed_while_running {
            return AllocationExit {
                kind: ExitKind::Killed,
                reason: "allocation killed".to_string(),
            };
        }
        if !self.started {
            return AllocationExit {
                kind: ExitKind::Aborted(FailureKind::TaskAborted),
                reason: "allocation ended before anything started".to_string(),
            };
        }
        let first_failure = self
            .exited
            .first()
            .and_then(|id| self.reservations.get(id))
            .and_then(|entry| entry.failure.clone());
        match first_failure {
            Some(failure) => {
                let kind = match failure.kind {
                    FailureKind::ContainerFailed | FailureKind::TaskError => ExitKind::Failed(failure.kind),
                    FailureKind::AgentError | FailureKind::AgentFailed | FailureKind::TaskAborted => {
                        ExitKind::Aborted(failure.kind)
                    }
                };
                AllocationExit {
                    kind,
                    reason: failure.to_string(),
                }
            }
            None if self.preemption.as_ref().map(Preemption::is_acknowledged).unwrap_or(false) => {
                AllocationExit {
                    kind: ExitKind::Preempted,
                    reason: "allocation stopped after preemption".to_string(),
                }
            }
            None => AllocationExit {
                kind: ExitKind::UserRequestedStop,
                reason: "allocation exited without being asked to".to_string(),
            },
        }
    }
}
