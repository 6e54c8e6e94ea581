//! Simulated (in-process) resource manager for sandbox mode and tests.
//!
//! Grants allocations without any real agents. Containers do nothing until
//! told to: callers drive them through [`SimResourceManager::report_running`]
//! and [`SimResourceManager::report_exit`], or enable `auto_run`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use tn_types::{AllocationId, JobId, ReservationId, RmError};

use crate::rm::{
    Address, AllocateRequest, ContainerFailure, ContainerLog, ContainerState, ContainerStateChanged,
    FailureKind, ReleaseResources, Reservation, ReservationSummary, ResourceManager, ResourcesAllocated,
    RmEvent, RmResult, TaskActorRef,
};
use crate::task::TaskSpec;

/// Configuration for the simulated resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Grant every request as soon as it arrives.
    pub auto_grant: bool,
    pub containers_per_allocation: usize,
    /// Known pools; the first one is the default.
    pub pools: Vec<String>,
    /// Whether group priorities are implemented.
    pub support_priority: bool,
    /// Started containers report Running right away.
    pub auto_run: bool,
    /// Killed containers report Terminated right away.
    pub exit_on_kill: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            auto_grant: true,
            containers_per_allocation: 1,
            pools: vec!["default".to_string()],
            support_priority: true,
            auto_run: false,
            exit_on_kill: true,
        }
    }
}

/// Every call made against the simulated manager, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RmCall {
    Allocate {
        allocation_id: AllocationId,
        slots: u32,
        non_preemptible: bool,
    },
    Release(AllocationId),
    SetMaxSlots {
        job_id: JobId,
        max_slots: Option<u32>,
    },
    SetWeight {
        job_id: JobId,
        weight: f64,
    },
    SetPriority {
        job_id: JobId,
        priority: u32,
    },
}

/// One simulated container.
pub struct SimReservation {
    id: ReservationId,
    allocation_id: AllocationId,
    agent: String,
    slots: u32,
    address: Address,
    actor: TaskActorRef,
    auto_run: bool,
    exit_on_kill: bool,
    starts: Mutex<Vec<(TaskSpec, usize)>>,
    kills: AtomicUsize,
    terminated: AtomicBool,
}

impl SimReservation {
    pub fn id(&self) -> &ReservationId {
        &self.id
    }

    pub fn allocation_id(&self) -> &AllocationId {
        &self.allocation_id
    }

    /// Task specs this container was started with, with their ranks.
    pub fn starts(&self) -> Vec<(TaskSpec, usize)> {
        self.starts.lock().clone()
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn tell_state(&self, state: ContainerState, failure: Option<ContainerFailure>) {
        let addresses = match state {
            ContainerState::Running => vec![self.address.clone()],
            _ => Vec::new(),
        };
        self.actor.tell(RmEvent::ContainerStateChanged(ContainerStateChanged {
            allocation_id: self.allocation_id.clone(),
            reservation_id: self.id.clone(),
            state,
            addresses,
            failure,
        }));
    }

    pub fn report_running(&self) {
        if !self.is_terminated() {
            self.tell_state(ContainerState::Running, None);
        }
    }

    /// Reports the container as exited; later reports are ignored.
    pub fn report_exit(&self, failure: Option<ContainerFailure>) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.tell_state(ContainerState::Terminated, failure);
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        self.actor.tell(RmEvent::ContainerLog(ContainerLog {
            allocation_id: self.allocation_id.clone(),
            reservation_id: self.id.clone(),
            message: message.into(),
        }));
    }
}

impl Reservation for SimReservation {
    fn summary(&self) -> ReservationSummary {
        ReservationSummary {
            id: self.id.clone(),
            agent: self.agent.clone(),
            slots: self.slots,
        }
    }

    fn start(&self, spec: TaskSpec, rank: usize) {
        self.starts.lock().push((spec, rank));
        if self.auto_run {
            self.report_running();
        }
    }

    fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if self.exit_on_kill {
            self.report_exit(Some(ContainerFailure::new(FailureKind::TaskAborted, "container killed")));
        }
    }
}

struct Granted {
    actor: TaskActorRef,
    reservations: Vec<Arc<SimReservation>>,
}

#[derive(Default)]
struct SimState {
    calls: Vec<RmCall>,
    pending: Vec<AllocateRequest>,
    granted: HashMap<AllocationId, Granted>,
    next_port: u16,
}

/// In-process [`ResourceManager`].
pub struct SimResourceManager {
    config: SimConfig,
    state: Mutex<SimState>,
    groups_unavailable: AtomicBool,
}

impl SimResourceManager {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimState::default()),
            groups_unavailable: AtomicBool::new(false),
        }
    }

    /// Makes group max-slots and weight updates fail as if the manager were down.
    pub fn set_groups_unavailable(&self, unavailable: bool) {
        self.groups_unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_groups(&self) -> RmResult<()> {
        if self.groups_unavailable.load(Ordering::SeqCst) {
            return Err(RmError::Unavailable("group updates rejected".to_string()));
        }
        Ok(())
    }

    pub fn with_defaults() -> Self {
        Self::new(SimConfig::default())
    }

    fn record(&self, call: RmCall) {
        self.state.lock().calls.push(call);
    }

    pub fn calls(&self) -> Vec<RmCall> {
        self.state.lock().calls.clone()
    }

    pub fn allocate_count(&self) -> usize {
        self.count(|c| matches!(c, RmCall::Allocate { .. }))
    }

    pub fn release_count(&self) -> usize {
        self.count(|c| matches!(c, RmCall::Release(_)))
    }

    fn count(&self, f: impl Fn(&RmCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| f(c)).count()
    }

    /// Requests waiting for [`Self::grant`].
    pub fn pending(&self) -> Vec<AllocationId> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|r| r.allocation_id.clone())
            .collect()
    }

    /// Allocations granted and not yet released.
    pub fn granted(&self) -> Vec<AllocationId> {
        let mut ids: Vec<AllocationId> = self.state.lock().granted.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn reservations(&self, allocation_id: &AllocationId) -> Vec<Arc<SimReservation>> {
        self.state
            .lock()
            .granted
            .get(allocation_id)
            .map(|g| g.reservations.clone())
            .unwrap_or_default()
    }

    /// Grants a pending request. False if nothing is pending under that id.
    pub fn grant(&self, allocation_id: &AllocationId) -> bool {
        let request = {
            let mut state = self.state.lock();
            match state.pending.iter().position(|r| &r.allocation_id == allocation_id) {
                Some(index) => state.pending.remove(index),
                None => return false,
            }
        };
        self.grant_request(request);
        true
    }

    fn grant_request(&self, request: AllocateRequest) {
        let containers = self.config.containers_per_allocation.max(1);
        let slots = request.slots_needed / containers as u32;
        let reservations: Vec<Arc<SimReservation>> = {
            let mut state = self.state.lock();
            (0..containers)
                .map(|i| {
                    state.next_port = state.next_port.wrapping_add(1);
                    Arc::new(SimReservation {
                        id: ReservationId::new(),
                        allocation_id: request.allocation_id.clone(),
                        agent: format!("sim-agent-{}", i),
                        slots,
                        address: Address {
                            host: format!("10.0.0.{}", i + 1),
                            port: 20000 + state.next_port,
                        },
                        actor: request.task_actor.clone(),
                        auto_run: self.config.auto_run,
                        exit_on_kill: self.config.exit_on_kill,
                        starts: Mutex::new(Vec::new()),
                        kills: AtomicUsize::new(0),
                        terminated: AtomicBool::new(false),
                    })
                })
                .collect()
        };
        self.state.lock().granted.insert(
            request.allocation_id.clone(),
            Granted {
                actor: request.task_actor.clone(),
                reservations: reservations.clone(),
            },
        );
        info!(allocation_id = %request.allocation_id, containers, "sim allocation granted");
        request
            .task_actor
            .tell(RmEvent::ResourcesAllocated(ResourcesAllocated {
                allocation_id: request.allocation_id,
                reservations: reservations
                    .into_iter()
                    .map(|r| r as Arc<dyn Reservation>)
                    .collect(),
            }));
    }

    /// Asks the owning task to give its resources back.
    pub fn request_release(&self, allocation_id: &AllocationId, force_kill: bool) -> bool {
        let actor = self
            .state
            .lock()
            .granted
            .get(allocation_id)
            .map(|g| g.actor.clone());
        match actor {
            Some(actor) => actor.tell(RmEvent::ReleaseResources(ReleaseResources {
                allocation_id: allocation_id.clone(),
                force_kill,
            })),
            None => false,
        }
    }

    pub fn report_running(&self, allocation_id: &AllocationId) {
        for reservation in self.reservations(allocation_id) {
            reservation.report_running();
        }
    }

    /// Terminates every container of an allocation; the first one carries
    /// `failure`, the rest exit cleanly.
    pub fn report_exit(&self, allocation_id: &AllocationId, failure: Option<ContainerFailure>) {
        let mut failure = failure;
        for reservation in self.reservations(allocation_id) {
            reservation.report_exit(failure.take());
        }
    }
}

#[async_trait]
impl ResourceManager for SimResourceManager {
    async fn allocate(&self, request: AllocateRequest) -> RmResult<()> {
        self.record(RmCall::Allocate {
            allocation_id: request.allocation_id.clone(),
            slots: request.slots_needed,
            non_preemptible: request.non_preemptible,
        });
        if self.config.auto_grant {
            self.grant_request(request);
        } else {
            debug!(allocation_id = %request.allocation_id, "sim allocation queued");
            self.state.lock().pending.push(request);
        }
        Ok(())
    }

    async fn release(&self, allocation_id: &AllocationId) -> RmResult<()> {
        self.record(RmCall::Release(allocation_id.clone()));
        let mut state = self.state.lock();
        state.pending.retain(|r| &r.allocation_id != allocation_id);
        state.granted.remove(allocation_id);
        Ok(())
    }

    async fn set_group_max_slots(&self, job_id: &JobId, _pool: &str, max_slots: Option<u32>) -> RmResult<()> {
        self.check_groups()?;
        self.record(RmCall::SetMaxSlots {
            job_id: job_id.clone(),
            max_slots,
        });
        Ok(())
    }

    async fn set_group_weight(&self, job_id: &JobId, _pool: &str, weight: f64) -> RmResult<()> {
        self.check_groups()?;
        self.record(RmCall::SetWeight {
            job_id: job_id.clone(),
            weight,
        });
        Ok(())
    }

    async fn set_group_priority(&self, job_id: &JobId, _pool: &str, priority: u32) -> RmResult<()> {
        if !self.config.support_priority {
            return Err(RmError::Unsupported("set_group_priority".to_string()));
        }
        self.record(RmCall::SetPriority {
            job_id: job_id.clone(),
            priority,
        });
        Ok(())
    }

    async fn resolve_resource_pool(&self, name: Option<&str>, slots: u32) -> RmResult<String> {
        let pool = match name {
            Some(name) => self
                .config
                .pools
                .iter()
                .find(|p| p.as_str() == name)
                .ok_or_else(|| RmError::PoolNotFound(name.to_string()))?,
            None => self
                .config
                .pools
                .first()
                .ok_or_else(|| RmError::PoolNotFound("default".to_string()))?,
        };
        debug!(pool = %pool, slots, "resolved resource pool");
        Ok(pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tn_types::TaskId;
    use tokio::sync::mpsc;

    fn request(tx: mpsc::UnboundedSender<RmEvent>, run_id: u32) -> AllocateRequest {
        let task_id = TaskId("1.task".into());
        AllocateRequest {
            allocation_id: AllocationId::new(&task_id, run_id),
            task_id,
            job_id: JobId::new(),
            name: "test".into(),
            slots_needed: 2,
            resource_pool: "default".into(),
            fitting_requirements: Default::default(),
            non_preemptible: false,
            task_actor: TaskActorRef::new(tx, |event| event),
        }
    }

    #[tokio::test]
    async fn auto_grant_tells_the_task() {
        let rm = SimResourceManager::new(SimConfig {
            containers_per_allocation: 2,
            ..SimConfig::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        rm.allocate(request(tx, 1)).await.unwrap();

        match rx.recv().await.unwrap() {
            RmEvent::ResourcesAllocated(msg) => {
                assert_eq!(msg.reservations.len(), 2);
                assert_eq!(msg.reservations[0].summary().slots, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(rm.allocate_count(), 1);
    }

    #[tokio::test]
    async fn manual_grant_and_release() {
        let rm = SimResourceManager::new(SimConfig {
            auto_grant: false,
            ..SimConfig::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = request(tx, 1);
        let id = req.allocation_id.clone();
        rm.allocate(req).await.unwrap();
        assert_eq!(rm.pending(), vec![id.clone()]);
        assert!(rx.try_recv().is_err());

        assert!(rm.grant(&id));
        assert!(matches!(rx.recv().await, Some(RmEvent::ResourcesAllocated(_))));
        assert_eq!(rm.granted(), vec![id.clone()]);

        rm.release(&id).await.unwrap();
        assert!(rm.granted().is_empty());
        assert_eq!(rm.release_count(), 1);
    }

    #[tokio::test]
    async fn kill_reports_termination_once() {
        let rm = SimResourceManager::with_defaults();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = request(tx, 1);
        let id = req.allocation_id.clone();
        rm.allocate(req).await.unwrap();
        let _ = rx.recv().await;

        let reservation = rm.reservations(&id).remove(0);
        reservation.kill();
        reservation.kill();
        assert_eq!(reservation.kill_count(), 2);
        assert!(matches!(
            rx.recv().await,
            Some(RmEvent::ContainerStateChanged(ContainerStateChanged {
                state: ContainerState::Terminated,
                ..
            }))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsupported_priority_and_unknown_pool() {
        let rm = SimResourceManager::new(SimConfig {
            support_priority: false,
            ..SimConfig::default()
        });
        let err = rm.set_group_priority(&JobId::new(), "default", 10).await.unwrap_err();
        assert!(matches!(err, RmError::Unsupported(_)));
        assert_eq!(rm.resolve_resource_pool(None, 1).await.unwrap(), "default");
        assert!(matches!(
            rm.resolve_resource_pool(Some("gpu"), 1).await,
            Err(RmError::PoolNotFound(_))
        ));
    }
}
