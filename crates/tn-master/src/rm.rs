//! Resource manager abstraction.
//!
//! The master never schedules containers itself: tasks ask a
//! [`ResourceManager`] for an allocation and the manager answers
//! asynchronously by telling the task actor through its [`TaskActorRef`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use tn_types::{AllocationId, JobId, ReservationId, RmError, TaskId};

use crate::task::TaskSpec;

/// Result alias for resource manager operations.
pub type RmResult<T> = Result<T, RmError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FittingRequirements {
    /// All slots must come from a single agent.
    pub single_agent: bool,
}

#[derive(Debug, Clone)]
pub struct AllocateRequest {
    pub allocation_id: AllocationId,
    pub task_id: TaskId,
    pub job_id: JobId,
    pub name: String,
    pub slots_needed: u32,
    pub resource_pool: String,
    pub fitting_requirements: FittingRequirements,
    pub non_preemptible: bool,
    pub task_actor: TaskActorRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationSummary {
    pub id: ReservationId,
    pub agent: String,
    pub slots: u32,
}

/// One scheduled container within an allocation.
pub trait Reservation: Send + Sync {
    fn summary(&self) -> ReservationSummary;

    fn start(&self, spec: TaskSpec, rank: usize);

    fn kill(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContainerState {
    Assigned,
    Running,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    ContainerFailed,
    TaskError,
    AgentError,
    AgentFailed,
    TaskAborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerFailure {
    pub kind: FailureKind,
    pub message: String,
    pub exit_code: Option<i32>,
}

impl ContainerFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

impl fmt::Display for ContainerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{:?}: {} (exit code {})", self.kind, self.message, code),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

#[derive(Clone)]
pub struct ResourcesAllocated {
    pub allocation_id: AllocationId,
    pub reservations: Vec<Arc<dyn Reservation>>,
}

impl fmt::Debug for ResourcesAllocated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcesAllocated")
            .field("allocation_id", &self.allocation_id)
            .field(
                "reservations",
                &self.reservations.iter().map(|r| r.summary().id).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// The resource manager wants its resources back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseResources {
    pub allocation_id: AllocationId,
    pub force_kill: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerStateChanged {
    pub allocation_id: AllocationId,
    pub reservation_id: ReservationId,
    pub state: ContainerState,
    pub addresses: Vec<Address>,
    /// Set once the container has terminated; `None` failure means a clean exit.
    pub failure: Option<ContainerFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLog {
    pub allocation_id: AllocationId,
    pub reservation_id: ReservationId,
    pub message: String,
}

/// Everything a resource manager (or its agents) tells a task actor.
#[derive(Debug, Clone)]
pub enum RmEvent {
    ResourcesAllocated(ResourcesAllocated),
    ReleaseResources(ReleaseResources),
    ContainerStateChanged(ContainerStateChanged),
    ContainerLog(ContainerLog),
}

impl RmEvent {
    pub fn allocation_id(&self) -> &AllocationId {
        match self {
            RmEvent::ResourcesAllocated(msg) => &msg.allocation_id,
            RmEvent::ReleaseResources(msg) => &msg.allocation_id,
            RmEvent::ContainerStateChanged(msg) => &msg.allocation_id,
            RmEvent::ContainerLog(msg) => &msg.allocation_id,
        }
    }
}

/// Mailbox address of a task actor as seen by the resource manager.
#[derive(Clone)]
pub struct TaskActorRef {
    tell: Arc<dyn Fn(RmEvent) -> bool + Send + Sync>,
}

impl TaskActorRef {
    pub fn new<M: Send + 'static>(tx: mpsc::UnboundedSender<M>, wrap: fn(RmEvent) -> M) -> Self {
        Self {
            tell: Arc::new(move |event| tx.send(wrap(event)).is_ok()),
        }
    }

    /// Delivers `event`; false if the actor has stopped.
    pub fn tell(&self, event: RmEvent) -> bool {
        (self.tell)(event)
    }
}

impl fmt::Debug for TaskActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskActorRef")
    }
}

#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Queues a request; the grant arrives later as
    /// [`RmEvent::ResourcesAllocated`].
    async fn allocate(&self, request: AllocateRequest) -> RmResult<()>;

    /// The task is done with (or no longer wants) the allocation.
    async fn release(&self, allocation_id: &AllocationId) -> RmResult<()>;

    async fn set_group_max_slots(&self, job_id: &JobId, pool: &str, max_slots: Option<u32>) -> RmResult<()>;

    async fn set_group_weight(&self, job_id: &JobId, pool: &str, weight: f64) -> RmResult<()>;

    async fn set_group_priority(&self, job_id: &JobId, pool: &str, priority: u32) -> RmResult<()>;

    /// Picks the pool a task should run in, validating that it can fit `slots`.
    async fn resolve_resource_pool(&self, name: Option<&str>, slots: u32) -> RmResult<String>;
}
