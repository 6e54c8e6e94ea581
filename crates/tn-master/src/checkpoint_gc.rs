//! Checkpoint garbage collection.
//!
//! A GC task is a one-shot, non-preemptible allocation that runs the GC image
//! against a list of checkpoints. Checkpoints are only marked deleted once the
//! container exits cleanly; a failed run leaves them active so the next
//! collection picks them up again.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use tn_store::{AllocationRow, TaskLog};
use tn_types::{AllocationId, ExperimentId, JobId, TaskId, TnError};

use crate::allocation::{
    Allocation, AllocationExit, AllocationMsg, AllocationSettings, AllocationTimer, ExitKind, SelfTimers,
};
use crate::rm::{AllocateRequest, FittingRequirements, RmEvent, TaskActorRef};
use crate::task::{GcTaskSpec, TaskSpec};
use crate::MasterContext;

#[derive(Debug, Clone, PartialEq)]
pub struct GcRequest {
    pub experiment_id: ExperimentId,
    pub job_id: JobId,
    pub resource_pool: String,
    pub to_delete: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GcOutcome {
    /// Number of checkpoints marked deleted.
    Deleted(usize),
    Failed(String),
}

#[derive(Debug)]
enum GcMsg {
    Rm(RmEvent),
    Timer(AllocationId, AllocationTimer),
}

fn gc_session(task_id: &TaskId) -> String {
    format!("gc/{}", task_id)
}

/// Runs one GC task in the background.
pub fn spawn_checkpoint_gc(ctx: MasterContext, request: GcRequest) -> JoinHandle<GcOutcome> {
    tokio::spawn(async move {
        let task_id = TaskId::for_gc(request.experiment_id);
        let experiment_id = request.experiment_id;
        match run_gc(&ctx, &task_id, request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(%experiment_id, task_id = %task_id, error = %err, "checkpoint gc failed");
                GcOutcome::Failed(err.to_string())
            }
        }
    })
}

async fn run_gc(ctx: &MasterContext, task_id: &TaskId, request: GcRequest) -> Result<GcOutcome, TnError> {
    let session = gc_session(task_id);
    ctx.store.start_session(&session).await?;

    let allocation_id = AllocationId::new(task_id, 1);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let timers = SelfTimers::new(tx.clone(), GcMsg::Timer);
    let mut allocation = Allocation::new(
        allocation_id.clone(),
        1,
        AllocationSettings {
            preemptible: false,
            rendezvous: false,
            kill_cooldown: ctx.config.kill_cooldown(),
            rendezvous_timeout: ctx.config.rendezvous_timeout(),
            preemption_timeout: ctx.config.preemption_timeout(),
        },
    );
    let spec = GcTaskSpec {
        experiment_id: request.experiment_id,
        image: ctx.config.gc_image.clone(),
        to_delete: request.to_delete.clone(),
    };

    let allocated = ctx
        .rm
        .allocate(AllocateRequest {
            allocation_id: allocation_id.clone(),
            task_id: task_id.clone(),
            job_id: request.job_id.clone(),
            name: format!("Checkpoint GC (Experiment {})", request.experiment_id),
            slots_needed: 0,
            resource_pool: request.resource_pool.clone(),
            fitting_requirements: FittingRequirements::default(),
            non_preemptible: true,
            task_actor: TaskActorRef::new(tx, GcMsg::Rm),
        })
        .await;
    if let Err(err) = allocated {
        if let Err(session_err) = ctx.store.delete_session(&session).await {
            warn!(%allocation_id, error = %session_err, "failed to delete gc session");
        }
        return Err(err.into());
    }
    info!(experiment_id = %request.experiment_id, %allocation_id, checkpoints = request.to_delete.len(), "checkpoint gc requested");

    let mut logs = Vec::new();
    let exit = loop {
        let Some(msg) = rx.recv().await else {
            break None;
        };
        let result = match msg {
            GcMsg::Rm(RmEvent::ResourcesAllocated(msg)) if msg.allocation_id == allocation_id => {
                let row = AllocationRow::new(allocation_id.clone(), task_id.clone(), 0);
                if let Err(err) = ctx.store.add_allocation(row).await {
                    warn!(%allocation_id, error = %err, "failed to record gc allocation");
                }
                allocation.resources_allocated(msg.reservations);
                allocation.start(|_| TaskSpec::CheckpointGc(spec.clone()));
                Ok(None)
            }
            GcMsg::Rm(RmEvent::ContainerLog(log)) => {
                logs.push(TaskLog::new(task_id.clone(), Some(allocation_id.clone()), log.message));
                Ok(None)
            }
            GcMsg::Rm(RmEvent::ContainerStateChanged(msg)) if msg.allocation_id == allocation_id => {
                allocation.process(AllocationMsg::ContainerStateChanged(msg), &timers)
            }
            GcMsg::Rm(RmEvent::ReleaseResources(msg)) if msg.allocation_id == allocation_id => {
                allocation.process(AllocationMsg::Release(msg), &timers)
            }
            GcMsg::Timer(id, timer) if id == allocation_id => allocation.process(AllocationMsg::Timer(timer), &timers),
            other => {
                warn!(%allocation_id, msg = ?other, "ignoring message for another allocation");
                Ok(None)
            }
        };
        logs.extend(
            allocation
                .drain_logs()
                .into_iter()
                .map(|line| TaskLog::new(task_id.clone(), Some(allocation_id.clone()), line)),
        );
        match result {
            Ok(Some(exit)) => break Some(exit),
            Ok(None) => {}
            Err(err) => warn!(%allocation_id, error = %err, "gc allocation rejected message"),
        }
    };

    let messages: Vec<String> = logs.iter().map(|l| l.message.clone()).collect();
    if !logs.is_empty() {
        if let Err(err) = ctx.store.add_task_logs(logs).await {
            warn!(%allocation_id, error = %err, "failed to persist gc logs");
        }
    }

    let outcome = match &exit {
        Some(AllocationExit {
            kind: ExitKind::UserRequestedStop | ExitKind::Preempted,
            ..
        }) => match ctx.store.mark_checkpoints_deleted(&request.to_delete).await {
            Ok(()) => {
                info!(experiment_id = %request.experiment_id, checkpoints = request.to_delete.len(), "checkpoints deleted");
                GcOutcome::Deleted(request.to_delete.len())
            }
            Err(err) => {
                error!(experiment_id = %request.experiment_id, error = %err, "failed to mark checkpoints deleted");
                GcOutcome::Failed(TnError::from(err).to_string())
            }
        },
        Some(exit) => {
            error!(
                experiment_id = %request.experiment_id,
                %allocation_id,
                exit = %exit,
                logs = ?messages,
                "checkpoint gc task failed"
            );
            GcOutcome::Failed(exit.to_string())
        }
        None => GcOutcome::Failed("gc task mailbox closed".to_string()),
    };

    if !allocation.is_pending() {
        let reason = exit.as_ref().map(|e| e.to_string());
        if let Err(err) = ctx.store.complete_allocation(&allocation_id, reason).await {
            warn!(%allocation_id, error = %err, "failed to complete gc allocation");
        }
    }
    if let Err(err) = ctx.store.delete_session(&session).await {
        warn!(%allocation_id, error = %err, "failed to delete gc session");
    }
    if let Err(err) = ctx.rm.release(&allocation_id).await {
        warn!(%allocation_id, error = %err, "failed to release gc allocation");
    }
    Ok(outcome)
}
