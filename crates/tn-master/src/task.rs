use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tn_types::{AllocationId, ExperimentId, HParams, RequestId, TrialId};

/// Rendezvous coordinates handed to each container of a trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousKeys {
    pub allocation_id: AllocationId,
    pub rank: usize,
    pub num_containers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialTaskSpec {
    pub experiment_id: ExperimentId,
    pub trial_id: TrialId,
    pub request_id: RequestId,
    pub run_id: u32,
    pub hparams: HParams,
    pub trial_seed: u32,
    /// Checkpoint to resume from, if any.
    pub latest_checkpoint: Option<Uuid>,
    pub latest_batch: u64,
    pub rendezvous: RendezvousKeys,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcTaskSpec {
    pub experiment_id: ExperimentId,
    pub image: String,
    pub to_delete: Vec<Uuid>,
}

/// What a reservation is asked to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSpec {
    Trial(TrialTaskSpec),
    CheckpointGc(GcTaskSpec),
}
