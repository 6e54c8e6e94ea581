//! The searcher operation protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::hparams::HParams;
use crate::ids::RequestId;
use crate::state::State;

/// Request to create a trial with the given hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Create {
    pub request_id: RequestId,
    pub hparams: HParams,
    pub trial_seed: u32,
    /// Explicit warm-start checkpoint; overrides the experiment default.
    #[serde(default)]
    pub checkpoint: Option<Uuid>,
}

impl Create {
    pub fn new(request_id: RequestId, hparams: HParams, trial_seed: u32) -> Self {
        Self {
            request_id,
            hparams,
            trial_seed,
            checkpoint: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: Uuid) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }
}

/// Train the trial until `length` units and report a validation metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateAfter {
    pub request_id: RequestId,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    pub request_id: RequestId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shutdown {
    pub failure: bool,
    pub cancel: bool,
}

impl Shutdown {
    /// Stopping state the experiment moves into when the searcher shuts down.
    pub fn stopping_state(&self) -> State {
        if self.failure {
            State::StoppingError
        } else if self.cancel {
            State::StoppingCanceled
        } else {
            State::StoppingCompleted
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Create(Create),
    ValidateAfter(ValidateAfter),
    Close(Close),
    Shutdown(Shutdown),
}

impl Operation {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Operation::Create(op) => Some(op.request_id),
            Operation::ValidateAfter(op) => Some(op.request_id),
            Operation::Close(op) => Some(op.request_id),
            Operation::Shutdown(_) => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create(op) => write!(f, "Create({})", op.request_id),
            Operation::ValidateAfter(op) => {
                write!(f, "ValidateAfter({}, {})", op.request_id, op.length)
            }
            Operation::Close(op) => write!(f, "Close({})", op.request_id),
            Operation::Shutdown(op) => {
                write!(f, "Shutdown(failure={}, cancel={})", op.failure, op.cancel)
            }
        }
    }
}

/// Why a trial stopped before the searcher closed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitedReason {
    Errored,
    UserCanceled,
    InvalidHp,
}

impl fmt::Display for ExitedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitedReason::Errored => f.write_str("errored"),
            ExitedReason::UserCanceled => f.write_str("user canceled"),
            ExitedReason::InvalidHp => f.write_str("invalid hyperparameters"),
        }
    }
}

/// What the experiment has asked of one trial so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSearcherState {
    pub create: Create,
    pub op: Option<ValidateAfter>,
    pub complete: bool,
    pub closed: bool,
}

impl TrialSearcherState {
    /// State recorded when a `Create` is applied: nothing to train yet.
    pub fn created(create: Create) -> Self {
        Self {
            create,
            op: None,
            complete: true,
            closed: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.complete && self.closed
    }
}
