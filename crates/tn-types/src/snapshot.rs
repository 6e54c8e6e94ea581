//! Durable snapshot formats for experiments and trials.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::SnapshotError;
use crate::ids::RequestId;
use crate::operations::TrialSearcherState;

/// Version written by this build.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Upgrades a snapshot one version forward.
pub type Shim = fn(serde_json::Value) -> Result<serde_json::Value, SnapshotError>;

/// Shims keyed by the version they upgrade from.
const SHIMS: &[(u32, Shim)] = &[];

/// Brings a raw snapshot written at `version` up to [`SNAPSHOT_VERSION`].
pub fn upgrade_snapshot(
    mut value: serde_json::Value,
    version: u32,
) -> Result<serde_json::Value, SnapshotError> {
    if version > SNAPSHOT_VERSION {
        return Err(SnapshotError::TooNew {
            found: version,
            supported: SNAPSHOT_VERSION,
        });
    }
    for from in version..SNAPSHOT_VERSION {
        let shim = SHIMS
            .iter()
            .find(|(v, _)| *v == from)
            .map(|(_, shim)| *shim)
            .ok_or(SnapshotError::MissingShim(from))?;
        value = shim(value)?;
    }
    Ok(value)
}

fn decode<T: for<'de> Deserialize<'de>>(version: u32, bytes: &[u8]) -> Result<T, SnapshotError> {
    let raw: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| SnapshotError::Malformed(e.to_string()))?;
    let upgraded = upgrade_snapshot(raw, version)?;
    serde_json::from_value(upgraded).map_err(|e| SnapshotError::Malformed(e.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SnapshotError> {
    serde_json::to_vec(value).map_err(|e| SnapshotError::Malformed(e.to_string()))
}

/// Experiment-side half of a snapshot: searcher state plus what every trial
/// has been asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub searcher_state: serde_json::Value,
    pub trial_searcher_state: BTreeMap<RequestId, TrialSearcherState>,
}

impl ExperimentSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        encode(self)
    }

    pub fn decode(version: u32, bytes: &[u8]) -> Result<Self, SnapshotError> {
        decode(version, bytes)
    }
}

/// Trial-side half of a snapshot: the run sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialSnapshot {
    pub request_id: RequestId,
    pub run_id: u32,
    pub restarts: u32,
}

impl TrialSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        encode(self)
    }

    pub fn decode(version: u32, bytes: &[u8]) -> Result<Self, SnapshotError> {
        decode(version, bytes)
    }
}
