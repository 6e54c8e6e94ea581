use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::config::CheckpointStorageConfig;
use crate::ids::{ExperimentId, TrialId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Active,
    Deleted,
}

/// A model checkpoint reported by a trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub uuid: Uuid,
    pub experiment_id: ExperimentId,
    pub trial_id: TrialId,
    pub total_batches: u64,
    /// Validation metric at the time the checkpoint was taken, if any.
    pub metric: Option<f64>,
    pub state: CheckpointState,
    pub reported_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(experiment_id: ExperimentId, trial_id: TrialId, total_batches: u64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            experiment_id,
            trial_id,
            total_batches,
            metric: None,
            state: CheckpointState::Active,
            reported_at: Utc::now(),
        }
    }

    pub fn with_metric(mut self, metric: f64) -> Self {
        self.metric = Some(metric);
        self
    }
}

fn by_metric(smaller_is_better: bool) -> impl Fn(&&Checkpoint, &&Checkpoint) -> Ordering {
    move |a, b| {
        let (a, b) = match (a.metric, b.metric) {
            (Some(a), Some(b)) => (a, b),
            (Some(_), None) => return Ordering::Less,
            (None, Some(_)) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
        };
        let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        if smaller_is_better {
            ord
        } else {
            ord.reverse()
        }
    }
}

/// Selects the active checkpoints that the storage policy no longer retains.
pub fn checkpoints_to_gc(
    checkpoints: &[Checkpoint],
    policy: &CheckpointStorageConfig,
    smaller_is_better: bool,
) -> Vec<Uuid> {
    let active: Vec<&Checkpoint> = checkpoints
        .iter()
        .filter(|c| c.state == CheckpointState::Active)
        .collect();

    let mut keep: HashSet<Uuid> = HashSet::new();

    let mut best = active.clone();
    best.sort_by(by_metric(smaller_is_better));
    keep.extend(best.iter().take(policy.save_experiment_best).map(|c| c.uuid));

    let mut per_trial: BTreeMap<TrialId, Vec<&Checkpoint>> = BTreeMap::new();
    for ckpt in &active {
        per_trial.entry(ckpt.trial_id).or_default().push(ckpt);
    }
    for mut trial_ckpts in per_trial.into_values() {
        trial_ckpts.sort_by(|a, b| {
            b.total_batches
                .cmp(&a.total_batches)
                .then(b.reported_at.cmp(&a.reported_at))
        });
        keep.extend(trial_ckpts.iter().take(policy.save_trial_latest).map(|c| c.uuid));

        trial_ckpts.sort_by(by_metric(smaller_is_better));
        keep.extend(
            trial_ckpts
                .iter()
                .filter(|c| c.metric.is_some())
                .take(policy.save_trial_best)
                .map(|c| c.uuid),
        );
    }

    active
        .into_iter()
        .filter(|c| !keep.contains(&c.uuid))
        .map(|c| c.uuid)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ckpt(trial: i32, batches: u64, metric: f64) -> Checkpoint {
        Checkpoint::new(ExperimentId(1), TrialId(trial), batches).with_metric(metric)
    }

    #[test]
    fn keeps_latest_and_best_per_trial() {
        let checkpoints = vec![ckpt(1, 100, 0.5), ckpt(1, 200, 0.9), ckpt(1, 300, 0.7)];
        let policy = CheckpointStorageConfig {
            save_experiment_best: 0,
            save_trial_best: 1,
            save_trial_latest: 1,
        };
        let gc = checkpoints_to_gc(&checkpoints, &policy, true);
        // latest is batch 300, best (smallest) is batch 100
        assert_eq!(gc, vec![checkpoints[1].uuid]);
    }

    #[test]
    fn larger_is_better_flips_best() {
        let checkpoints = vec![ckpt(1, 100, 0.5), ckpt(1, 200, 0.9), ckpt(1, 300, 0.7)];
        let policy = CheckpointStorageConfig {
            save_experiment_best: 0,
            save_trial_best: 1,
            save_trial_latest: 1,
        };
        let gc = checkpoints_to_gc(&checkpoints, &policy, false);
        assert_eq!(gc, vec![checkpoints[0].uuid]);
    }

    #[test]
    fn experiment_best_spans_trials() {
        let checkpoints = vec![ckpt(1, 100, 0.1), ckpt(1, 200, 0.9), ckpt(2, 100, 0.8), ckpt(2, 200, 0.2)];
        let policy = CheckpointStorageConfig {
            save_experiment_best: 1,
            save_trial_best: 0,
            save_trial_latest: 0,
        };
        let gc = checkpoints_to_gc(&checkpoints, &policy, true);
        assert_eq!(gc.len(), 3);
        assert!(!gc.contains(&checkpoints[0].uuid));
    }

    #[test]
    fn deleted_checkpoints_are_ignored() {
        let mut deleted = ckpt(1, 50, 0.3);
        deleted.state = CheckpointState::Deleted;
        let policy = CheckpointStorageConfig {
            save_experiment_best: 0,
            save_trial_best: 0,
            save_trial_latest: 0,
        };
        assert!(checkpoints_to_gc(&[deleted], &policy, true).is_empty());
    }
}
