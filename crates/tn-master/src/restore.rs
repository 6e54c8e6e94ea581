//! Rebuilds experiment and trial actors from durable state after a restart.
//!
//! Allocations never survive a restart. Only the logical state is recovered:
//! searcher state, what each trial was asked to do, and each trial's run
//! sequencer. Trials then request fresh allocations on their own.

use std::collections::BTreeMap;
use tracing::{error, info};

use tn_store::{ExperimentRow, Store, TrialRow};
use tn_types::{
    ExperimentId, ExperimentSnapshot, RequestId, State, StateWithReason, TnError, TrialSearcherState,
    TrialSnapshot,
};

use crate::experiment::{
    experiment_session, resolve_warm_start, spawn_experiment, ExperimentHandle, ExperimentInit,
    ExperimentStart,
};
use crate::MasterContext;

/// What to do with one trial recorded in an experiment snapshot.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TrialRestore {
    /// Never durably created: start it again from its `Create`.
    Replay,
    /// Reached a terminal state before the restart.
    Finished,
    /// Persisted but the experiment never saw it created.
    NotifyCreated(TrialRow),
    Resume { row: TrialRow, snapshot: TrialSnapshot },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RestorePlan {
    pub trial_searcher_state: BTreeMap<RequestId, TrialSearcherState>,
    pub trials: Vec<(RequestId, TrialRestore)>,
}

pub(crate) async fn plan_trials(
    store: &dyn Store,
    experiment_id: ExperimentId,
    trial_searcher_state: BTreeMap<RequestId, TrialSearcherState>,
) -> Result<RestorePlan, TnError> {
    let mut trials = Vec::with_capacity(trial_searcher_state.len());
    for request_id in trial_searcher_state.keys().copied() {
        let row = match store.trial_by_request_id(experiment_id, request_id).await {
            Ok(row) => row,
            // A row may exist that we cannot see; replaying would duplicate it.
            Err(err) => {
                error!(%experiment_id, %request_id, error = %err, "failed to load trial, closing it");
                trials.push((request_id, TrialRestore::Finished));
                continue;
            }
        };
        let action = match row {
            None => TrialRestore::Replay,
            Some(row) if row.state.is_terminal() => TrialRestore::Finished,
            Some(row) => match store.trial_snapshot(row.id).await {
                Err(err) => {
                    error!(%experiment_id, %request_id, error = %err, "failed to load trial snapshot, closing it");
                    TrialRestore::Finished
                }
                Ok(None) => TrialRestore::NotifyCreated(row),
                Ok(Some(record)) => TrialRestore::Resume {
                    snapshot: TrialSnapshot::decode(record.version, &record.content)?,
                    row,
                },
            },
        };
        trials.push((request_id, action));
    }
    Ok(RestorePlan {
        trial_searcher_state,
        trials,
    })
}

/// Restores one experiment. Returns `None` if it only needed to be finished.
pub async fn restore_experiment(
    ctx: &MasterContext,
    row: ExperimentRow,
) -> Result<Option<ExperimentHandle>, TnError> {
    let store = ctx.store.as_ref();
    if let Some(terminal) = row.state.terminal() {
        info!(experiment_id = %row.id, state = %row.state, "experiment was stopping, finishing it");
        store
            .save_experiment_state(row.id, &StateWithReason::new(terminal, row.reason.clone()))
            .await?;
        store.delete_snapshots_for_experiment(row.id).await?;
        store.delete_session(&experiment_session(row.id)).await?;
        return Ok(None);
    }

    let mut searcher = (ctx.searchers)(&row.config);
    let warm_start = resolve_warm_start(store, &row.config).await?;
    let start = match store.experiment_snapshot(row.id).await? {
        None => ExperimentStart::Fresh,
        Some(record) => {
            let snapshot = ExperimentSnapshot::decode(record.version, &record.content)?;
            searcher.restore(snapshot.searcher_state)?;
            ExperimentStart::Restored(plan_trials(store, row.id, snapshot.trial_searcher_state).await?)
        }
    };
    store.start_session(&experiment_session(row.id)).await?;

    info!(experiment_id = %row.id, state = %row.state, "restoring experiment");
    let init = ExperimentInit {
        id: row.id,
        job_id: row.job_id,
        config: row.config,
        state: StateWithReason::new(row.state, row.reason),
        warm_start,
    };
    Ok(Some(spawn_experiment(ctx.clone(), init, searcher, start)))
}

/// Restores every non-terminal experiment. One experiment failing to restore
/// marks it errored and does not stop the others.
pub async fn restore_all(ctx: &MasterContext) -> Result<Vec<ExperimentHandle>, TnError> {
    let rows = ctx.store.non_terminal_experiments().await?;
    let mut handles = Vec::with_capacity(rows.len());
    for row in rows {
        let id = row.id;
        match restore_experiment(ctx, row).await {
            Ok(Some(handle)) => handles.push(handle),
            Ok(None) => {}
            Err(err) => {
                error!(experiment_id = %id, error = %err, "failed to restore experiment");
                let state = StateWithReason::new(State::Errored, format!("failed to restore experiment: {}", err));
                if let Err(err) = ctx.store.save_experiment_state(id, &state).await {
                    error!(experiment_id = %id, error = %err, "failed to mark experiment errored");
                }
            }
        }
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tn_store::{MemoryStore, NewTrial, TrialSnapshotWrite};
    use tn_types::{
        Create, ExperimentConfig, HParams, JobId, SearchMethodConfig, SearcherConfig, TaskId, TrialId,
        SNAPSHOT_VERSION,
    };

    fn config() -> ExperimentConfig {
        ExperimentConfig::new(
            "restore",
            SearcherConfig::new("loss", SearchMethodConfig::Single { max_length: 10 }),
        )
    }

    async fn add_trial(store: &MemoryStore, experiment_id: ExperimentId, request_id: RequestId) -> TrialId {
        store
            .add_trial(NewTrial {
                experiment_id,
                request_id,
                task_id: TaskId::for_trial(experiment_id, request_id),
                hparams: HParams::new(),
                seed: 0,
                warm_start_checkpoint: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn plan_classifies_each_recorded_trial() {
        let store = MemoryStore::new();
        let experiment = store.add_experiment(config(), JobId::new()).await.unwrap();

        let replay = RequestId::new();
        let finished = RequestId::new();
        let notify = RequestId::new();
        let resume = RequestId::new();

        let finished_id = add_trial(&store, experiment.id, finished).await;
        store.update_trial_state(finished_id, State::Completed).await.unwrap();
        add_trial(&store, experiment.id, notify).await;
        let resume_id = add_trial(&store, experiment.id, resume).await;
        store.update_trial_run_id(resume_id, 2).await.unwrap();

        let trial_snapshot = TrialSnapshot {
            request_id: resume,
            run_id: 3,
            restarts: 1,
        };
        store
            .save_snapshot(
                experiment.id,
                Some(TrialSnapshotWrite {
                    trial_id: resume_id,
                    request_id: resume,
                    content: trial_snapshot.encode().unwrap(),
                }),
                SNAPSHOT_VERSION,
                b"{}".to_vec(),
            )
            .await
            .unwrap();

        let states: BTreeMap<RequestId, TrialSearcherState> = [replay, finished, notify, resume]
            .into_iter()
            .map(|id| (id, TrialSearcherState::created(Create::new(id, HParams::new(), 0))))
            .collect();
        let plan = plan_trials(&store, experiment.id, states).await.unwrap();
        let action = |id: RequestId| {
            plan.trials
                .iter()
                .find(|(r, _)| *r == id)
                .map(|(_, a)| a.clone())
                .unwrap()
        };

        assert_eq!(action(replay), TrialRestore::Replay);
        assert_eq!(action(finished), TrialRestore::Finished);
        assert!(matches!(action(notify), TrialRestore::NotifyCreated(row) if row.request_id == notify));
        match action(resume) {
            TrialRestore::Resume { row, snapshot } => {
                assert_eq!(row.run_id, 2);
                assert_eq!(snapshot, trial_snapshot);
            }
            other => panic!("expected resume, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_trial_lookup_closes_only_that_trial() {
        let store = MemoryStore::new();
        let experiment = store.add_experiment(config(), JobId::new()).await.unwrap();
        let broken = RequestId::new();
        let healthy = RequestId::new();
        add_trial(&store, experiment.id, healthy).await;
        store.fail_trial_lookup(broken);

        let states: BTreeMap<RequestId, TrialSearcherState> = [broken, healthy]
            .into_iter()
            .map(|id| (id, TrialSearcherState::created(Create::new(id, HParams::new(), 0))))
            .collect();
        let plan = plan_trials(&store, experiment.id, states).await.unwrap();

        assert_eq!(plan.trials.len(), 2);
        for (request_id, action) in &plan.trials {
            if *request_id == broken {
                assert_eq!(*action, TrialRestore::Finished);
            } else {
                assert!(matches!(action, TrialRestore::NotifyCreated(row) if row.request_id == healthy));
            }
        }
    }

    #[tokio::test]
    async fn corrupt_trial_snapshot_fails_the_plan() {
        let store = MemoryStore::new();
        let experiment = store.add_experiment(config(), JobId::new()).await.unwrap();
        let request_id = RequestId::new();
        let trial_id = add_trial(&store, experiment.id, request_id).await;
        store
            .save_snapshot(
                experiment.id,
                Some(TrialSnapshotWrite {
                    trial_id,
                    request_id,
                    content: b"not json".to_vec(),
                }),
                SNAPSHOT_VERSION,
                b"{}".to_vec(),
            )
            .await
            .unwrap();

        let states = BTreeMap::from([(
            request_id,
            TrialSearcherState::created(Create::new(request_id, HParams::new(), 0)),
        )]);
        let err = plan_trials(&store, experiment.id, states).await.unwrap_err();
        assert!(matches!(err, TnError::Snapshot(_)));
    }
}
