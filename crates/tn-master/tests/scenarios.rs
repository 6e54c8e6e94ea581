mod common;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use common::{only_trial, settle, single, until, CallLog, Harness, Recording, Scripted, SearcherCall};
use tn_master::rm::{ContainerFailure, FailureKind};
use tn_master::sim::{RmCall, SimConfig};
use tn_store::Store;
use tn_types::{
    AllocationError, Checkpoint, CheckpointState, CheckpointStorageConfig, Create, ExitedReason, ExperimentError, HParams, Operation,
    RequestId, RmError, Shutdown, State, TaskId, TnError, ValidateAfter,
};

fn container_failed() -> Option<ContainerFailure> {
    Some(ContainerFailure::new(FailureKind::ContainerFailed, "training script crashed").with_exit_code(1))
}

#[tokio::test]
async fn failing_container_with_no_restarts_errors_the_experiment() {
    let h = Harness::new(SimConfig::default());
    let experiment = h.master.submit_experiment(single(10).with_max_restarts(0)).await.unwrap();

    let allocation = h.nth_allocation(1).await;
    h.rm.report_exit(&allocation, container_failed());

    let end = experiment.wait_terminal().await;
    assert_eq!(end.state, State::Errored);
    assert_eq!(end.reason, "hp search failed");

    let trials = h.store.trials_for_experiment(experiment.id());
    assert_eq!(trials.len(), 1);
    assert_eq!(trials[0].state, State::Errored);
    assert_eq!(trials[0].restarts, 1);
    assert_eq!(h.trial_allocations().len(), 1);
    assert!(h.rm.granted().is_empty());
}

#[tokio::test]
async fn trial_errors_exactly_once_past_max_restarts() {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let h = Harness::with_searchers(SimConfig::default(), Recording::factory(log.clone()));
    let experiment = h.master.submit_experiment(single(10).with_max_restarts(2)).await.unwrap();

    for n in 1..=3 {
        let allocation = h.nth_allocation(n).await;
        assert!(allocation.0.ends_with(&format!(".{}", n)));
        assert_eq!(h.rm.granted(), vec![allocation.clone()]);
        h.rm.report_exit(&allocation, container_failed());
    }

    assert_eq!(experiment.wait_terminal().await.state, State::Errored);
    settle().await;
    assert_eq!(h.trial_allocations().len(), 3);
    let trial = &h.store.trials_for_experiment(experiment.id())[0];
    assert_eq!(trial.restarts, 3);
    assert_eq!(trial.run_id, 3);

    let early_exits: Vec<SearcherCall> = log
        .lock()
        .iter()
        .filter(|c| matches!(c, SearcherCall::TrialExitedEarly(..)))
        .cloned()
        .collect();
    assert_eq!(early_exits, vec![SearcherCall::TrialExitedEarly(trial.request_id, ExitedReason::Errored)]);
}

#[tokio::test]
async fn searcher_shutdown_completes_and_collects_checkpoints() {
    let request_id = RequestId::new();
    let searchers = Scripted::factory(
        vec![
            Operation::Create(Create::new(request_id, HParams::new(), 7)),
            Operation::ValidateAfter(ValidateAfter { request_id, length: 10 }),
        ],
        vec![Operation::Shutdown(Shutdown::default())],
    );
    let h = Harness::with_searchers(SimConfig::default(), searchers);
    let experiment = h.master.submit_experiment(single(10)).await.unwrap();

    let allocation = h.nth_allocation(1).await;
    assert!(until(|| experiment.state().state == State::StoppingCompleted).await);

    let trial = h.store.trials_for_experiment(experiment.id()).remove(0);
    for batches in [100, 200, 300] {
        let checkpoint = Checkpoint::new(experiment.id(), trial.id, batches);
        h.store.add_checkpoint(checkpoint).await.unwrap();
    }

    h.rm.report_exit(&allocation, None);
    let end = experiment.wait_terminal().await;
    assert_eq!(end.state, State::Completed);
    assert_eq!(h.store.experiment(experiment.id()).await.unwrap().progress, 1.0);
    assert_eq!(h.store.trials_for_experiment(experiment.id())[0].state, State::Completed);

    assert!(until(|| !h.gc_allocations().is_empty()).await, "no gc task started");
    let gc = h.gc_allocations().remove(0);
    assert!(until(|| h.rm.granted().contains(&gc)).await);
    h.rm.report_exit(&gc, None);

    let mut deleted = 0;
    for _ in 0..10_000 {
        deleted = h
            .store
            .experiment_checkpoints(experiment.id())
            .await
            .unwrap()
            .iter()
            .filter(|c| c.state == CheckpointState::Deleted)
            .count();
        if deleted == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(deleted, 2);
}

#[tokio::test]
async fn pause_without_allocation_touches_no_resources() {
    let request_id = RequestId::new();
    let searchers = Scripted::factory(vec![Operation::Create(Create::new(request_id, HParams::new(), 0))], vec![]);
    let h = Harness::with_searchers(SimConfig::default(), searchers);
    let experiment = h.master.submit_experiment(single(10)).await.unwrap();
    let trial = only_trial(&experiment).await;

    experiment.pause().await.unwrap();
    settle().await;

    assert_eq!(experiment.state().state, State::Paused);
    let summary = trial.describe().await.unwrap();
    assert_eq!(summary.state, State::Paused);
    assert_eq!(summary.allocation_id, None);
    assert_eq!(h.rm.allocate_count(), 0);
    assert_eq!(h.rm.release_count(), 0);

    experiment.pause().await.unwrap();
    experiment.activate().await.unwrap();
    settle().await;
    assert_eq!(trial.describe().await.unwrap().state, State::Active);
    assert_eq!(h.rm.allocate_count(), 0);
}

#[tokio::test]
async fn pause_releases_pending_request_and_activate_asks_again() {
    let h = Harness::new(SimConfig {
        auto_grant: false,
        ..SimConfig::default()
    });
    let experiment = h.master.submit_experiment(single(10)).await.unwrap();
    assert!(until(|| h.rm.pending().len() == 1).await);
    let first = h.rm.pending().remove(0);

    experiment.pause().await.unwrap();
    assert!(until(|| h.rm.release_count() == 1).await);
    assert!(h.rm.pending().is_empty());

    experiment.activate().await.unwrap();
    assert!(until(|| h.rm.pending().len() == 1).await);
    let second = h.rm.pending().remove(0);
    assert_ne!(first, second);
    assert!(second.0.ends_with(".2"));

    // The released request never counted as a failure.
    let trial = only_trial(&experiment).await;
    assert_eq!(trial.describe().await.unwrap().restarts, 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_after_rendezvous_preempts_then_kills_when_unacknowledged() {
    let h = Harness::new(SimConfig {
        containers_per_allocation: 2,
        auto_run: true,
        ..SimConfig::default()
    });
    let experiment = h.master.submit_experiment(single(10).with_slots_per_trial(2)).await.unwrap();
    let allocation = h.nth_allocation(1).await;
    let trial = only_trial(&experiment).await;
    let reservations = h.rm.reservations(&allocation);

    let mut watchers = Vec::new();
    for reservation in &reservations {
        watchers.push(
            trial
                .watch_rendezvous(allocation.clone(), reservation.id().clone())
                .await
                .unwrap(),
        );
    }
    for watcher in watchers {
        let info = watcher.wait().await.expect("rendezvous completes");
        assert_eq!(info.addresses.len(), 2);
    }
    let mut preemption = trial.watch_preemption(allocation.clone(), Uuid::new_v4()).await.unwrap();

    experiment.cancel().await.unwrap();
    settle().await;
    assert!(preemption.is_preempted());
    assert!(reservations.iter().all(|r| r.kill_count() == 0));
    assert_eq!(experiment.state().state, State::StoppingCanceled);

    tokio::time::advance(Duration::from_secs(3601)).await;
    settle().await;
    assert!(reservations.iter().all(|r| r.kill_count() == 1));

    assert_eq!(experiment.wait_terminal().await.state, State::Canceled);
    let request_id = trial.request_id();
    let rows = h
        .store
        .allocations_for_task(&TaskId::for_trial(experiment.id(), request_id))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].exit_reason.as_deref(), Some("allocation killed"));
}

#[tokio::test(start_paused = true)]
async fn acknowledged_cancel_exits_as_preempted() {
    let h = Harness::new(SimConfig {
        auto_run: true,
        ..SimConfig::default()
    });
    let experiment = h.master.submit_experiment(single(10)).await.unwrap();
    let allocation = h.nth_allocation(1).await;
    let trial = only_trial(&experiment).await;
    let reservation = h.rm.reservations(&allocation).remove(0);
    let watcher = trial
        .watch_rendezvous(allocation.clone(), reservation.id().clone())
        .await
        .unwrap();
    assert!(watcher.wait().await.is_some());
    let preemption = trial.watch_preemption(allocation.clone(), Uuid::new_v4()).await.unwrap();

    experiment.cancel().await.unwrap();
    assert!(preemption.wait().await);
    trial.ack_preemption(allocation.clone()).unwrap();
    settle().await;
    reservation.report_exit(None);

    assert_eq!(experiment.wait_terminal().await.state, State::Canceled);
    assert_eq!(reservation.kill_count(), 0);
    let rows = h
        .store
        .allocations_for_task(&TaskId::for_trial(experiment.id(), trial.request_id()))
        .await
        .unwrap();
    assert_eq!(rows[0].exit_reason.as_deref(), Some("allocation stopped after preemption"));
}

#[tokio::test(start_paused = true)]
async fn kill_is_resent_after_cooldown_while_containers_linger() {
    let h = Harness::new(SimConfig {
        exit_on_kill: false,
        ..SimConfig::default()
    });
    let experiment = h.master.submit_experiment(single(10)).await.unwrap();
    let allocation = h.nth_allocation(1).await;
    let reservation = h.rm.reservations(&allocation).remove(0);

    experiment.kill().await.unwrap();
    settle().await;
    assert_eq!(reservation.kill_count(), 1);

    experiment.kill().await.unwrap();
    settle().await;
    assert_eq!(reservation.kill_count(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    settle().await;
    assert_eq!(reservation.kill_count(), 2);

    reservation.report_exit(None);
    assert_eq!(experiment.wait_terminal().await.state, State::Killed);
}

#[tokio::test]
async fn stale_allocation_messages_are_rejected() {
    let h = Harness::new(SimConfig::default());
    let experiment = h.master.submit_experiment(single(10).with_max_restarts(3)).await.unwrap();
    let first = h.nth_allocation(1).await;
    let trial = only_trial(&experiment).await;
    let old_reservation = h.rm.reservations(&first).remove(0);

    h.rm.report_exit(&first, container_failed());
    let second = h.nth_allocation(2).await;
    let before = trial.describe().await.unwrap();
    assert_eq!(before.allocation_id.as_ref(), Some(&second));

    let err = trial
        .watch_rendezvous(first.clone(), old_reservation.id().clone())
        .await
        .unwrap_err();
    assert!(matches!(err, TnError::Allocation(AllocationError::Exited(id)) if id == first));
    trial.ack_preemption(first.clone()).unwrap();
    let err = trial.watch_preemption(first.clone(), Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, TnError::Allocation(AllocationError::Exited(_))));

    settle().await;
    assert_eq!(trial.describe().await.unwrap(), before);
    assert_eq!(h.trial_allocations().len(), 2);
}

#[tokio::test]
async fn run_ids_increase_and_one_allocation_is_live() {
    let h = Harness::new(SimConfig::default());
    let experiment = h.master.submit_experiment(single(10).with_max_restarts(5)).await.unwrap();

    let mut last_run = 0;
    for n in 1..=4 {
        let allocation = h.nth_allocation(n).await;
        let run_id: u32 = allocation.0.rsplit('.').next().unwrap().parse().unwrap();
        assert!(run_id > last_run);
        last_run = run_id;
        assert_eq!(h.rm.granted().len(), 1);
        h.rm.report_exit(&allocation, container_failed());
    }
    experiment.kill().await.unwrap();
    experiment.wait_terminal().await;

    let allocations = h.trial_allocations();
    let mut unique = allocations.clone();
    unique.dedup();
    assert_eq!(unique, allocations);
}

#[tokio::test]
async fn validation_closes_the_search() {
    let h = Harness::new(SimConfig {
        auto_run: true,
        ..SimConfig::default()
    });
    let experiment = h.master.submit_experiment(single(10)).await.unwrap();
    let allocation = h.nth_allocation(1).await;
    let trial = only_trial(&experiment).await;

    let op = trial.current_op().await.unwrap().expect("trial has work");
    assert_eq!(op.length, 10);
    experiment.report_trial_progress(trial.request_id(), 0.5).unwrap();
    experiment.complete_trial_operation(trial.request_id(), op, 0.25).await.unwrap();

    let err = experiment
        .complete_trial_operation(trial.request_id(), op, 0.25)
        .await
        .unwrap_err();
    assert!(matches!(err, TnError::Experiment(ExperimentError::OperationMismatch { .. })));
    let err = experiment
        .complete_trial_operation(RequestId::new(), op, 0.25)
        .await
        .unwrap_err();
    assert!(matches!(err, TnError::Experiment(ExperimentError::UnknownRequest(_))));
    assert_eq!(trial.current_op().await.unwrap(), None);

    h.rm.report_exit(&allocation, None);
    assert_eq!(experiment.wait_terminal().await.state, State::Completed);
    assert_eq!(h.trial_allocations().len(), 1);
}

#[tokio::test]
async fn unrequested_clean_exit_is_an_early_exit() {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let h = Harness::with_searchers(SimConfig::default(), Recording::factory(log.clone()));
    let experiment = h.master.submit_experiment(single(10)).await.unwrap();
    let allocation = h.nth_allocation(1).await;

    h.rm.report_exit(&allocation, None);
    assert_eq!(experiment.wait_terminal().await.state, State::Completed);

    let trial = &h.store.trials_for_experiment(experiment.id())[0];
    assert_eq!(trial.state, State::Completed);
    assert_eq!(trial.restarts, 0);
    assert!(log
        .lock()
        .contains(&SearcherCall::TrialExitedEarly(trial.request_id, ExitedReason::UserCanceled)));
}

#[tokio::test]
async fn agent_failure_restarts_without_spending_budget() {
    let h = Harness::new(SimConfig::default());
    let experiment = h.master.submit_experiment(single(10).with_max_restarts(0)).await.unwrap();
    let first = h.nth_allocation(1).await;

    h.rm.report_exit(&first, Some(ContainerFailure::new(FailureKind::AgentFailed, "agent lost")));
    let second = h.nth_allocation(2).await;
    assert_ne!(first, second);

    let trial = only_trial(&experiment).await;
    assert_eq!(trial.describe().await.unwrap().restarts, 0);
    assert_eq!(experiment.state().state, State::Active);
}

#[tokio::test]
async fn stopping_experiment_rejects_activation() {
    let h = Harness::new(SimConfig {
        exit_on_kill: false,
        ..SimConfig::default()
    });
    let experiment = h.master.submit_experiment(single(10)).await.unwrap();
    let allocation = h.nth_allocation(1).await;

    experiment.kill().await.unwrap();
    let err = experiment.activate().await.unwrap_err();
    assert!(matches!(
        err,
        TnError::Experiment(ExperimentError::FailedPrecondition {
            current: State::StoppingKilled,
            requested: State::Active,
        })
    ));
    experiment.cancel().await.unwrap();
    assert_eq!(experiment.state().state, State::StoppingKilled);

    h.rm.report_exit(&allocation, None);
    assert_eq!(experiment.wait_terminal().await.state, State::Killed);
    settle().await;
    let err = experiment.activate().await.unwrap_err();
    assert!(matches!(err, TnError::Experiment(ExperimentError::Stopped(_))));
}

#[tokio::test]
async fn snapshot_failure_disables_fault_tolerance_only() {
    let h = Harness::new(SimConfig::default());
    h.store.set_snapshot_failure(true);
    let experiment = h.master.submit_experiment(single(10)).await.unwrap();
    h.nth_allocation(1).await;
    settle().await;

    let summary = experiment.describe().await.unwrap();
    assert!(!summary.fault_tolerant);
    assert_eq!(summary.state.state, State::Active);
    assert!(h.store.experiment_snapshot(experiment.id()).await.unwrap().is_none());
}

#[tokio::test]
async fn group_settings_forward_to_the_resource_manager() {
    let h = Harness::new(SimConfig {
        support_priority: false,
        ..SimConfig::default()
    });
    let experiment = h.master.submit_experiment(single(10)).await.unwrap();

    experiment.set_weight(2.5).await.unwrap();
    experiment.set_priority(3).await.unwrap();
    experiment.set_max_slots(Some(4)).await.unwrap();

    let row = h.store.experiment(experiment.id()).await.unwrap();
    assert_eq!(row.config.resources.weight, 2.5);
    assert_eq!(row.config.resources.priority, Some(3));
    assert_eq!(row.config.resources.max_slots, Some(4));
    let calls = h.rm.calls();
    assert!(calls.iter().any(|c| matches!(c, RmCall::SetWeight { weight, .. } if *weight == 2.5)));
    assert!(calls.iter().any(|c| matches!(c, RmCall::SetMaxSlots { max_slots: Some(4), .. })));
    assert!(!calls.iter().any(|c| matches!(c, RmCall::SetPriority { .. })));
}

#[tokio::test]
async fn trial_progress_is_aggregated_and_persisted() {
    let h = Harness::new(SimConfig::default());
    let experiment = h.master.submit_experiment(single(10)).await.unwrap();
    h.nth_allocation(1).await;
    let trial = only_trial(&experiment).await;

    experiment.report_trial_progress(trial.request_id(), 0.4).unwrap();
    settle().await;

    assert!((experiment.describe().await.unwrap().progress - 0.4).abs() < 1e-9);
    let row = h.store.experiment(experiment.id()).await.unwrap();
    assert!((row.progress - 0.4).abs() < 1e-9);

    experiment.report_trial_progress(RequestId::new(), 0.9).unwrap();
    settle().await;
    assert!((experiment.describe().await.unwrap().progress - 0.4).abs() < 1e-9);
}

#[tokio::test]
async fn storage_patch_collects_newly_eligible_checkpoints() {
    let h = Harness::new(SimConfig::default());
    let experiment = h.master.submit_experiment(single(10)).await.unwrap();
    h.nth_allocation(1).await;
    assert!(until(|| h.store.trials_for_experiment(experiment.id()).len() == 1).await);

    let trial = h.store.trials_for_experiment(experiment.id()).remove(0);
    for batches in [100, 200] {
        let checkpoint = Checkpoint::new(experiment.id(), trial.id, batches).with_metric(batches as f64);
        h.store.add_checkpoint(checkpoint).await.unwrap();
    }

    let keep_nothing = CheckpointStorageConfig {
        save_experiment_best: 0,
        save_trial_best: 0,
        save_trial_latest: 0,
    };
    experiment.patch_checkpoint_storage(keep_nothing).await.unwrap();
    let row = h.store.experiment(experiment.id()).await.unwrap();
    assert_eq!(row.config.checkpoint_storage, keep_nothing);

    assert!(until(|| !h.gc_allocations().is_empty()).await, "no gc task started");
    let gc = h.gc_allocations().remove(0);
    assert!(until(|| h.rm.granted().contains(&gc)).await);
    h.rm.report_exit(&gc, None);

    let mut deleted = 0;
    for _ in 0..10_000 {
        deleted = h
            .store
            .experiment_checkpoints(experiment.id())
            .await
            .unwrap()
            .iter()
            .filter(|c| c.state == CheckpointState::Deleted)
            .count();
        if deleted == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(deleted, 2);
    assert_eq!(experiment.state().state, State::Active);
}

#[tokio::test]
async fn rejected_max_slots_is_not_persisted_later() {
    let h = Harness::new(SimConfig::default());
    let experiment = h.master.submit_experiment(single(10)).await.unwrap();

    h.rm.set_groups_unavailable(true);
    let err = experiment.set_max_slots(Some(5)).await.unwrap_err();
    assert!(matches!(err, TnError::ResourceManager(RmError::Unavailable(_))));

    h.rm.set_groups_unavailable(false);
    experiment.set_weight(2.0).await.unwrap();

    let row = h.store.experiment(experiment.id()).await.unwrap();
    assert_eq!(row.config.resources.weight, 2.0);
    assert_eq!(row.config.resources.max_slots, None);
}
