#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;

use tn_master::sim::{RmCall, SimConfig, SimResourceManager};
use tn_master::{ExperimentHandle, Master, MasterContext, SearcherFactory, TrialHandle};
use tn_searcher::{SearchRunner, Searcher, SearcherResult};
use tn_store::MemoryStore;
use tn_types::{
    AllocationId, ExitedReason, ExperimentConfig, MasterConfig, Operation, RequestId, SearchMethodConfig,
    SearcherConfig, ValidateAfter,
};

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub rm: Arc<SimResourceManager>,
    pub master: Master,
}

impl Harness {
    pub fn new(sim: SimConfig) -> Self {
        Self::build(Arc::new(MemoryStore::new()), sim, None)
    }

    pub fn with_searchers(sim: SimConfig, searchers: SearcherFactory) -> Self {
        Self::build(Arc::new(MemoryStore::new()), sim, Some(searchers))
    }

    /// A fresh master over an existing store, as after a restart.
    pub fn on_store(store: Arc<MemoryStore>, sim: SimConfig, searchers: Option<SearcherFactory>) -> Self {
        Self::build(store, sim, searchers)
    }

    fn build(store: Arc<MemoryStore>, sim: SimConfig, searchers: Option<SearcherFactory>) -> Self {
        let rm = Arc::new(SimResourceManager::new(sim));
        let mut ctx = MasterContext::new(store.clone(), rm.clone(), MasterConfig::default());
        if let Some(searchers) = searchers {
            ctx = ctx.with_searchers(searchers);
        }
        Self {
            store,
            rm,
            master: Master::new(ctx),
        }
    }

    /// Trial allocations requested so far, oldest first.
    pub fn trial_allocations(&self) -> Vec<AllocationId> {
        self.rm
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                RmCall::Allocate {
                    allocation_id,
                    non_preemptible: false,
                    ..
                } => Some(allocation_id),
                _ => None,
            })
            .collect()
    }

    pub fn gc_allocations(&self) -> Vec<AllocationId> {
        self.rm
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                RmCall::Allocate {
                    allocation_id,
                    non_preemptible: true,
                    ..
                } => Some(allocation_id),
                _ => None,
            })
            .collect()
    }

    /// Waits for the `n`th trial allocation (1-based) to be granted.
    pub async fn nth_allocation(&self, n: usize) -> AllocationId {
        assert!(until(|| self.trial_allocations().len() >= n).await, "allocation {} never requested", n);
        let id = self.trial_allocations()[n - 1].clone();
        assert!(until(|| self.rm.granted().contains(&id)).await, "allocation {} never granted", id);
        id
    }
}

pub fn single(max_length: u64) -> ExperimentConfig {
    ExperimentConfig::new(
        "scenario",
        SearcherConfig::new("loss", SearchMethodConfig::Single { max_length }),
    )
}

/// Lets every spawned actor drain its mailbox.
pub async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}

/// Yields until `check` holds. False if it never does.
pub async fn until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..10_000 {
        if check() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    check()
}

/// The single live trial of an experiment.
pub async fn only_trial(experiment: &ExperimentHandle) -> TrialHandle {
    for _ in 0..10_000 {
        let summary = experiment.describe().await.expect("experiment running");
        if let Some(request_id) = summary.live_trials.iter().next().copied() {
            if let Some(trial) = experiment.trial(request_id).await.expect("experiment running") {
                return trial;
            }
        }
        tokio::task::yield_now().await;
    }
    panic!("experiment {} never started a trial", experiment.id());
}

/// Every searcher event, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SearcherCall {
    InitialOperations,
    TrialCreated(RequestId),
    ValidationCompleted(RequestId, u64),
    TrialExitedEarly(RequestId, ExitedReason),
    TrialClosed(RequestId),
    Restore,
}

pub type CallLog = Arc<Mutex<Vec<SearcherCall>>>;

/// Wraps a searcher and records every event it sees.
pub struct Recording {
    inner: Box<dyn Searcher>,
    log: CallLog,
}

impl Recording {
    /// Factory for `SearchRunner`s that all log into `log`.
    pub fn factory(log: CallLog) -> SearcherFactory {
        Arc::new(move |config: &ExperimentConfig| {
            Box::new(Recording {
                inner: Box::new(SearchRunner::from_config(config)),
                log: log.clone(),
            }) as Box<dyn Searcher>
        })
    }

    fn record(&self, call: SearcherCall) {
        self.log.lock().push(call);
    }
}

impl Searcher for Recording {
    fn initial_operations(&mut self) -> SearcherResult<Vec<Operation>> {
        self.record(SearcherCall::InitialOperations);
        self.inner.initial_operations()
    }

    fn trial_created(&mut self, request_id: RequestId) -> SearcherResult<Vec<Operation>> {
        self.record(SearcherCall::TrialCreated(request_id));
        self.inner.trial_created(request_id)
    }

    fn validation_completed(
        &mut self,
        request_id: RequestId,
        metric: f64,
        op: &ValidateAfter,
    ) -> SearcherResult<Vec<Operation>> {
        self.record(SearcherCall::ValidationCompleted(request_id, op.length));
        self.inner.validation_completed(request_id, metric, op)
    }

    fn trial_exited_early(&mut self, request_id: RequestId, reason: ExitedReason) -> SearcherResult<Vec<Operation>> {
        self.record(SearcherCall::TrialExitedEarly(request_id, reason));
        self.inner.trial_exited_early(request_id, reason)
    }

    fn trial_closed(&mut self, request_id: RequestId) -> SearcherResult<Vec<Operation>> {
        self.record(SearcherCall::TrialClosed(request_id));
        self.inner.trial_closed(request_id)
    }

    fn set_trial_progress(&mut self, request_id: RequestId, progress: f64) {
        self.inner.set_trial_progress(request_id, progress)
    }

    fn progress(&self) -> f64 {
        self.inner.progress()
    }

    fn snapshot(&self) -> SearcherResult<serde_json::Value> {
        self.inner.snapshot()
    }

    fn restore(&mut self, state: serde_json::Value) -> SearcherResult<()> {
        self.record(SearcherCall::Restore);
        self.inner.restore(state)
    }
}

/// Replays fixed operation batches: one for the start, one for the first
/// `trial_created`. Everything else answers with nothing.
pub struct Scripted {
    initial: Vec<Operation>,
    on_created: Option<Vec<Operation>>,
}

impl Scripted {
    pub fn factory(initial: Vec<Operation>, on_created: Vec<Operation>) -> SearcherFactory {
        Arc::new(move |_: &ExperimentConfig| {
            Box::new(Scripted {
                initial: initial.clone(),
                on_created: Some(on_created.clone()),
            }) as Box<dyn Searcher>
        })
    }
}

impl Searcher for Scripted {
    fn initial_operations(&mut self) -> SearcherResult<Vec<Operation>> {
        Ok(std::mem::take(&mut self.initial))
    }

    fn trial_created(&mut self, _request_id: RequestId) -> SearcherResult<Vec<Operation>> {
        Ok(self.on_created.take().unwrap_or_default())
    }

    fn validation_completed(&mut self, _: RequestId, _: f64, _: &ValidateAfter) -> SearcherResult<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn trial_exited_early(&mut self, _: RequestId, _: ExitedReason) -> SearcherResult<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn trial_closed(&mut self, _: RequestId) -> SearcherResult<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn set_trial_progress(&mut self, _: RequestId, _: f64) {}

    fn progress(&self) -> f64 {
        0.0
    }

    fn snapshot(&self) -> SearcherResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    fn restore(&mut self, _: serde_json::Value) -> SearcherResult<()> {
        Ok(())
    }
}
