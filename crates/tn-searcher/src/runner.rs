use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use tn_types::{
    Close, Create, ExitedReason, ExperimentConfig, Operation, RequestId, SearchMethodConfig,
    SearcherError, Shutdown, ValidateAfter,
};

use crate::search::{GridSearch, RandomSearch, SearchStrategy};
use crate::searcher::{Searcher, SearcherResult};

/// Everything a [`SearchRunner`] needs to resume after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RunnerState {
    trials_requested: usize,
    requests: BTreeMap<RequestId, usize>,
    created: BTreeSet<RequestId>,
    closed: BTreeSet<RequestId>,
    failures: BTreeSet<RequestId>,
    trial_progress: BTreeMap<RequestId, f64>,
    best_metric: Option<f64>,
    shutdown: bool,
}

/// The stock searcher: trains up to `max_trials` trials drawn from a
/// [`SearchStrategy`], each to `max_length`, at most `max_concurrent` at a time.
pub struct SearchRunner {
    strategy: Box<dyn SearchStrategy>,
    max_length: u64,
    max_concurrent: usize,
    smaller_is_better: bool,
    state: RunnerState,
}

impl SearchRunner {
    pub fn new(strategy: Box<dyn SearchStrategy>, max_length: u64, max_concurrent: usize) -> Self {
        let max_concurrent = match max_concurrent {
            0 => strategy.max_trials(),
            n => n.min(strategy.max_trials()),
        };
        Self {
            strategy,
            max_length,
            max_concurrent,
            smaller_is_better: true,
            state: RunnerState::default(),
        }
    }

    pub fn from_config(config: &ExperimentConfig) -> Self {
        let space = config.hyperparameters.clone();
        let mut runner = match &config.searcher.method {
            SearchMethodConfig::Single { max_length } => {
                Self::new(Box::new(RandomSearch::new(space, 1, config.seed)), *max_length, 1)
            }
            SearchMethodConfig::Random {
                max_trials,
                max_length,
                max_concurrent_trials,
            } => Self::new(
                Box::new(RandomSearch::new(space, *max_trials, config.seed)),
                *max_length,
                *max_concurrent_trials,
            ),
            SearchMethodConfig::Grid {
                max_length,
                float_steps,
                max_concurrent_trials,
            } => Self::new(
                Box::new(GridSearch::new(&space, *float_steps, config.seed)),
                *max_length,
                *max_concurrent_trials,
            ),
        };
        runner.smaller_is_better = config.searcher.smaller_is_better;
        runner
    }

    pub fn best_metric(&self) -> Option<f64> {
        self.state.best_metric
    }

    fn create_trial(&mut self) -> Vec<Operation> {
        let index = self.state.trials_requested;
        let (hparams, seed) = self.strategy.sample(index);
        let request_id = RequestId::new();
        self.state.trials_requested += 1;
        self.state.requests.insert(request_id, index);
        debug!(searcher = self.strategy.name(), %request_id, index, "requesting trial");
        vec![
            Operation::Create(Create::new(request_id, hparams, seed)),
            Operation::ValidateAfter(ValidateAfter {
                request_id,
                length: self.max_length,
            }),
        ]
    }

    fn known(&self, request_id: RequestId) -> SearcherResult<()> {
        if self.state.requests.contains_key(&request_id) {
            Ok(())
        } else {
            Err(SearcherError::UnknownRequest(request_id))
        }
    }

    fn record_metric(&mut self, metric: f64) {
        let better = match self.state.best_metric {
            None => true,
            Some(best) if self.smaller_is_better => metric < best,
            Some(best) => metric > best,
        };
        if better {
            self.state.best_metric = Some(metric);
        }
    }
}

impl Searcher for SearchRunner {
    fn initial_operations(&mut self) -> SearcherResult<Vec<Operation>> {
        if self.strategy.max_trials() == 0 {
            return Err(SearcherError::Exhausted);
        }
        let mut ops = Vec::new();
        for _ in 0..self.max_concurrent {
            ops.extend(self.create_trial());
        }
        info!(
            searcher = self.strategy.name(),
            trials = self.max_concurrent,
            "searcher started"
        );
        Ok(ops)
    }

    fn trial_created(&mut self, request_id: RequestId) -> SearcherResult<Vec<Operation>> {
        self.known(request_id)?;
        self.state.created.insert(request_id);
        Ok(Vec::new())
    }

    fn validation_completed(
        &mut self,
        request_id: RequestId,
        metric: f64,
        op: &ValidateAfter,
    ) -> SearcherResult<Vec<Operation>> {
        self.known(request_id)?;
        self.record_metric(metric);
        if op.length >= self.max_length {
            self.state.trial_progress.insert(request_id, 1.0);
            Ok(vec![Operation::Close(Close { request_id })])
        } else {
            self.state
                .trial_progress
                .insert(request_id, op.length as f64 / self.max_length as f64);
            Ok(vec![Operation::ValidateAfter(ValidateAfter {
                request_id,
                length: self.max_length,
            })])
        }
    }

    fn trial_exited_early(
        &mut self,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> SearcherResult<Vec<Operation>> {
        self.known(request_id)?;
        if reason == ExitedReason::Errored {
            self.state.failures.insert(request_id);
        }
        Ok(Vec::new())
    }

    fn trial_closed(&mut self, request_id: RequestId) -> SearcherResult<Vec<Operation>> {
        self.known(request_id)?;
        self.state.closed.insert(request_id);
        self.state.trial_progress.insert(request_id, 1.0);

        if self.state.trials_requested < self.strategy.max_trials() {
            return Ok(self.create_trial());
        }
        if self.state.closed.len() >= self.state.trials_requested && !self.state.shutdown {
            self.state.shutdown = true;
            let failure = self.state.failures.len() >= self.state.trials_requested;
            info!(
                searcher = self.strategy.name(),
                failures = self.state.failures.len(),
                "search finished"
            );
            return Ok(vec![Operation::Shutdown(Shutdown {
                failure,
                cancel: false,
            })]);
        }
        Ok(Vec::new())
    }

    fn set_trial_progress(&mut self, request_id: RequestId, progress: f64) {
        if self.state.requests.contains_key(&request_id) && !self.state.closed.contains(&request_id) {
            self.state
                .trial_progress
                .insert(request_id, progress.clamp(0.0, 1.0));
        }
    }

    fn progress(&self) -> f64 {
        let total = self.strategy.max_trials();
        if total == 0 {
            return 1.0;
        }
        let done: f64 = self.state.trial_progress.values().sum();
        (done / total as f64).clamp(0.0, 1.0)
    }

    fn snapshot(&self) -> SearcherResult<serde_json::Value> {
        serde_json::to_value(&self.state).map_err(|e| SearcherError::Failed(e.to_string()))
    }

    fn restore(&mut self, state: serde_json::Value) -> SearcherResult<()> {
        self.state = serde_json::from_value(state).map_err(|e| SearcherError::Restore(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tn_types::{SearchSpace, SearcherConfig};

    fn random_config(max_trials: usize, max_concurrent: usize) -> ExperimentConfig {
        ExperimentConfig::new(
            "search",
            SearcherConfig::new(
                "loss",
                SearchMethodConfig::Random {
                    max_trials,
                    max_length: 100,
                    max_concurrent_trials: max_concurrent,
                },
            ),
        )
        .with_hyperparameters(SearchSpace::new().add_double("lr", 0.01, 0.1))
    }

    fn creates(ops: &[Operation]) -> Vec<RequestId> {
        ops.iter()
            .filter_map(|op| match op {
                Operation::Create(c) => Some(c.request_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn initial_operations_respect_concurrency() {
        let mut runner = SearchRunner::from_config(&random_config(5, 2));
        let ops = runner.initial_operations().unwrap();
        assert_eq!(creates(&ops).len(), 2);
        assert_eq!(ops.len(), 4);
        assert!(matches!(ops[1], Operation::ValidateAfter(ValidateAfter { length: 100, .. })));
    }

    #[test]
    fn completed_validation_closes_trial() {
        let mut runner = SearchRunner::from_config(&random_config(1, 0));
        let ops = runner.initial_operations().unwrap();
        let request_id = creates(&ops)[0];
        runner.trial_created(request_id).unwrap();
        let op = ValidateAfter {
            request_id,
            length: 100,
        };
        let ops = runner.validation_completed(request_id, 0.3, &op).unwrap();
        assert_eq!(ops, vec![Operation::Close(Close { request_id })]);
        assert_eq!(runner.best_metric(), Some(0.3));
    }

    #[test]
    fn closing_last_trial_shuts_down() {
        let mut runner = SearchRunner::from_config(&random_config(2, 1));
        let first = creates(&runner.initial_operations().unwrap())[0];
        let next = runner.trial_closed(first).unwrap();
        let second = creates(&next)[0];
        let ops = runner.trial_closed(second).unwrap();
        assert_eq!(ops, vec![Operation::Shutdown(Shutdown::default())]);
        assert!((runner.progress() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn all_failed_trials_shut_down_with_failure() {
        let mut runner = SearchRunner::from_config(&random_config(1, 1));
        let request_id = creates(&runner.initial_operations().unwrap())[0];
        runner
            .trial_exited_early(request_id, ExitedReason::Errored)
            .unwrap();
        let ops = runner.trial_closed(request_id).unwrap();
        assert_eq!(
            ops,
            vec![Operation::Shutdown(Shutdown {
                failure: true,
                cancel: false
            })]
        );
    }

    #[test]
    fn unknown_request_is_rejected() {
        let mut runner = SearchRunner::from_config(&random_config(1, 1));
        let err = runner.trial_created(RequestId::new()).unwrap_err();
        assert!(matches!(err, SearcherError::UnknownRequest(_)));
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let config = random_config(3, 2);
        let mut runner = SearchRunner::from_config(&config);
        let request_id = creates(&runner.initial_operations().unwrap())[0];
        runner.trial_created(request_id).unwrap();
        runner.set_trial_progress(request_id, 0.5);

        let snapshot = runner.snapshot().unwrap();
        let mut restored = SearchRunner::from_config(&config);
        restored.restore(snapshot.clone()).unwrap();
        assert_eq!(restored.snapshot().unwrap(), snapshot);
        assert!((restored.progress() - runner.progress()).abs() < f64::EPSILON);
    }
}
