//! Master bootstrap: submits new experiments and restores old ones.

use dashmap::DashMap;
use tracing::info;

use tn_types::{ExperimentConfig, ExperimentId, JobId, State, StateWithReason, TnError};

use crate::experiment::{
    experiment_session, resolve_warm_start, spawn_experiment, ExperimentHandle, ExperimentInit,
    ExperimentStart,
};
use crate::restore::restore_all;
use crate::MasterContext;

/// Registry of running experiment actors.
pub struct Master {
    ctx: MasterContext,
    experiments: DashMap<ExperimentId, ExperimentHandle>,
}

impl Master {
    pub fn new(ctx: MasterContext) -> Self {
        Self {
            ctx,
            experiments: DashMap::new(),
        }
    }

    pub fn context(&self) -> &MasterContext {
        &self.ctx
    }

    /// Validates, persists and starts a new experiment.
    pub async fn submit_experiment(&self, mut config: ExperimentConfig) -> Result<ExperimentHandle, TnError> {
        config.validate()?;
        let pool = self
            .ctx
            .rm
            .resolve_resource_pool(config.resources.resource_pool.as_deref(), config.resources.slots_per_trial)
            .await?;
        config.resources.resource_pool = Some(pool);
        let warm_start = resolve_warm_start(self.ctx.store.as_ref(), &config).await?;

        let row = self.ctx.store.add_experiment(config.clone(), JobId::new()).await?;
        self.ctx.store.start_session(&experiment_session(row.id)).await?;
        let searcher = (self.ctx.searchers)(&config);
        info!(experiment_id = %row.id, name = %config.name, "experiment submitted");

        let handle = spawn_experiment(
            self.ctx.clone(),
            ExperimentInit {
                id: row.id,
                job_id: row.job_id,
                config,
                state: StateWithReason::new(State::Active, "experiment submitted"),
                warm_start,
            },
            searcher,
            ExperimentStart::Fresh,
        );
        self.experiments.insert(row.id, handle.clone());
        Ok(handle)
    }

    /// Restores every non-terminal experiment found in the store.
    pub async fn restore_experiments(&self) -> Result<usize, TnError> {
        let handles = restore_all(&self.ctx).await?;
        let count = handles.len();
        for handle in handles {
            self.experiments.insert(handle.id(), handle);
        }
        info!(experiments = count, "experiments restored");
        Ok(count)
    }

    pub fn experiment(&self, id: ExperimentId) -> Option<ExperimentHandle> {
        self.experiments.get(&id).map(|h| h.value().clone())
    }

    /// Handles of experiments that have not reached a terminal state.
    pub fn active_experiments(&self) -> Vec<ExperimentHandle> {
        self.experiments.retain(|_, handle| !handle.state().state.is_terminal());
        let mut handles: Vec<ExperimentHandle> = self.experiments.iter().map(|h| h.value().clone()).collect();
        handles.sort_by_key(|h| h.id());
        handles
    }
}
