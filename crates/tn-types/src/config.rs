//! Experiment and master configuration.

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::{TnError, TnResult};
use crate::hparams::SearchSpace;
use crate::ids::TrialId;
use crate::{config_error, validation_error};

/// User-submitted experiment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Failed allocations a trial may retry before it is marked errored.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default)]
    pub resources: ResourcesConfig,
    pub searcher: SearcherConfig,
    #[serde(default)]
    pub hyperparameters: SearchSpace,
    #[serde(default)]
    pub checkpoint_storage: CheckpointStorageConfig,
    /// Overrides the master's default preemption timeout.
    #[serde(default)]
    pub preemption_timeout_secs: Option<u64>,
    #[serde(default)]
    pub seed: u32,
}

fn default_max_restarts() -> u32 {
    5
}

impl ExperimentConfig {
    pub fn new(name: impl Into<String>, searcher: SearcherConfig) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            max_restarts: default_max_restarts(),
            resources: ResourcesConfig::default(),
            searcher,
            hyperparameters: SearchSpace::default(),
            checkpoint_storage: CheckpointStorageConfig::default(),
            preemption_timeout_secs: None,
            seed: 0,
        }
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_slots_per_trial(mut self, slots: u32) -> Self {
        self.resources.slots_per_trial = slots;
        self
    }

    pub fn with_hyperparameters(mut self, space: SearchSpace) -> Self {
        self.hyperparameters = space;
        self
    }

    pub fn with_checkpoint_storage(mut self, storage: CheckpointStorageConfig) -> Self {
        self.checkpoint_storage = storage;
        self
    }

    pub fn preemption_timeout(&self, default: Duration) -> Duration {
        self.preemption_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    pub fn validate(&self) -> TnResult<()> {
        if self.name.trim().is_empty() {
            return Err(validation_error!("experiment name must not be empty"));
        }
        if self.resources.slots_per_trial == 0 {
            return Err(validation_error!("slots_per_trial must be at least 1"));
        }
        if let Some(max_slots) = self.resources.max_slots {
            if max_slots < self.resources.slots_per_trial {
                return Err(validation_error!(
                    "max_slots {} is smaller than slots_per_trial {}",
                    max_slots,
                    self.resources.slots_per_trial
                ));
            }
        }
        if self.searcher.source_trial_id.is_some() && self.searcher.source_checkpoint_uuid.is_some() {
            return Err(validation_error!(
                "only one of source_trial_id and source_checkpoint_uuid may be set"
            ));
        }
        self.searcher.method.validate()?;
        self.hyperparameters
            .validate()
            .map_err(TnError::Validation)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcesConfig {
    pub slots_per_trial: u32,
    #[serde(default)]
    pub resource_pool: Option<String>,
    #[serde(default)]
    pub max_slots: Option<u32>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub priority: Option<u32>,
}

fn default_weight() -> f64 {
    1.0
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            slots_per_trial: 1,
            resource_pool: None,
            max_slots: None,
            weight: default_weight(),
            priority: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearcherConfig {
    pub metric: String,
    #[serde(default = "default_smaller_is_better")]
    pub smaller_is_better: bool,
    pub method: SearchMethodConfig,
    /// Warm-start every trial from this trial's latest checkpoint.
    #[serde(default)]
    pub source_trial_id: Option<TrialId>,
    /// Warm-start every trial from this checkpoint.
    #[serde(default)]
    pub source_checkpoint_uuid: Option<Uuid>,
}

fn default_smaller_is_better() -> bool {
    true
}

impl SearcherConfig {
    pub fn new(metric: impl Into<String>, method: SearchMethodConfig) -> Self {
        Self {
            metric: metric.into(),
            smaller_is_better: true,
            method,
            source_trial_id: None,
            source_checkpoint_uuid: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum SearchMethodConfig {
    Single {
        max_length: u64,
    },
    Random {
        max_trials: usize,
        max_length: u64,
        #[serde(default)]
        max_concurrent_trials: usize,
    },
    Grid {
        max_length: u64,
        #[serde(default = "default_float_steps")]
        float_steps: usize,
        #[serde(default)]
        max_concurrent_trials: usize,
    },
}

fn default_float_steps() -> usize {
    3
}

impl SearchMethodConfig {
    pub fn max_length(&self) -> u64 {
        match self {
            SearchMethodConfig::Single { max_length }
            | SearchMethodConfig::Random { max_length, .. }
            | SearchMethodConfig::Grid { max_length, .. } => *max_length,
        }
    }

    fn validate(&self) -> TnResult<()> {
        if self.max_length() == 0 {
            return Err(validation_error!("searcher max_length must be positive"));
        }
        if let SearchMethodConfig::Random { max_trials: 0, .. } = self {
            return Err(validation_error!("random searcher needs max_trials > 0"));
        }
        Ok(())
    }
}

/// Which checkpoints survive garbage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStorageConfig {
    pub save_experiment_best: usize,
    pub save_trial_best: usize,
    pub save_trial_latest: usize,
}

impl Default for CheckpointStorageConfig {
    fn default() -> Self {
        Self {
            save_experiment_best: 0,
            save_trial_best: 1,
            save_trial_latest: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Master configuration
// ---------------------------------------------------------------------------

/// Process-wide settings for the orchestration master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub log_json: bool,
    pub kill_cooldown_secs: u64,
    pub rendezvous_timeout_secs: u64,
    pub preemption_timeout_secs: u64,
    pub gc_image: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            log_json: false,
            kill_cooldown_secs: 30,
            rendezvous_timeout_secs: 600,
            preemption_timeout_secs: 3600,
            gc_image: "tuner/checkpoint-gc:latest".to_string(),
        }
    }
}

impl MasterConfig {
    pub fn kill_cooldown(&self) -> Duration {
        Duration::from_secs(self.kill_cooldown_secs)
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_secs(self.rendezvous_timeout_secs)
    }

    pub fn preemption_timeout(&self) -> Duration {
        Duration::from_secs(self.preemption_timeout_secs)
    }

    /// Layers defaults, the JSON config file (if given) and `TUNER_*`
    /// environment variables, in that order. Variables are named after the
    /// fields, e.g. `TUNER_KILL_COOLDOWN_SECS`.
    pub fn load(path: Option<&Path>) -> TnResult<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(MasterConfig::default()));
        if let Some(path) = path {
            std::fs::metadata(path)?;
            figment = figment.merge(Json::file(path));
        }
        figment
            .merge(Env::prefixed("TUNER_").ignore(&["config"]))
            .extract()
            .map_err(|err| config_error!("{}", err))
    }
}
