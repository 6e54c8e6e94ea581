//! # tn-master
//!
//! The orchestration engine: one actor per experiment and per trial, each a
//! tokio task draining its own mailbox. Experiments drive a [`Searcher`] and
//! own their trials; trials reconcile their desired state against at most one
//! live [`allocation::Allocation`] obtained from a [`rm::ResourceManager`].

pub mod allocation;
pub mod checkpoint_gc;
pub mod experiment;
pub mod logging;
pub mod master;
pub mod restore;
pub mod rm;
pub mod sim;
pub mod task;
pub mod trial;

use std::sync::Arc;

use tn_searcher::{SearchRunner, Searcher};
use tn_store::Store;
use tn_types::{ExperimentConfig, MasterConfig};

use crate::rm::ResourceManager;

pub use experiment::{ExperimentHandle, ExperimentSummary};
pub use master::Master;
pub use trial::{TrialHandle, TrialSummary};

/// Builds the searcher for an experiment.
pub type SearcherFactory = Arc<dyn Fn(&ExperimentConfig) -> Box<dyn Searcher> + Send + Sync>;

/// Collaborators shared by every actor in the master.
#[derive(Clone)]
pub struct MasterContext {
    pub store: Arc<dyn Store>,
    pub rm: Arc<dyn ResourceManager>,
    pub config: Arc<MasterConfig>,
    pub searchers: SearcherFactory,
}

impl MasterContext {
    pub fn new(store: Arc<dyn Store>, rm: Arc<dyn ResourceManager>, config: MasterConfig) -> Self {
        Self {
            store,
            rm,
            config: Arc::new(config),
            searchers: Arc::new(|config: &ExperimentConfig| {
                Box::new(SearchRunner::from_config(config)) as Box<dyn Searcher>
            }),
        }
    }

    /// Replaces the searcher used for new and restored experiments.
    pub fn with_searchers(mut self, searchers: SearcherFactory) -> Self {
        self.searchers = searchers;
        self
    }
}
