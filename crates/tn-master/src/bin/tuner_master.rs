use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use tn_master::sim::{SimConfig, SimResourceManager};
use tn_master::{logging, Master, MasterContext};
use tn_store::MemoryStore;
use tn_types::{ExperimentConfig, MasterConfig};

/// Sandbox master on the in-memory store and the simulated resource manager.
#[derive(Parser, Debug)]
#[command(name = "tuner-master")]
#[command(about = "Tuner experiment orchestration master", long_about = None)]
#[command(version)]
struct Cli {
    /// Master config (JSON). `TUNER_*` variables override its fields.
    #[arg(short, long, env = "TUNER_CONFIG")]
    config: Option<PathBuf>,

    /// Experiment config (JSON) to submit once started.
    #[arg(short, long)]
    experiment: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = MasterConfig::load(cli.config.as_deref()).context("loading master config")?;
    logging::init(&config).context("initializing logging")?;

    let store = Arc::new(MemoryStore::new());
    let rm = Arc::new(SimResourceManager::new(SimConfig {
        auto_run: true,
        ..SimConfig::default()
    }));
    let master = Master::new(MasterContext::new(store, rm, config));

    let restored = master.restore_experiments().await.context("restoring experiments")?;
    info!(restored, "tuner master started");

    if let Some(path) = cli.experiment {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading experiment config {}", path.display()))?;
        let experiment: ExperimentConfig =
            serde_json::from_str(&raw).with_context(|| format!("parsing experiment config {}", path.display()))?;
        let handle = master
            .submit_experiment(experiment)
            .await
            .context("submitting experiment")?;
        info!(experiment_id = %handle.id(), "experiment running");
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!(
        running = master.active_experiments().len(),
        "tuner master shutting down"
    );
    Ok(())
}
