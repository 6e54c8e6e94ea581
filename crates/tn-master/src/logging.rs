//! Process-wide `tracing` setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use tn_types::{config_error, MasterConfig, TnResult};

/// Builds the filter: `RUST_LOG` wins, then the configured directive.
pub fn env_filter(config: &MasterConfig) -> TnResult<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directive) if !directive.trim().is_empty() => EnvFilter::try_new(directive),
        _ => EnvFilter::try_new(&config.log_filter),
    }
    .map_err(|e| config_error!("invalid log filter: {}", e))
}

/// Installs the global subscriber. Fails if one is already set.
pub fn init(config: &MasterConfig) -> TnResult<()> {
    let filter = env_filter(config)?;
    let layer = if config.log_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };
    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| config_error!("failed to install tracing subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_directive() {
        if std::env::var(EnvFilter::DEFAULT_ENV).is_ok() {
            return;
        }
        let config = MasterConfig {
            log_filter: "tn_master=notalevel".to_string(),
            ..MasterConfig::default()
        };
        assert!(env_filter(&config).is_err());

        let config = MasterConfig {
            log_filter: "warn,tn_master=debug".to_string(),
            ..MasterConfig::default()
        };
        assert!(env_filter(&config).is_ok());
    }
}
