//! Tracing setup for hosts embedding a data container.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ENV_LOG;

/// Build the filter: `TRELLIS_LOG` when set, otherwise `default_filter`.
pub fn env_filter(default_filter: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_env(ENV_LOG) {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_filter)
            .with_context(|| format!("Invalid log filter '{default_filter}'")),
    }
}

/// Install a global fmt subscriber. Returns `false` when a subscriber was
/// already installed (tests call this repeatedly).
pub fn init_tracing(default_filter: &str) -> Result<bool> {
    let filter = env_filter(default_filter)?;
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("[telemetry] tracing initialized with '{}'", default_filter);
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_filter_is_reported() {
        if std::env::var(ENV_LOG).is_ok() {
            return;
        }
        assert!(env_filter("info,trellis_core=debug").is_ok());
        assert!(env_filter("trellis_core=notalevel").is_err());
    }
}
