//! Process-wide `tracing` subscriber

use crate::config::AppConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the fmt subscriber
///
/// `RUST_LOG` wins over the configured default filter. Calling this twice
/// keeps the first subscriber.
pub fn init(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if installed.is_ok() {
        tracing::debug!(app = %config.name, environment = ?config.environment, "logging initialised");
    }
}
