use crate::config::env::{env, Environment};

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Application name, used in log lines and the health endpoint
    pub name: String,
    /// Current environment
    pub environment: Environment,
    /// Default `tracing` filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl AppConfig {
    /// Build config from environment variables
    pub fn from_env() -> Self {
        Self {
            name: env("APP_NAME", "cadence".to_string()),
            environment: Environment::detect(),
            log_filter: env("APP_LOG", "info,sqlx=warn,sea_orm=warn".to_string()),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
