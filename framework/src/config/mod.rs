//! Configuration for cadence
//!
//! - Layered `.env` loading with environment-based precedence
//! - Typed config structs built from environment variables
//! - A process-wide repository for looking them up by type
//!
//! # Example
//!
//! ```rust,no_run
//! use cadence::{Config, config::QueueConfig};
//!
//! Config::init(std::path::Path::new("."));
//!
//! let queue = Config::get::<QueueConfig>().unwrap();
//! println!("worker concurrency: {}", queue.concurrency);
//! ```

pub mod env;
pub mod providers;
pub mod repository;

pub use env::{env, env_optional, load_dotenv, Environment};
pub use providers::{
    AppConfig, DatabaseConfig, DatabaseConfigBuilder, QueueConfig, QueueConfigBuilder,
    RealtimeConfig, ServerConfig,
};

use std::path::Path;

/// Facade over the config repository
pub struct Config;

impl Config {
    /// Load `.env` files and register every framework config
    ///
    /// Call once at startup, before anything resolves a config. Returns the
    /// detected environment.
    pub fn init(project_root: &Path) -> Environment {
        let env = env::load_dotenv(project_root);

        repository::register(AppConfig::from_env());
        repository::register(ServerConfig::from_env());
        repository::register(DatabaseConfig::from_env());
        repository::register(QueueConfig::from_env());
        repository::register(RealtimeConfig::from_env());

        env
    }

    /// Get a typed config struct from the repository
    pub fn get<T: std::any::Any + Send + Sync + Clone + 'static>() -> Option<T> {
        repository::get::<T>()
    }

    /// Register (or replace) a config struct
    ///
    /// ```rust,no_run
    /// use cadence::{Config, config::QueueConfig};
    ///
    /// Config::register(QueueConfig::builder().concurrency(1).build());
    /// ```
    pub fn register<T: std::any::Any + Send + Sync + 'static>(config: T) {
        repository::register(config);
    }

    /// Check if a config type is registered
    pub fn has<T: std::any::Any + 'static>() -> bool {
        repository::has::<T>()
    }

    /// Current environment, falling back to `APP_ENV` detection
    pub fn environment() -> Environment {
        Config::get::<AppConfig>()
            .map(|c| c.environment)
            .unwrap_or_else(Environment::detect)
    }
}
