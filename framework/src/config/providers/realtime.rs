use crate::config::env::{env, env_optional};
use std::time::Duration;

/// Live stream configuration
///
/// # Environment Variables
///
/// - `REDIS_URL` - pub/sub transport; unset runs everything in-process
/// - `REALTIME_SINK_CAPACITY` - buffered events per connected client (default: 64)
/// - `REALTIME_KEEP_ALIVE_SECS` - comment frame interval on idle streams (default: 15)
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub redis_url: Option<String>,
    pub sink_capacity: usize,
    pub keep_alive_secs: u64,
}

impl RealtimeConfig {
    /// Build config from environment variables
    pub fn from_env() -> Self {
        Self {
            redis_url: env_optional("REDIS_URL"),
            sink_capacity: env("REALTIME_SINK_CAPACITY", 64usize).max(1),
            keep_alive_secs: env("REALTIME_KEEP_ALIVE_SECS", 15u64).max(1),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
