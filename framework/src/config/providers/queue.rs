use crate::config::env::env;
use std::time::Duration;

/// Job queue configuration
///
/// # Environment Variables
///
/// - `QUEUE_POLL_INTERVAL_MS` - Worker poll interval in milliseconds (default: 1000)
/// - `QUEUE_CONCURRENCY` - Jobs processed concurrently per worker (default: 4)
/// - `QUEUE_LOCK_TIMEOUT_SECS` - Lease on a claimed job (default: 300)
/// - `QUEUE_MAX_ATTEMPTS` - Attempts before a job is parked as failed (default: 3)
/// - `QUEUE_BACKOFF_SECS` - First retry delay, doubled per attempt (default: 60)
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub poll_interval_ms: u64,
    pub concurrency: usize,
    pub lock_timeout_secs: u64,
    pub max_attempts: i32,
    pub backoff_secs: i64,
}

impl QueueConfig {
    /// Longest wait between retries (30 days)
    pub const MAX_BACKOFF_SECS: i64 = 30 * 24 * 60 * 60;

    /// Build config from environment variables
    pub fn from_env() -> Self {
        Self {
            poll_interval_ms: env("QUEUE_POLL_INTERVAL_MS", 1000u64),
            concurrency: env("QUEUE_CONCURRENCY", 4usize).max(1),
            lock_timeout_secs: env("QUEUE_LOCK_TIMEOUT_SECS", 300u64),
            max_attempts: env("QUEUE_MAX_ATTEMPTS", 3i32).max(1),
            backoff_secs: env("QUEUE_BACKOFF_SECS", 60i64).max(0),
        }
    }

    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based)
    ///
    /// Capped at [`Self::MAX_BACKOFF_SECS`].
    pub fn backoff_for(&self, attempt: i32) -> chrono::Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 20) as u32;
        let secs = self
            .backoff_secs
            .saturating_mul(1i64 << exponent)
            .min(Self::MAX_BACKOFF_SECS);
        chrono::Duration::seconds(secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Builder for QueueConfig
#[derive(Default)]
pub struct QueueConfigBuilder {
    poll_interval_ms: Option<u64>,
    concurrency: Option<usize>,
    lock_timeout_secs: Option<u64>,
    max_attempts: Option<i32>,
    backoff_secs: Option<i64>,
}

impl QueueConfigBuilder {
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = Some(ms);
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }

    pub fn lock_timeout_secs(mut self, secs: u64) -> Self {
        self.lock_timeout_secs = Some(secs);
        self
    }

    pub fn max_attempts(mut self, attempts: i32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    pub fn backoff_secs(mut self, secs: i64) -> Self {
        self.backoff_secs = Some(secs.max(0));
        self
    }

    pub fn build(self) -> QueueConfig {
        let default = QueueConfig::from_env();
        QueueConfig {
            poll_interval_ms: self.poll_interval_ms.unwrap_or(default.poll_interval_ms),
            concurrency: self.concurrency.unwrap_or(default.concurrency),
            lock_timeout_secs: self.lock_timeout_secs.unwrap_or(default.lock_timeout_secs),
            max_attempts: self.max_attempts.unwrap_or(default.max_attempts),
            backoff_secs: self.backoff_secs.unwrap_or(default.backoff_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn backoff_doubles_from_base() {
        let config = QueueConfig::builder().backoff_secs(60).build();
        assert_eq!(config.backoff_for(1).num_seconds(), 60);
        assert_eq!(config.backoff_for(2).num_seconds(), 120);
        assert_eq!(config.backoff_for(3).num_seconds(), 240);
    }

    #[test]
    fn huge_backoff_is_capped() {
        let config = QueueConfig::builder().backoff_secs(i64::MAX).build();
        assert_eq!(config.backoff_for(1).num_seconds(), QueueConfig::MAX_BACKOFF_SECS);
        assert_eq!(config.backoff_for(21).num_seconds(), QueueConfig::MAX_BACKOFF_SECS);

        let config = QueueConfig::builder().backoff_secs(3600).build();
        assert_eq!(config.backoff_for(i32::MAX).num_seconds(), QueueConfig::MAX_BACKOFF_SECS);
    }

    #[test]
    fn builder_clamps_nonsense() {
        let config = QueueConfig::builder().concurrency(0).max_attempts(-2).build();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.max_attempts, 1);
    }
}
