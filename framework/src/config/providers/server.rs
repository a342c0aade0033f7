use crate::config::env::env;

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Maximum request body size in bytes (default: 64KB)
    pub max_body_size: usize,
}

impl ServerConfig {
    pub const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024;

    /// Build config from environment variables
    pub fn from_env() -> Self {
        Self {
            host: env("SERVER_HOST", "127.0.0.1".to_string()),
            port: env("SERVER_PORT", 8000),
            max_body_size: env("SERVER_MAX_BODY_SIZE", Self::DEFAULT_MAX_BODY_SIZE),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
