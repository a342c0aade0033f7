//! Database connection management

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use std::sync::Arc;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::FrameworkError;

/// Clonable handle to the SeaORM connection pool
///
/// ```rust,ignore
/// let conn = DbConnection::connect(&config).await?;
/// let follow_ups = follow_ups::Entity::find().all(conn.inner()).await?;
/// ```
#[derive(Clone, Debug)]
pub struct DbConnection {
    inner: Arc<DatabaseConnection>,
}

impl DbConnection {
    /// Open a pool from config
    ///
    /// SQLite database files (and their parent directories) are created if
    /// missing.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, FrameworkError> {
        let url = sqlite_url(&config.url).unwrap_or_else(|| config.url.clone());

        let mut opt = ConnectOptions::new(&url);
        opt.max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .sqlx_logging(config.logging);

        let conn = Database::connect(opt).await?;
        tracing::debug!(backend = ?conn.get_database_backend(), "database connected");

        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: DatabaseConnection) -> Self {
        Self {
            inner: Arc::new(conn),
        }
    }

    /// Get a reference to the underlying SeaORM connection
    pub fn inner(&self) -> &DatabaseConnection {
        &self.inner
    }
}

impl AsRef<DatabaseConnection> for DbConnection {
    fn as_ref(&self) -> &DatabaseConnection {
        &self.inner
    }
}

impl std::ops::Deref for DbConnection {
    type Target = DatabaseConnection;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Rewrite `sqlite://path` into the create-if-missing form, touching the file
fn sqlite_url(url: &str) -> Option<String> {
    let path = url.strip_prefix("sqlite://")?;
    let path = path.trim_start_matches("./");

    if path.starts_with(":memory:") {
        return Some("sqlite::memory:".to_string());
    }

    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).ok();
        }
    }
    if !std::path::Path::new(path).exists() {
        std::fs::File::create(path).ok();
    }

    Some(format!("sqlite:{}?mode=rwc", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_non_sqlite_urls_alone() {
        assert_eq!(sqlite_url("postgres://localhost/cadence"), None);
        assert_eq!(
            sqlite_url("sqlite://:memory:").as_deref(),
            Some("sqlite::memory:")
        );
    }
}
