mod app;
mod database;
mod queue;
mod realtime;
mod server;

pub use app::AppConfig;
pub use database::{DatabaseConfig, DatabaseConfigBuilder};
pub use queue::{QueueConfig, QueueConfigBuilder};
pub use realtime::RealtimeConfig;
pub use server::ServerConfig;
