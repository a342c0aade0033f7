//! Application builder and CLI
//!
//! ```rust,ignore
//! use cadence::Application;
//!
//! #[tokio::main]
//! async fn main() {
//!     let result = Application::new()
//!         .sender(Arc::new(LogSender))
//!         .routes(routes::register)
//!         .run()
//!         .await;
//! }
//! ```

use crate::config::{AppConfig, DatabaseConfig, QueueConfig, RealtimeConfig};
use crate::database::{DbConnection, Migrator};
use crate::error::FrameworkError;
use crate::queue::{JobId, JobQueue, QueueWorker};
use crate::realtime::Realtime;
use crate::routing::Router;
use crate::sequence::{rules, MessageSender, SequenceEngine, StepExecutor};
use crate::{logging, Config, Server};
use clap::{Parser, Subcommand};
use sea_orm_migration::MigratorTrait;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// CLI structure for cadence applications
#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Follow-up sequence server and utilities")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the web server (default command)
    Serve {
        /// Skip running migrations on startup
        #[arg(long)]
        no_migrate: bool,
        /// Do not run a queue worker inside the server process
        #[arg(long)]
        no_worker: bool,
    },
    /// Run the queue worker daemon
    #[command(name = "queue:work")]
    QueueWork,
    /// List jobs parked after exhausting their attempts
    #[command(name = "queue:failed")]
    QueueFailed,
    /// Put a parked job back on the queue
    #[command(name = "queue:retry")]
    QueueRetry {
        /// Job id, e.g. seq_12_step_3
        job_id: String,
    },
    /// Append a rule to a workspace's sequence
    #[command(name = "rule:add")]
    RuleAdd {
        workspace_id: i64,
        delay_ms: i64,
        content: String,
    },
    /// Run pending database migrations
    Migrate,
    /// Show migration status
    #[command(name = "migrate:status")]
    MigrateStatus,
    /// Drop all tables and re-run all migrations
    #[command(name = "migrate:fresh")]
    MigrateFresh,
}

/// Everything a running process shares
///
/// Handed to the routes function so controllers can hold what they need.
#[derive(Clone)]
pub struct Services {
    pub db: DbConnection,
    pub queue: JobQueue,
    pub engine: SequenceEngine,
    pub realtime: Realtime,
    pub realtime_config: RealtimeConfig,
}

type RoutesFn = Box<dyn FnOnce(&Services) -> Router + Send>;

/// Application builder
pub struct Application {
    sender: Option<Arc<dyn MessageSender>>,
    routes_fn: Option<RoutesFn>,
}

impl Application {
    pub fn new() -> Self {
        Self {
            sender: None,
            routes_fn: None,
        }
    }

    /// Provider that delivers step messages
    ///
    /// Required by `serve` (unless `--no-worker`) and `queue:work`.
    pub fn sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Register a routes function
    ///
    /// ```rust,ignore
    /// Application::new().routes(routes::register)
    /// ```
    pub fn routes<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Services) -> Router + Send + 'static,
    {
        self.routes_fn = Some(Box::new(f));
        self
    }

    /// Parse CLI arguments and run the chosen command
    pub async fn run(self) -> Result<(), FrameworkError> {
        let cli = Cli::parse();

        Config::init(Path::new("."));
        let app_config = Config::get::<AppConfig>().unwrap_or_else(AppConfig::from_env);
        logging::init(&app_config);

        match cli.command {
            None => self.serve(true, true).await,
            Some(Commands::Serve {
                no_migrate,
                no_worker,
            }) => self.serve(!no_migrate, !no_worker).await,
            Some(Commands::QueueWork) => self.queue_work().await,
            Some(Commands::QueueFailed) => list_failed_jobs().await,
            Some(Commands::QueueRetry { job_id }) => retry_job(&job_id).await,
            Some(Commands::RuleAdd {
                workspace_id,
                delay_ms,
                content,
            }) => add_rule(workspace_id, delay_ms, content).await,
            Some(Commands::Migrate) => {
                let db = connect().await?;
                Migrator::up(db.inner(), None).await?;
                tracing::info!("migrations applied");
                Ok(())
            }
            Some(Commands::MigrateStatus) => {
                let db = connect().await?;
                Migrator::status(db.inner()).await?;
                Ok(())
            }
            Some(Commands::MigrateFresh) => {
                tracing::warn!("dropping all tables and re-running migrations");
                let db = connect().await?;
                Migrator::fresh(db.inner()).await?;
                tracing::info!("database refreshed");
                Ok(())
            }
        }
    }

    async fn serve(self, migrate: bool, with_worker: bool) -> Result<(), FrameworkError> {
        let services = boot(migrate).await?;
        let (stop, stopped) = shutdown_channel();

        let worker = if with_worker {
            let sender = self.sender.clone().ok_or_else(missing_sender)?;
            Some(spawn_worker(&services, sender, stopped.clone()))
        } else {
            None
        };

        let router = match self.routes_fn {
            Some(routes_fn) => routes_fn(&services),
            None => Router::new(),
        };

        let served = Server::from_config(router)
            .run(wait_for(stopped.clone()))
            .await;
        // The server also returns on bind errors; take the worker down with it.
        let _ = stop.send(true);

        if let Some(worker) = worker {
            join_worker(worker).await?;
        }
        served
    }

    async fn queue_work(self) -> Result<(), FrameworkError> {
        let sender = self.sender.ok_or_else(missing_sender)?;
        let services = boot(false).await?;
        let (_stop, stopped) = shutdown_channel();
        join_worker(spawn_worker(&services, sender, stopped)).await
    }
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

fn missing_sender() -> FrameworkError {
    FrameworkError::internal("no message sender configured; call Application::sender")
}

async fn connect() -> Result<DbConnection, FrameworkError> {
    let config = Config::get::<DatabaseConfig>().unwrap_or_else(DatabaseConfig::from_env);
    DbConnection::connect(&config).await
}

/// Connect the database and realtime layer and build the engine
async fn boot(migrate: bool) -> Result<Services, FrameworkError> {
    let db = connect().await?;
    if migrate {
        Migrator::up(db.inner(), None).await?;
        tracing::info!("migrations applied");
    }

    let realtime_config = Config::get::<RealtimeConfig>().unwrap_or_else(RealtimeConfig::from_env);
    // Upstream and dispatcher tasks run for the life of the process.
    let (realtime, _tasks) = Realtime::connect(&realtime_config).await?;

    let queue = JobQueue::new(Config::get::<QueueConfig>().unwrap_or_else(QueueConfig::from_env));
    let engine = SequenceEngine::new(db.clone(), queue.clone(), realtime.bus.clone());

    Ok(Services {
        db,
        queue,
        engine,
        realtime,
        realtime_config,
    })
}

fn spawn_worker(
    services: &Services,
    sender: Arc<dyn MessageSender>,
    stopped: watch::Receiver<bool>,
) -> JoinHandle<Result<(), FrameworkError>> {
    let executor = StepExecutor::new(services.engine.clone(), sender, services.realtime.bus.clone());
    let worker = QueueWorker::new(services.db.clone(), services.queue.clone(), Arc::new(executor));
    tokio::spawn(worker.run(wait_for(stopped)))
}

async fn join_worker(
    worker: JoinHandle<Result<(), FrameworkError>>,
) -> Result<(), FrameworkError> {
    worker
        .await
        .map_err(|e| FrameworkError::internal(format!("queue worker panicked: {}", e)))?
}

/// Flips to `true` on Ctrl+C
fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    let signal = tx.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "cannot listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown requested");
        let _ = signal.send(true);
    });
    (tx, rx)
}

fn wait_for(mut stopped: watch::Receiver<bool>) -> impl Future<Output = ()> + Send {
    async move {
        let _ = stopped.wait_for(|stop| *stop).await;
    }
}

async fn list_failed_jobs() -> Result<(), FrameworkError> {
    let db = connect().await?;
    let queue = JobQueue::new(Config::get::<QueueConfig>().unwrap_or_else(QueueConfig::from_env));
    let failed = queue.failed_jobs(db.inner()).await?;

    if failed.is_empty() {
        println!("No failed jobs.");
        return Ok(());
    }
    for job in failed {
        println!(
            "{}  attempts {}/{}  updated {}  {}",
            job.job_id,
            job.attempts,
            job.max_attempts,
            job.updated_at,
            job.last_error.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn retry_job(raw: &str) -> Result<(), FrameworkError> {
    let job_id = JobId::parse(raw)
        .map(|(follow_up_id, rule_id)| JobId::for_step(follow_up_id, rule_id))
        .ok_or_else(|| FrameworkError::invalid_input(format!("not a step job id: {}", raw)))?;

    let db = connect().await?;
    let queue = JobQueue::new(Config::get::<QueueConfig>().unwrap_or_else(QueueConfig::from_env));
    if queue.retry_failed(db.inner(), &job_id).await? {
        println!("Requeued {}", job_id);
    } else {
        println!("No failed job {}", job_id);
    }
    Ok(())
}

fn check_delay(delay_ms: i64) -> Result<(), FrameworkError> {
    if (0..=rules::MAX_DELAY_MS).contains(&delay_ms) {
        Ok(())
    } else {
        Err(FrameworkError::invalid_input(format!(
            "delay_ms must be between 0 and {}, got {}",
            rules::MAX_DELAY_MS,
            delay_ms
        )))
    }
}

async fn add_rule(workspace_id: i64, delay_ms: i64, content: String) -> Result<(), FrameworkError> {
    check_delay(delay_ms)?;
    let db = connect().await?;
    let rule = rules::create(db.inner(), workspace_id, delay_ms, content).await?;
    println!("Rule {} added to workspace {}", rule.id, workspace_id);
    Ok(())
}
