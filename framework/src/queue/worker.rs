//! Queue worker daemon

use crate::database::DbConnection;
use crate::error::FrameworkError;
use crate::queue::types::{ClaimedJob, JobStatus};
use crate::queue::JobQueue;
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::Instrument;

/// Something that runs a claimed job
///
/// Returning an error hands the job back to the queue's retry policy.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &ClaimedJob) -> Result<(), FrameworkError>;
}

/// Polls the queue and runs due jobs through a [`JobHandler`]
pub struct QueueWorker {
    db: DbConnection,
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    worker_id: String,
}

impl QueueWorker {
    pub fn new(db: DbConnection, queue: JobQueue, handler: Arc<dyn JobHandler>) -> Self {
        let random: u64 = rand::thread_rng().gen();
        let worker_id = format!("{}-{}", std::process::id(), random);
        Self {
            db,
            queue,
            handler,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until `shutdown` resolves, then wait for in-flight jobs
    pub async fn run<F>(self, shutdown: F) -> Result<(), FrameworkError>
    where
        F: Future<Output = ()> + Send,
    {
        let config = self.queue.config();
        let poll = config.poll_interval();
        let concurrency = config.concurrency;
        let semaphore = Arc::new(Semaphore::new(concurrency));

        tracing::info!(
            worker_id = %self.worker_id,
            concurrency,
            poll_ms = poll.as_millis() as u64,
            "queue worker started"
        );

        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|e| FrameworkError::internal(format!("Worker semaphore closed: {}", e)))?,
            };

            let claim = match self.queue.claim_next(self.db.inner(), &self.worker_id).await {
                Ok(claim) => claim,
                Err(err) => {
                    tracing::warn!(error = %err, "claiming next job failed");
                    None
                }
            };

            match claim {
                Some(job) => {
                    let db = self.db.clone();
                    let queue = self.queue.clone();
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        if let Err(err) = process(&db, &queue, handler.as_ref(), job).await {
                            tracing::error!(error = %err, "job bookkeeping failed");
                        }
                        drop(permit);
                    });
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }
        }

        // Every permit back means every spawned job has finished.
        let _ = semaphore
            .acquire_many(concurrency as u32)
            .await
            .map_err(|e| FrameworkError::internal(format!("Worker semaphore closed: {}", e)))?;

        tracing::info!(worker_id = %self.worker_id, "queue worker stopped");
        Ok(())
    }

    /// Process every job that is due right now, one at a time
    ///
    /// Returns how many jobs were run.
    pub async fn run_once(&self) -> Result<usize, FrameworkError> {
        let mut processed = 0;
        while let Some(job) = self
            .queue
            .claim_next(self.db.inner(), &self.worker_id)
            .await?
        {
            process(&self.db, &self.queue, self.handler.as_ref(), job).await?;
            processed += 1;
        }
        Ok(processed)
    }
}

async fn process(
    db: &DbConnection,
    queue: &JobQueue,
    handler: &dyn JobHandler,
    job: ClaimedJob,
) -> Result<(), FrameworkError> {
    let span = tracing::info_span!("job", job_id = %job.job_id, attempt = job.attempts);

    match handler.handle(&job).instrument(span).await {
        Ok(()) => {
            queue.complete(db.inner(), &job).await?;
            tracing::debug!(job_id = %job.job_id, "job completed");
        }
        Err(err) => match queue.fail(db.inner(), &job, &err).await? {
            JobStatus::Failed => {
                tracing::error!(
                    job_id = %job.job_id,
                    attempts = job.attempts,
                    error = %err,
                    "job failed permanently"
                );
            }
            _ => {
                tracing::warn!(
                    job_id = %job.job_id,
                    attempts = job.attempts,
                    error = %err,
                    "job failed; retry scheduled"
                );
            }
        },
    }

    Ok(())
}
