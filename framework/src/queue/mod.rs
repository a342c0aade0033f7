//! Durable delayed-job queue
//!
//! Step jobs live in the `scheduled_jobs` table of the same database as the
//! follow-ups they drive. That lets the sequence engine schedule and cancel
//! jobs inside the transaction that changes a follow-up's status, so a
//! status change and its job bookkeeping commit or roll back together.
//!
//! # Delivery guarantees
//!
//! - A job fires no earlier than its `fire_at`.
//! - Scheduling an id that already has a row resets that row; there is never
//!   more than one future firing per id.
//! - Delivery is at-least-once: a worker that dies mid-job loses its lease and
//!   the job is claimed again. Handlers must tolerate redelivery.
//! - Failed attempts retry with exponential backoff until `max_attempts`,
//!   after which the job is parked as `failed` for manual review.
//!
//! ```rust,ignore
//! let queue = JobQueue::new(QueueConfig::from_env());
//! let txn = db.begin().await?;
//! queue.schedule(&txn, &payload, Duration::from_secs(3600)).await?;
//! txn.commit().await?;
//!
//! // elsewhere:
//! QueueWorker::new(db, queue, Arc::new(handler)).run(shutdown_signal()).await?;
//! ```

pub mod entities;
pub mod store;
pub mod types;
pub mod worker;

pub use entities::scheduled_jobs;
pub use types::{ClaimedJob, JobId, JobPayload, JobStatus};
pub use worker::{JobHandler, QueueWorker};

use crate::config::QueueConfig;
use crate::error::FrameworkError;
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use sea_orm::ConnectionTrait;
use std::sync::Arc;
use std::time::Duration;

/// Handle to the job queue
///
/// Carries the retry policy; all state is in the database, so clones are
/// interchangeable.
#[derive(Debug, Clone)]
pub struct JobQueue {
    config: Arc<QueueConfig>,
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Schedule the step job for `payload` to fire after `delay`
    ///
    /// Returns the job id and the time it is due.
    pub async fn schedule<C: ConnectionTrait>(
        &self,
        conn: &C,
        payload: &JobPayload,
        delay: Duration,
    ) -> Result<(JobId, NaiveDateTime), FrameworkError> {
        let job_id = payload.job_id();
        let delay = ChronoDuration::from_std(delay)
            .map_err(|e| FrameworkError::queue(format!("Delay out of range: {}", e)))?;
        let fire_at = Utc::now().naive_utc() + delay;

        let row =
            store::upsert_pending(conn, &job_id, payload, fire_at, self.config.max_attempts)
                .await?;

        tracing::debug!(job_id = %job_id, fire_at = %row.fire_at, "job scheduled");
        Ok((job_id, row.fire_at))
    }

    /// Cancel one pending job; `false` if there was nothing to cancel
    pub async fn cancel<C: ConnectionTrait>(
        &self,
        conn: &C,
        job_id: &JobId,
    ) -> Result<bool, FrameworkError> {
        store::delete_pending(conn, job_id).await
    }

    /// Cancel every pending step job of a follow-up
    ///
    /// A job that is already running cannot be recalled; its handler has to
    /// re-check the follow-up before acting.
    pub async fn cancel_all_for<C: ConnectionTrait>(
        &self,
        conn: &C,
        follow_up_id: i64,
    ) -> Result<u64, FrameworkError> {
        let cancelled = store::delete_pending_for(conn, follow_up_id).await?;
        if cancelled > 0 {
            tracing::debug!(follow_up_id, cancelled, "pending jobs cancelled");
        }
        Ok(cancelled)
    }

    /// Look up a job by id
    pub async fn find<C: ConnectionTrait>(
        &self,
        conn: &C,
        job_id: &JobId,
    ) -> Result<Option<scheduled_jobs::Model>, FrameworkError> {
        store::find_job(conn, job_id).await
    }

    /// Pending jobs of a follow-up
    pub async fn pending_for<C: ConnectionTrait>(
        &self,
        conn: &C,
        follow_up_id: i64,
    ) -> Result<Vec<scheduled_jobs::Model>, FrameworkError> {
        store::pending_for(conn, follow_up_id).await
    }

    /// The failure set
    pub async fn failed_jobs<C: ConnectionTrait>(
        &self,
        conn: &C,
    ) -> Result<Vec<scheduled_jobs::Model>, FrameworkError> {
        store::failed_jobs(conn).await
    }

    /// Retry a parked job now
    pub async fn retry_failed<C: ConnectionTrait>(
        &self,
        conn: &C,
        job_id: &JobId,
    ) -> Result<bool, FrameworkError> {
        store::requeue_failed(conn, job_id).await
    }

    /// Claim the next due job for `worker_id`
    pub async fn claim_next<C: ConnectionTrait>(
        &self,
        conn: &C,
        worker_id: &str,
    ) -> Result<Option<ClaimedJob>, FrameworkError> {
        store::claim_next(conn, worker_id, self.config.lock_timeout()).await
    }

    /// Record a successful run
    ///
    /// A delivery whose lease was taken over by another worker leaves the row
    /// alone.
    pub async fn complete<C: ConnectionTrait>(
        &self,
        conn: &C,
        job: &ClaimedJob,
    ) -> Result<(), FrameworkError> {
        if !store::mark_completed(conn, job).await? {
            tracing::warn!(
                job_id = %job.job_id,
                attempt = job.attempts,
                "completion ignored; lease no longer held"
            );
        }
        Ok(())
    }

    /// Record a failed run; retries with backoff or parks the job
    ///
    /// Non-retryable errors park immediately. Returns the resulting status.
    pub async fn fail<C: ConnectionTrait>(
        &self,
        conn: &C,
        job: &ClaimedJob,
        error: &FrameworkError,
    ) -> Result<JobStatus, FrameworkError> {
        let message = error.to_string();

        let (status, held) = if error.is_transient() && job.attempts < job.max_attempts {
            let next_fire_at = Utc::now().naive_utc() + self.config.backoff_for(job.attempts);
            let held = store::requeue(conn, job, &message, next_fire_at).await?;
            (JobStatus::Pending, held)
        } else {
            (JobStatus::Failed, store::mark_failed(conn, job, &message).await?)
        };

        if !held {
            tracing::warn!(
                job_id = %job.job_id,
                attempt = job.attempts,
                "failure ignored; lease no longer held"
            );
        }
        Ok(status)
    }
}
