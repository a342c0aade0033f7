//! Job queue persistence helpers
//!
//! Every function takes the connection to run on, so callers can enlist
//! scheduling and cancellation in their own transaction.

use crate::error::FrameworkError;
use crate::queue::entities::scheduled_jobs;
use crate::queue::types::{ClaimedJob, JobId, JobPayload, JobStatus};
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseBackend, EntityTrait,
    QueryFilter, QueryOrder, Set, Statement,
};
use std::time::Duration;

/// `last_error` of a job parked because its final lease expired
pub const LEASE_EXHAUSTED: &str = "Lease expired on the final attempt";

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Load a job row by its deterministic id
pub async fn find_job<C: ConnectionTrait>(
    conn: &C,
    job_id: &JobId,
) -> Result<Option<scheduled_jobs::Model>, FrameworkError> {
    Ok(scheduled_jobs::Entity::find()
        .filter(scheduled_jobs::Column::JobId.eq(job_id.as_str()))
        .one(conn)
        .await?)
}

/// Insert a pending job, or reset the existing row for the same id
///
/// A job that is currently running keeps its row untouched; its worker is
/// about to finish it. Returns the row as stored.
pub async fn upsert_pending<C: ConnectionTrait>(
    conn: &C,
    job_id: &JobId,
    payload: &JobPayload,
    fire_at: NaiveDateTime,
    max_attempts: i32,
) -> Result<scheduled_jobs::Model, FrameworkError> {
    let now = now();
    let payload_json = serde_json::to_string(payload)?;

    match find_job(conn, job_id).await? {
        Some(existing) if existing.status == JobStatus::Running.as_str() => {
            tracing::debug!(job_id = %job_id, "job is running; reschedule skipped");
            Ok(existing)
        }
        Some(existing) => {
            let mut active: scheduled_jobs::ActiveModel = existing.into();
            active.payload = Set(payload_json);
            active.status = Set(JobStatus::Pending.as_str().to_string());
            active.attempts = Set(0);
            active.max_attempts = Set(max_attempts);
            active.fire_at = Set(fire_at);
            active.locked_until = Set(None);
            active.worker_id = Set(None);
            active.last_error = Set(None);
            active.completed_at = Set(None);
            active.updated_at = Set(now);
            Ok(active.update(conn).await?)
        }
        None => {
            let model = scheduled_jobs::ActiveModel {
                job_id: Set(job_id.to_string()),
                follow_up_id: Set(payload.follow_up_id),
                rule_id: Set(payload.rule_id),
                workspace_id: Set(payload.workspace_id),
                payload: Set(payload_json),
                status: Set(JobStatus::Pending.as_str().to_string()),
                attempts: Set(0),
                max_attempts: Set(max_attempts),
                fire_at: Set(fire_at),
                locked_until: Set(None),
                worker_id: Set(None),
                last_error: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
                completed_at: Set(None),
                ..Default::default()
            };
            Ok(model.insert(conn).await?)
        }
    }
}

/// Delete a pending job by id
pub async fn delete_pending<C: ConnectionTrait>(
    conn: &C,
    job_id: &JobId,
) -> Result<bool, FrameworkError> {
    let result = scheduled_jobs::Entity::delete_many()
        .filter(scheduled_jobs::Column::JobId.eq(job_id.as_str()))
        .filter(scheduled_jobs::Column::Status.eq(JobStatus::Pending.as_str()))
        .exec(conn)
        .await?;
    Ok(result.rows_affected > 0)
}

/// Delete every pending step job of a follow-up
///
/// Matches on the id prefix and re-checks the stored follow-up id, so an id
/// that merely shares the prefix can never be swept up.
pub async fn delete_pending_for<C: ConnectionTrait>(
    conn: &C,
    follow_up_id: i64,
) -> Result<u64, FrameworkError> {
    let result = scheduled_jobs::Entity::delete_many()
        .filter(scheduled_jobs::Column::JobId.starts_with(JobId::prefix_for(follow_up_id)))
        .filter(scheduled_jobs::Column::FollowUpId.eq(follow_up_id))
        .filter(scheduled_jobs::Column::Status.eq(JobStatus::Pending.as_str()))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

/// Pending jobs of one follow-up, soonest first
pub async fn pending_for<C: ConnectionTrait>(
    conn: &C,
    follow_up_id: i64,
) -> Result<Vec<scheduled_jobs::Model>, FrameworkError> {
    Ok(scheduled_jobs::Entity::find()
        .filter(scheduled_jobs::Column::FollowUpId.eq(follow_up_id))
        .filter(scheduled_jobs::Column::Status.eq(JobStatus::Pending.as_str()))
        .order_by_asc(scheduled_jobs::Column::FireAt)
        .all(conn)
        .await?)
}

/// Jobs parked after exhausting their attempts
pub async fn failed_jobs<C: ConnectionTrait>(
    conn: &C,
) -> Result<Vec<scheduled_jobs::Model>, FrameworkError> {
    Ok(scheduled_jobs::Entity::find()
        .filter(scheduled_jobs::Column::Status.eq(JobStatus::Failed.as_str()))
        .order_by_desc(scheduled_jobs::Column::UpdatedAt)
        .all(conn)
        .await?)
}

/// Put a parked job back in line with a fresh attempt budget
pub async fn requeue_failed<C: ConnectionTrait>(
    conn: &C,
    job_id: &JobId,
) -> Result<bool, FrameworkError> {
    let now = now();
    let result = scheduled_jobs::Entity::update_many()
        .col_expr(
            scheduled_jobs::Column::Status,
            Expr::value(JobStatus::Pending.as_str()),
        )
        .col_expr(scheduled_jobs::Column::Attempts, Expr::value(0))
        .col_expr(scheduled_jobs::Column::FireAt, Expr::value(now))
        .col_expr(scheduled_jobs::Column::CompletedAt, Expr::value(Option::<NaiveDateTime>::None))
        .col_expr(scheduled_jobs::Column::UpdatedAt, Expr::value(now))
        .filter(scheduled_jobs::Column::JobId.eq(job_id.as_str()))
        .filter(scheduled_jobs::Column::Status.eq(JobStatus::Failed.as_str()))
        .exec(conn)
        .await?;
    Ok(result.rows_affected > 0)
}

/// Park running jobs whose lease expired with no attempts left
///
/// Their worker died or hung on the final attempt; redelivering would go past
/// `max_attempts`. Returns how many rows were parked.
pub async fn park_exhausted_leases<C: ConnectionTrait>(
    conn: &C,
    now: NaiveDateTime,
) -> Result<u64, FrameworkError> {
    let result = scheduled_jobs::Entity::update_many()
        .col_expr(
            scheduled_jobs::Column::Status,
            Expr::value(JobStatus::Failed.as_str()),
        )
        .col_expr(
            scheduled_jobs::Column::LastError,
            Expr::value(Some(LEASE_EXHAUSTED.to_string())),
        )
        .col_expr(
            scheduled_jobs::Column::LockedUntil,
            Expr::value(Option::<NaiveDateTime>::None),
        )
        .col_expr(scheduled_jobs::Column::WorkerId, Expr::value(Option::<String>::None))
        .col_expr(scheduled_jobs::Column::CompletedAt, Expr::value(Some(now)))
        .col_expr(scheduled_jobs::Column::UpdatedAt, Expr::value(now))
        .filter(scheduled_jobs::Column::Status.eq(JobStatus::Running.as_str()))
        .filter(scheduled_jobs::Column::LockedUntil.lte(now))
        .filter(
            Expr::col(scheduled_jobs::Column::Attempts)
                .gte(Expr::col(scheduled_jobs::Column::MaxAttempts)),
        )
        .exec(conn)
        .await?;

    if result.rows_affected > 0 {
        tracing::error!(
            parked = result.rows_affected,
            "jobs lost their lease on the final attempt; parked as failed"
        );
    }
    Ok(result.rows_affected)
}

/// Claim the next due job
///
/// A job is due when it is pending and its `fire_at` has passed, or when it
/// is running under a lease that expired (its worker died mid-flight) and
/// still has attempts left.
pub async fn claim_next<C: ConnectionTrait>(
    conn: &C,
    worker_id: &str,
    lock_timeout: Duration,
) -> Result<Option<ClaimedJob>, FrameworkError> {
    let now = now();
    let lock_until = now
        + ChronoDuration::from_std(lock_timeout)
            .map_err(|e| FrameworkError::queue(format!("Invalid lock timeout: {}", e)))?;

    park_exhausted_leases(conn, now).await?;

    if conn.get_database_backend() == DatabaseBackend::Postgres {
        return claim_next_postgres(conn, worker_id, now, lock_until).await;
    }

    let due = Condition::any()
        .add(
            Condition::all()
                .add(scheduled_jobs::Column::Status.eq(JobStatus::Pending.as_str()))
                .add(scheduled_jobs::Column::FireAt.lte(now)),
        )
        .add(
            Condition::all()
                .add(scheduled_jobs::Column::Status.eq(JobStatus::Running.as_str()))
                .add(scheduled_jobs::Column::LockedUntil.lte(now))
                .add(
                    Expr::col(scheduled_jobs::Column::Attempts)
                        .lt(Expr::col(scheduled_jobs::Column::MaxAttempts)),
                ),
        );

    let candidate = scheduled_jobs::Entity::find()
        .filter(due)
        .order_by_asc(scheduled_jobs::Column::FireAt)
        .order_by_asc(scheduled_jobs::Column::Id)
        .one(conn)
        .await?;

    let Some(candidate) = candidate else {
        return Ok(None);
    };

    // Compare-and-set on the state we read; another worker that got there
    // first changes status or attempts and this update matches nothing.
    let result = scheduled_jobs::Entity::update_many()
        .col_expr(
            scheduled_jobs::Column::Status,
            Expr::value(JobStatus::Running.as_str()),
        )
        .col_expr(
            scheduled_jobs::Column::Attempts,
            Expr::col(scheduled_jobs::Column::Attempts).add(1),
        )
        .col_expr(scheduled_jobs::Column::LockedUntil, Expr::value(Some(lock_until)))
        .col_expr(
            scheduled_jobs::Column::WorkerId,
            Expr::value(Some(worker_id.to_string())),
        )
        .col_expr(scheduled_jobs::Column::UpdatedAt, Expr::value(now))
        .filter(scheduled_jobs::Column::Id.eq(candidate.id))
        .filter(scheduled_jobs::Column::Status.eq(candidate.status.clone()))
        .filter(scheduled_jobs::Column::Attempts.eq(candidate.attempts))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Ok(None);
    }

    Ok(Some(ClaimedJob {
        id: candidate.id,
        job_id: JobId::from_raw(candidate.job_id),
        payload: candidate.payload,
        attempts: candidate.attempts + 1,
        max_attempts: candidate.max_attempts,
        worker_id: worker_id.to_string(),
    }))
}

async fn claim_next_postgres<C: ConnectionTrait>(
    conn: &C,
    worker_id: &str,
    now: NaiveDateTime,
    lock_until: NaiveDateTime,
) -> Result<Option<ClaimedJob>, FrameworkError> {
    let sql = r#"
        UPDATE scheduled_jobs
        SET status = 'running',
            attempts = attempts + 1,
            locked_until = $1,
            worker_id = $2,
            updated_at = $3
        WHERE id = (
            SELECT id
            FROM scheduled_jobs
            WHERE (status = 'pending' AND fire_at <= $3)
               OR (status = 'running' AND locked_until <= $3 AND attempts < max_attempts)
            ORDER BY fire_at, id
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        RETURNING id, job_id, payload, attempts, max_attempts
    "#;

    let stmt = Statement::from_sql_and_values(
        DatabaseBackend::Postgres,
        sql,
        vec![lock_until.into(), worker_id.into(), now.into()],
    );

    let Some(row) = conn.query_one(stmt).await? else {
        return Ok(None);
    };

    let job_id: String = row.try_get("", "job_id")?;
    Ok(Some(ClaimedJob {
        id: row.try_get("", "id")?,
        job_id: JobId::from_raw(job_id),
        payload: row.try_get("", "payload")?,
        attempts: row.try_get("", "attempts")?,
        max_attempts: row.try_get("", "max_attempts")?,
        worker_id: worker_id.to_string(),
    }))
}

/// Mark a claimed job as done
///
/// Only the delivery that still holds the row is recorded; returns `false`
/// when the lease was lost to another delivery.
pub async fn mark_completed<C: ConnectionTrait>(
    conn: &C,
    job: &ClaimedJob,
) -> Result<bool, FrameworkError> {
    let now = now();
    let result = scheduled_jobs::Entity::update_many()
        .col_expr(
            scheduled_jobs::Column::Status,
            Expr::value(JobStatus::Completed.as_str()),
        )
        .col_expr(scheduled_jobs::Column::CompletedAt, Expr::value(Some(now)))
        .col_expr(
            scheduled_jobs::Column::LockedUntil,
            Expr::value(Option::<NaiveDateTime>::None),
        )
        .col_expr(scheduled_jobs::Column::WorkerId, Expr::value(Option::<String>::None))
        .col_expr(scheduled_jobs::Column::UpdatedAt, Expr::value(now))
        .filter(held_by(job))
        .exec(conn)
        .await?;
    Ok(result.rows_affected > 0)
}

/// Rows still leased to this delivery of `job`
fn held_by(job: &ClaimedJob) -> Condition {
    Condition::all()
        .add(scheduled_jobs::Column::Id.eq(job.id))
        .add(scheduled_jobs::Column::Status.eq(JobStatus::Running.as_str()))
        .add(scheduled_jobs::Column::WorkerId.eq(job.worker_id.as_str()))
        .add(scheduled_jobs::Column::Attempts.eq(job.attempts))
}

/// Put a failed attempt back in line at `next_fire_at`
pub async fn requeue<C: ConnectionTrait>(
    conn: &C,
    job: &ClaimedJob,
    error: &str,
    next_fire_at: NaiveDateTime,
) -> Result<bool, FrameworkError> {
    release(conn, job, JobStatus::Pending, error, next_fire_at).await
}

/// Park a job in the failure set
pub async fn mark_failed<C: ConnectionTrait>(
    conn: &C,
    job: &ClaimedJob,
    error: &str,
) -> Result<bool, FrameworkError> {
    release(conn, job, JobStatus::Failed, error, now()).await
}

async fn release<C: ConnectionTrait>(
    conn: &C,
    job: &ClaimedJob,
    status: JobStatus,
    error: &str,
    fire_at: NaiveDateTime,
) -> Result<bool, FrameworkError> {
    let now = now();
    let completed_at = (status == JobStatus::Failed).then_some(now);

    let result = scheduled_jobs::Entity::update_many()
        .col_expr(scheduled_jobs::Column::Status, Expr::value(status.as_str()))
        .col_expr(
            scheduled_jobs::Column::LastError,
            Expr::value(Some(error.to_string())),
        )
        .col_expr(scheduled_jobs::Column::FireAt, Expr::value(fire_at))
        .col_expr(
            scheduled_jobs::Column::LockedUntil,
            Expr::value(Option::<NaiveDateTime>::None),
        )
        .col_expr(scheduled_jobs::Column::WorkerId, Expr::value(Option::<String>::None))
        .col_expr(scheduled_jobs::Column::CompletedAt, Expr::value(completed_at))
        .col_expr(scheduled_jobs::Column::UpdatedAt, Expr::value(now))
        .filter(held_by(job))
        .exec(conn)
        .await?;
    Ok(result.rows_affected > 0)
}
