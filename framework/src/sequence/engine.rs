//! The follow-up state machine
//!
//! Every operation runs in one transaction that reads the follow-up row
//! with an exclusive lock, schedules or cancels queue jobs on the same
//! transaction, and writes the new state with a guard on the status it
//! read. Two racing operations on one follow-up therefore serialize, and
//! the second one sees the first one's result. Events are published only
//! after commit.

use crate::database::{is_unique_violation, DbConnection};
use crate::error::FrameworkError;
use crate::queue::{JobId, JobPayload, JobQueue};
use crate::realtime::{ChannelName, NotificationBus, ServerEvent};
use crate::sequence::entities::{follow_ups, sequence_rules};
use crate::sequence::rules;
use crate::sequence::types::{
    DataIntegrityWarning, FollowUpStatus, Outcome, SequenceError, Transition,
};
use chrono::{NaiveDateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, DbErr, EntityTrait,
    QueryFilter, QuerySelect, Set, TransactionTrait,
};
use serde_json::json;

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn active_key(client_id: i64, workspace_id: i64) -> String {
    format!("{}:{}", client_id, workspace_id)
}

fn db_error(err: DbErr) -> SequenceError {
    if is_unique_violation(&err) {
        SequenceError::conflict("Client already has an active follow-up in this workspace")
    } else {
        err.into()
    }
}

fn status_of(follow_up: &follow_ups::Model) -> Result<FollowUpStatus, SequenceError> {
    FollowUpStatus::from_str(&follow_up.status).ok_or_else(|| {
        FrameworkError::internal(format!(
            "Follow-up {} has unknown status '{}'",
            follow_up.id, follow_up.status
        ))
        .into()
    })
}

/// What happened when a step was due to be scheduled
enum Step {
    Scheduled {
        job_id: JobId,
        fire_at: NaiveDateTime,
    },
    Unscheduled(DataIntegrityWarning),
}

impl Step {
    fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Scheduled { job_id, .. } => Some(job_id.clone()),
            Self::Unscheduled(_) => None,
        }
    }

    fn warning(self) -> Option<DataIntegrityWarning> {
        match self {
            Self::Scheduled { .. } => None,
            Self::Unscheduled(warning) => Some(warning),
        }
    }
}

/// New values for a follow-up row
///
/// `active_key` is derived from `status` when applied.
struct Patch {
    status: FollowUpStatus,
    current_step_order: i32,
    next_step_at: Option<NaiveDateTime>,
    last_rule_id: Option<i64>,
    active_job_id: Option<String>,
}

impl Patch {
    /// Move to `status` with no standing job
    fn settle(current: &follow_ups::Model, status: FollowUpStatus) -> Self {
        Self {
            status,
            current_step_order: current.current_step_order,
            next_step_at: None,
            last_rule_id: current.last_rule_id,
            active_job_id: None,
        }
    }

    /// Stay or become ACTIVE at `order`, with `rule` as the step in flight
    fn step(order: i32, rule: &sequence_rules::Model, step: &Step) -> Self {
        let (next_step_at, active_job_id) = match step {
            Step::Scheduled { job_id, fire_at } => (Some(*fire_at), Some(job_id.to_string())),
            Step::Unscheduled(_) => (None, None),
        };
        Self {
            status: FollowUpStatus::Active,
            current_step_order: order,
            next_step_at,
            last_rule_id: Some(rule.id),
            active_job_id,
        }
    }
}

/// Drives follow-ups through their sequence
#[derive(Clone)]
pub struct SequenceEngine {
    db: DbConnection,
    queue: JobQueue,
    bus: NotificationBus,
}

impl SequenceEngine {
    pub fn new(db: DbConnection, queue: JobQueue, bus: NotificationBus) -> Self {
        Self { db, queue, bus }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn db(&self) -> &DbConnection {
        &self.db
    }

    /// Load a follow-up without locking it
    pub async fn find(
        &self,
        follow_up_id: i64,
    ) -> Result<Option<follow_ups::Model>, FrameworkError> {
        Ok(follow_ups::Entity::find_by_id(follow_up_id)
            .one(self.db.inner())
            .await?)
    }

    /// Start a client on the workspace's sequence
    ///
    /// The first step is scheduled after the first rule's delay.
    pub async fn start(&self, client_id: i64, workspace_id: i64) -> Result<Outcome, SequenceError> {
        if client_id <= 0 {
            return Err(SequenceError::validation("client_id must be a positive id"));
        }
        if workspace_id <= 0 {
            return Err(SequenceError::validation("workspace_id must be a positive id"));
        }

        let txn = self.db.begin().await?;

        if let Some(existing) = find_active(&txn, client_id, workspace_id).await? {
            return Err(SequenceError::conflict(format!(
                "Client {} already has active follow-up {} in workspace {}",
                client_id, existing.id, workspace_id
            )));
        }

        let rules = rules::ordered_for_workspace(&txn, workspace_id).await?;
        let Some(first) = rules.first() else {
            return Err(SequenceError::not_found(format!(
                "Workspace {} has no sequence rules",
                workspace_id
            )));
        };

        let now = now();
        let created = follow_ups::ActiveModel {
            client_id: Set(client_id),
            workspace_id: Set(workspace_id),
            status: Set(FollowUpStatus::Active.as_str().to_string()),
            current_step_order: Set(1),
            next_step_at: Set(None),
            last_rule_id: Set(Some(first.id)),
            active_job_id: Set(None),
            active_key: Set(Some(active_key(client_id, workspace_id))),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(db_error)?;

        let step = self.schedule_step(&txn, &created, first).await?;
        let follow_up = apply(
            &txn,
            &created,
            FollowUpStatus::Active,
            Patch::step(1, first, &step),
        )
        .await?;

        tracing::info!(
            follow_up_id = follow_up.id,
            client_id,
            workspace_id,
            "follow-up started"
        );

        self.finish(
            txn,
            Outcome::Applied {
                follow_up,
                transition: Transition::Started,
                job_id: step.job_id(),
                warning: step.warning(),
            },
        )
        .await
    }

    /// ACTIVE → PAUSED; the pending step is cancelled
    pub async fn pause(&self, follow_up_id: i64, workspace_id: i64) -> Result<Outcome, SequenceError> {
        let txn = self.db.begin().await?;
        let current = lock_follow_up(&txn, follow_up_id, workspace_id).await?;
        let status = status_of(&current)?;

        if status != FollowUpStatus::Active {
            return Err(SequenceError::conflict(format!(
                "Cannot pause a {} follow-up",
                status
            )));
        }

        self.queue.cancel_all_for(&txn, current.id).await?;
        let follow_up = apply(
            &txn,
            &current,
            status,
            Patch::settle(&current, FollowUpStatus::Paused),
        )
        .await?;

        tracing::info!(follow_up_id, "follow-up paused");
        self.finish(txn, applied(follow_up, Transition::Paused)).await
    }

    /// PAUSED → ACTIVE, continuing after the last scheduled step
    ///
    /// With no step left the follow-up completes instead.
    pub async fn resume(&self, follow_up_id: i64, workspace_id: i64) -> Result<Outcome, SequenceError> {
        let txn = self.db.begin().await?;
        let current = lock_follow_up(&txn, follow_up_id, workspace_id).await?;
        let status = status_of(&current)?;

        if status != FollowUpStatus::Paused {
            return Err(SequenceError::conflict(format!(
                "Cannot resume a {} follow-up",
                status
            )));
        }

        let rules = rules::ordered_for_workspace(&txn, workspace_id).await?;
        let next = rules::next_after(&rules, current.last_rule_id, current.current_step_order);

        let Some((index, rule)) = next else {
            let follow_up = apply(
                &txn,
                &current,
                status,
                Patch::settle(&current, FollowUpStatus::Completed),
            )
            .await?;
            tracing::info!(follow_up_id, "follow-up resumed with no steps left; completed");
            return self
                .finish(txn, applied(follow_up, Transition::Completed))
                .await;
        };

        if let Some(other) = find_active(&txn, current.client_id, workspace_id).await? {
            return Err(SequenceError::conflict(format!(
                "Client {} already has active follow-up {} in workspace {}",
                current.client_id, other.id, workspace_id
            )));
        }

        let step = self.schedule_step(&txn, &current, rule).await?;
        let follow_up = apply(
            &txn,
            &current,
            status,
            Patch::step(index as i32 + 1, rule, &step),
        )
        .await?;

        tracing::info!(follow_up_id, rule_id = rule.id, "follow-up resumed");
        self.finish(
            txn,
            Outcome::Applied {
                follow_up,
                transition: Transition::Resumed,
                job_id: step.job_id(),
                warning: step.warning(),
            },
        )
        .await
    }

    /// ACTIVE → CANCELLED
    ///
    /// Cancelling a finished follow-up reports `AlreadyTerminal`.
    pub async fn cancel(&self, follow_up_id: i64, workspace_id: i64) -> Result<Outcome, SequenceError> {
        let txn = self.db.begin().await?;
        let current = lock_follow_up(&txn, follow_up_id, workspace_id).await?;
        let status = status_of(&current)?;

        if status.is_terminal() {
            return self
                .finish(txn, Outcome::AlreadyTerminal { follow_up: current })
                .await;
        }
        if status != FollowUpStatus::Active {
            return Err(SequenceError::conflict(format!(
                "Cannot cancel a {} follow-up",
                status
            )));
        }

        self.queue.cancel_all_for(&txn, current.id).await?;
        let follow_up = apply(
            &txn,
            &current,
            status,
            Patch::settle(&current, FollowUpStatus::Cancelled),
        )
        .await?;

        tracing::info!(follow_up_id, "follow-up cancelled");
        self.finish(txn, applied(follow_up, Transition::Cancelled)).await
    }

    /// ACTIVE or PAUSED → CONVERTED
    ///
    /// Converting a finished follow-up reports `AlreadyTerminal`.
    pub async fn convert(&self, follow_up_id: i64, workspace_id: i64) -> Result<Outcome, SequenceError> {
        let txn = self.db.begin().await?;
        let current = lock_follow_up(&txn, follow_up_id, workspace_id).await?;
        let status = status_of(&current)?;

        if status.is_terminal() {
            return self
                .finish(txn, Outcome::AlreadyTerminal { follow_up: current })
                .await;
        }

        self.queue.cancel_all_for(&txn, current.id).await?;
        let follow_up = apply(
            &txn,
            &current,
            status,
            Patch::settle(&current, FollowUpStatus::Converted),
        )
        .await?;

        tracing::info!(follow_up_id, from = %status, "follow-up converted");
        self.finish(txn, applied(follow_up, Transition::Converted)).await
    }

    /// Move past a step whose message went out
    ///
    /// Schedules the next rule, or completes the follow-up after the last
    /// one. A callback for a follow-up that is no longer ACTIVE, or for a
    /// step other than the one in flight, changes nothing and reports
    /// `Skipped`.
    pub async fn advance_after_step(
        &self,
        follow_up_id: i64,
        rule_id: i64,
    ) -> Result<Outcome, SequenceError> {
        let txn = self.db.begin().await?;
        let current = follow_ups::Entity::find_by_id(follow_up_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| {
                SequenceError::not_found(format!("Follow-up {} not found", follow_up_id))
            })?;
        let status = status_of(&current)?;

        if status != FollowUpStatus::Active {
            return self
                .finish(
                    txn,
                    Outcome::Skipped {
                        follow_up_id,
                        reason: format!("follow-up is {}", status),
                    },
                )
                .await;
        }
        if current.last_rule_id != Some(rule_id) {
            return self
                .finish(
                    txn,
                    Outcome::Skipped {
                        follow_up_id,
                        reason: format!(
                            "rule {} is not the step in flight ({:?})",
                            rule_id, current.last_rule_id
                        ),
                    },
                )
                .await;
        }

        let order = current.current_step_order + 1;
        let rules = rules::ordered_for_workspace(&txn, current.workspace_id).await?;

        let Some((_, rule)) = rules::next_after(&rules, Some(rule_id), current.current_step_order)
        else {
            let mut patch = Patch::settle(&current, FollowUpStatus::Completed);
            patch.current_step_order = order;
            let follow_up = apply(&txn, &current, status, patch).await?;
            tracing::info!(follow_up_id, "follow-up completed");
            return self
                .finish(txn, applied(follow_up, Transition::Completed))
                .await;
        };

        let step = self.schedule_step(&txn, &current, rule).await?;
        let follow_up = apply(&txn, &current, status, Patch::step(order, rule, &step)).await?;

        tracing::debug!(follow_up_id, order, rule_id = rule.id, "follow-up advanced");
        self.finish(
            txn,
            Outcome::Applied {
                follow_up,
                transition: Transition::Advanced,
                job_id: step.job_id(),
                warning: step.warning(),
            },
        )
        .await
    }

    async fn schedule_step(
        &self,
        txn: &DatabaseTransaction,
        follow_up: &follow_ups::Model,
        rule: &sequence_rules::Model,
    ) -> Result<Step, SequenceError> {
        match rules::delay_of(rule) {
            Ok(delay) => {
                let payload = JobPayload {
                    follow_up_id: follow_up.id,
                    rule_id: rule.id,
                    workspace_id: follow_up.workspace_id,
                };
                let (job_id, fire_at) = self.queue.schedule(txn, &payload, delay).await?;
                Ok(Step::Scheduled { job_id, fire_at })
            }
            Err(reason) => {
                let warning = DataIntegrityWarning {
                    follow_up_id: follow_up.id,
                    rule_id: rule.id,
                    delay_ms: rule.delay_ms,
                    reason: reason.to_string(),
                };
                tracing::warn!(
                    follow_up_id = follow_up.id,
                    rule_id = rule.id,
                    delay_ms = rule.delay_ms,
                    reason,
                    "data integrity: step left unscheduled"
                );
                Ok(Step::Unscheduled(warning))
            }
        }
    }

    async fn finish(
        &self,
        txn: DatabaseTransaction,
        outcome: Outcome,
    ) -> Result<Outcome, SequenceError> {
        txn.commit().await?;

        if let Outcome::Applied {
            follow_up,
            transition,
            warning,
            ..
        } = &outcome
        {
            let event = ServerEvent::new(
                transition.event_kind(),
                json!({
                    "follow_up": follow_up,
                    "warning": warning.as_ref().map(ToString::to_string),
                }),
            );
            self.bus
                .notify(&ChannelName::workspace(follow_up.workspace_id), event)
                .await;
        }

        Ok(outcome)
    }
}

fn applied(follow_up: follow_ups::Model, transition: Transition) -> Outcome {
    Outcome::Applied {
        follow_up,
        transition,
        job_id: None,
        warning: None,
    }
}

async fn find_active<C: ConnectionTrait>(
    conn: &C,
    client_id: i64,
    workspace_id: i64,
) -> Result<Option<follow_ups::Model>, SequenceError> {
    Ok(follow_ups::Entity::find()
        .filter(follow_ups::Column::ClientId.eq(client_id))
        .filter(follow_ups::Column::WorkspaceId.eq(workspace_id))
        .filter(follow_ups::Column::Status.eq(FollowUpStatus::Active.as_str()))
        .one(conn)
        .await?)
}

async fn lock_follow_up(
    txn: &DatabaseTransaction,
    follow_up_id: i64,
    workspace_id: i64,
) -> Result<follow_ups::Model, SequenceError> {
    follow_ups::Entity::find_by_id(follow_up_id)
        .filter(follow_ups::Column::WorkspaceId.eq(workspace_id))
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| {
            SequenceError::not_found(format!(
                "Follow-up {} not found in workspace {}",
                follow_up_id, workspace_id
            ))
        })
}

/// Write `patch` if the row still has status `expected`
async fn apply(
    txn: &DatabaseTransaction,
    current: &follow_ups::Model,
    expected: FollowUpStatus,
    patch: Patch,
) -> Result<follow_ups::Model, SequenceError> {
    let now = now();
    let key = (patch.status == FollowUpStatus::Active)
        .then(|| active_key(current.client_id, current.workspace_id));

    let result = follow_ups::Entity::update_many()
        .col_expr(follow_ups::Column::Status, Expr::value(patch.status.as_str()))
        .col_expr(
            follow_ups::Column::CurrentStepOrder,
            Expr::value(patch.current_step_order),
        )
        .col_expr(follow_ups::Column::NextStepAt, Expr::value(patch.next_step_at))
        .col_expr(follow_ups::Column::LastRuleId, Expr::value(patch.last_rule_id))
        .col_expr(
            follow_ups::Column::ActiveJobId,
            Expr::value(patch.active_job_id.clone()),
        )
        .col_expr(follow_ups::Column::ActiveKey, Expr::value(key.clone()))
        .col_expr(follow_ups::Column::UpdatedAt, Expr::value(now))
        .filter(follow_ups::Column::Id.eq(current.id))
        .filter(follow_ups::Column::Status.eq(expected.as_str()))
        .exec(txn)
        .await
        .map_err(db_error)?;

    if result.rows_affected == 0 {
        return Err(SequenceError::conflict(format!(
            "Follow-up {} is no longer {}",
            current.id, expected
        )));
    }

    Ok(follow_ups::Model {
        status: patch.status.as_str().to_string(),
        current_step_order: patch.current_step_order,
        next_step_at: patch.next_step_at,
        last_rule_id: patch.last_rule_id,
        active_job_id: patch.active_job_id,
        active_key: key,
        updated_at: now,
        ..current.clone()
    })
}
