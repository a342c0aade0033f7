//! Schema migrations for follow-ups, sequence rules and the job queue

use sea_orm_migration::prelude::*;

/// Migrator for every table the framework owns
pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(CreateSequenceRulesTable),
            Box::new(CreateFollowUpsTable),
            Box::new(CreateScheduledJobsTable),
        ]
    }
}

pub struct CreateSequenceRulesTable;

impl MigrationName for CreateSequenceRulesTable {
    fn name(&self) -> &str {
        "m20240101_000001_create_sequence_rules_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for CreateSequenceRulesTable {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SequenceRules::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SequenceRules::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SequenceRules::WorkspaceId).big_integer().not_null())
                    .col(ColumnDef::new(SequenceRules::DelayMs).big_integer().not_null())
                    .col(ColumnDef::new(SequenceRules::MessageContent).text().not_null())
                    .col(
                        ColumnDef::new(SequenceRules::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SequenceRules::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sequence_rules_workspace_order")
                    .table(SequenceRules::Table)
                    .col(SequenceRules::WorkspaceId)
                    .col(SequenceRules::CreatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SequenceRules::Table).to_owned())
            .await
    }
}

pub struct CreateFollowUpsTable;

impl MigrationName for CreateFollowUpsTable {
    fn name(&self) -> &str {
        "m20240101_000002_create_follow_ups_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for CreateFollowUpsTable {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(FollowUps::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FollowUps::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(FollowUps::ClientId).big_integer().not_null())
                    .col(ColumnDef::new(FollowUps::WorkspaceId).big_integer().not_null())
                    .col(ColumnDef::new(FollowUps::Status).string().not_null())
                    .col(ColumnDef::new(FollowUps::CurrentStepOrder).integer().not_null())
                    .col(ColumnDef::new(FollowUps::NextStepAt).timestamp().null())
                    .col(ColumnDef::new(FollowUps::LastRuleId).big_integer().null())
                    .col(ColumnDef::new(FollowUps::ActiveJobId).string().null())
                    .col(ColumnDef::new(FollowUps::ActiveKey).string().null())
                    .col(
                        ColumnDef::new(FollowUps::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(FollowUps::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_follow_ups_client_workspace")
                    .table(FollowUps::Table)
                    .col(FollowUps::ClientId)
                    .col(FollowUps::WorkspaceId)
                    .to_owned(),
            )
            .await?;

        // NULLs are distinct, so only ACTIVE rows compete for the key.
        manager
            .create_index(
                Index::create()
                    .name("idx_follow_ups_active_key")
                    .table(FollowUps::Table)
                    .col(FollowUps::ActiveKey)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(FollowUps::Table).to_owned())
            .await
    }
}

pub struct CreateScheduledJobsTable;

impl MigrationName for CreateScheduledJobsTable {
    fn name(&self) -> &str {
        "m20240101_000003_create_scheduled_jobs_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for CreateScheduledJobsTable {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ScheduledJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ScheduledJobs::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ScheduledJobs::JobId).string().not_null())
                    .col(ColumnDef::new(ScheduledJobs::FollowUpId).big_integer().not_null())
                    .col(ColumnDef::new(ScheduledJobs::RuleId).big_integer().not_null())
                    .col(ColumnDef::new(ScheduledJobs::WorkspaceId).big_integer().not_null())
                    .col(ColumnDef::new(ScheduledJobs::Payload).text().not_null())
                    .col(ColumnDef::new(ScheduledJobs::Status).string().not_null())
                    .col(ColumnDef::new(ScheduledJobs::Attempts).integer().not_null())
                    .col(ColumnDef::new(ScheduledJobs::MaxAttempts).integer().not_null())
                    .col(ColumnDef::new(ScheduledJobs::FireAt).timestamp().not_null())
                    .col(ColumnDef::new(ScheduledJobs::LockedUntil).timestamp().null())
                    .col(ColumnDef::new(ScheduledJobs::WorkerId).string().null())
                    .col(ColumnDef::new(ScheduledJobs::LastError).text().null())
                    .col(
                        ColumnDef::new(ScheduledJobs::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ScheduledJobs::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(ScheduledJobs::CompletedAt).timestamp().null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_scheduled_jobs_job_id")
                    .table(ScheduledJobs::Table)
                    .col(ScheduledJobs::JobId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_scheduled_jobs_status_fire_at")
                    .table(ScheduledJobs::Table)
                    .col(ScheduledJobs::Status)
                    .col(ScheduledJobs::FireAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_scheduled_jobs_follow_up_id")
                    .table(ScheduledJobs::Table)
                    .col(ScheduledJobs::FollowUpId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ScheduledJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SequenceRules {
    Table,
    Id,
    WorkspaceId,
    DelayMs,
    MessageContent,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum FollowUps {
    Table,
    Id,
    ClientId,
    WorkspaceId,
    Status,
    CurrentStepOrder,
    NextStepAt,
    LastRuleId,
    ActiveJobId,
    ActiveKey,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum ScheduledJobs {
    Table,
    Id,
    JobId,
    FollowUpId,
    RuleId,
    WorkspaceId,
    Payload,
    Status,
    Attempts,
    MaxAttempts,
    FireAt,
    LockedUntil,
    WorkerId,
    LastError,
    CreatedAt,
    UpdatedAt,
    CompletedAt,
}
