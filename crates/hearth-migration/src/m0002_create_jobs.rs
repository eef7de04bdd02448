use sea_orm_migration::prelude::*;

use crate::m0001_create_servers::Servers;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Jobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Jobs::ServerId).uuid().not_null())
                    .col(ColumnDef::new(Jobs::Action).string().not_null())
                    .col(ColumnDef::new(Jobs::Status).string().not_null())
                    .col(ColumnDef::new(Jobs::Error).text().null())
                    .col(ColumnDef::new(Jobs::NotifyChannel).string().null())
                    .col(ColumnDef::new(Jobs::NotifyUser).string().null())
                    .col(
                        ColumnDef::new(Jobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Jobs::StartedAt).timestamp_with_time_zone().null())
                    .col(
                        ColumnDef::new(Jobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_jobs_server_id")
                            .from(Jobs::Table, Jobs::ServerId)
                            .to(Servers::Table, Servers::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_status_created_at")
                    .table(Jobs::Table)
                    .col(Jobs::Status)
                    .col(Jobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        // One queued/running job per server. The query builder has no partial
        // index support, so this one is raw SQL.
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS uniq_jobs_active_per_server \
                 ON jobs (server_id) WHERE status IN ('queued', 'running')",
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(JobLogLines::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobLogLines::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(JobLogLines::JobId).uuid().not_null())
                    .col(ColumnDef::new(JobLogLines::Line).text().not_null())
                    .col(
                        ColumnDef::new(JobLogLines::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_job_log_lines_job_id")
                            .from(JobLogLines::Table, JobLogLines::JobId)
                            .to(Jobs::Table, Jobs::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_log_lines_job_id")
                    .table(JobLogLines::Table)
                    .col(JobLogLines::JobId)
                    .col(JobLogLines::Id)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobLogLines::Table).to_owned())
            .await?;

        manager
            .get_connection()
            .execute_unprepared("DROP INDEX IF EXISTS uniq_jobs_active_per_server")
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_jobs_status_created_at")
                    .table(Jobs::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
    ServerId,
    Action,
    Status,
    Error,
    NotifyChannel,
    NotifyUser,
    CreatedAt,
    StartedAt,
    CompletedAt,
}

#[derive(DeriveIden)]
enum JobLogLines {
    Table,
    Id,
    JobId,
    Line,
    CreatedAt,
}
