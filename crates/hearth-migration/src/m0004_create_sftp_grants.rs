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
                    .table(SftpGrants::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SftpGrants::ServerId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SftpGrants::Username).string().not_null())
                    .col(ColumnDef::new(SftpGrants::Port).integer().not_null())
                    .col(
                        ColumnDef::new(SftpGrants::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sftp_grants_server_id")
                            .from(SftpGrants::Table, SftpGrants::ServerId)
                            .to(Servers::Table, Servers::Id),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SftpGrants::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SftpGrants {
    Table,
    ServerId,
    Username,
    Port,
    CreatedAt,
}
