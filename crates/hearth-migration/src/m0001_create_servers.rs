use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Servers::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Servers::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Servers::GameId).string().not_null())
                    .col(ColumnDef::new(Servers::Name).string().not_null())
                    .col(ColumnDef::new(Servers::Status).string().not_null())
                    .col(ColumnDef::new(Servers::Config).json_binary().not_null())
                    .col(ColumnDef::new(Servers::Ports).json_binary().not_null())
                    .col(ColumnDef::new(Servers::InternalAddress).string().null())
                    .col(ColumnDef::new(Servers::InstanceId).big_integer().null())
                    .col(ColumnDef::new(Servers::InstanceNode).string().null())
                    .col(ColumnDef::new(Servers::OwnerId).string().not_null())
                    .col(ColumnDef::new(Servers::GroupId).string().null())
                    .col(ColumnDef::new(Servers::Mods).json_binary().null())
                    .col(
                        ColumnDef::new(Servers::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Servers::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Servers::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_servers_status")
                    .table(Servers::Table)
                    .col(Servers::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_servers_owner_id")
                    .table(Servers::Table)
                    .col(Servers::OwnerId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_servers_owner_id")
                    .table(Servers::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_servers_status")
                    .table(Servers::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Servers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum Servers {
    Table,
    Id,
    GameId,
    Name,
    Status,
    Config,
    Ports,
    InternalAddress,
    InstanceId,
    InstanceNode,
    OwnerId,
    GroupId,
    Mods,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}
