use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PortAllocations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PortAllocations::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(PortAllocations::Pool).string().not_null())
                    .col(ColumnDef::new(PortAllocations::Port).integer().not_null())
                    .col(ColumnDef::new(PortAllocations::ServerId).uuid().not_null())
                    .col(ColumnDef::new(PortAllocations::Purpose).string().not_null())
                    .col(
                        ColumnDef::new(PortAllocations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uniq_port_allocations_pool_port")
                    .table(PortAllocations::Table)
                    .col(PortAllocations::Pool)
                    .col(PortAllocations::Port)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_port_allocations_server_id")
                    .table(PortAllocations::Table)
                    .col(PortAllocations::ServerId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_port_allocations_server_id")
                    .table(PortAllocations::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("uniq_port_allocations_pool_port")
                    .table(PortAllocations::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(PortAllocations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PortAllocations {
    Table,
    Id,
    Pool,
    Port,
    ServerId,
    Purpose,
    CreatedAt,
}
