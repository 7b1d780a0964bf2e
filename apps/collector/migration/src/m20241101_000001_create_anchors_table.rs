use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Anchors::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Anchors::Id).integer().not_null().auto_increment().primary_key())
                    .col(ColumnDef::new(Anchors::Uid).big_integer().not_null().unique_key())
                    .col(ColumnDef::new(Anchors::Name).string().not_null())
                    .col(ColumnDef::new(Anchors::Avatar).string())
                    .col(ColumnDef::new(Anchors::IsLive).boolean().not_null().default(false))
                    .col(ColumnDef::new(Anchors::Deleted).boolean().not_null().default(false))
                    .col(ColumnDef::new(Anchors::TotalBeans).big_integer())
                    .col(ColumnDef::new(Anchors::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Anchors::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx-anchors-name")
                    .table(Anchors::Table)
                    .col(Anchors::Name)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Anchors::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum Anchors {
    Table,
    Id,
    Uid,
    Name,
    Avatar,
    IsLive,
    Deleted,
    TotalBeans,
    CreatedAt,
    UpdatedAt,
}
