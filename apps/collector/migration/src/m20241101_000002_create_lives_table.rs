use sea_orm_migration::prelude::*;

use crate::m20241101_000001_create_anchors_table::Anchors;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Lives::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Lives::Id).integer().not_null().auto_increment().primary_key())
                    .col(ColumnDef::new(Lives::Lid).big_integer().not_null().unique_key())
                    .col(ColumnDef::new(Lives::Link).string().not_null())
                    .col(ColumnDef::new(Lives::Beans).big_integer().not_null().default(0))
                    .col(ColumnDef::new(Lives::AnchorId).integer().not_null())
                    .col(ColumnDef::new(Lives::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Lives::UpdatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-lives-anchor_id")
                            .from(Lives::Table, Lives::AnchorId)
                            .to(Anchors::Table, Anchors::Id),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Lives::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum Lives {
    Table,
    Id,
    Lid,
    Link,
    Beans,
    AnchorId,
    CreatedAt,
    UpdatedAt,
}
