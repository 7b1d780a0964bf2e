use sea_orm_migration::prelude::*;

use crate::m20241101_000002_create_lives_table::Lives;
use crate::m20241101_000003_create_users_table::Users;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Consumes::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Consumes::Id).integer().not_null().auto_increment().primary_key())
                    .col(ColumnDef::new(Consumes::LiveId).integer().not_null())
                    .col(ColumnDef::new(Consumes::UserId).integer().not_null())
                    .col(ColumnDef::new(Consumes::Amount).big_integer().not_null().default(0))
                    .col(ColumnDef::new(Consumes::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Consumes::UpdatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-consumes-live_id")
                            .from(Consumes::Table, Consumes::LiveId)
                            .to(Lives::Table, Lives::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-consumes-user_id")
                            .from(Consumes::Table, Consumes::UserId)
                            .to(Users::Table, Users::Id),
                    )
                    .to_owned(),
            )
            .await?;

        // Upsert target for (live, user).
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx-consumes-live_id-user_id")
                    .table(Consumes::Table)
                    .col(Consumes::LiveId)
                    .col(Consumes::UserId)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Consumes::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Consumes {
    Table,
    Id,
    LiveId,
    UserId,
    Amount,
    CreatedAt,
    UpdatedAt,
}
