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
                    .table(Chats::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Chats::Id).integer().not_null().auto_increment().primary_key())
                    .col(ColumnDef::new(Chats::DedupeKey).string().not_null().unique_key())
                    .col(ColumnDef::new(Chats::Message).text().not_null())
                    .col(ColumnDef::new(Chats::RichLevel).integer().not_null().default(0))
                    .col(ColumnDef::new(Chats::LiveId).integer().not_null())
                    .col(ColumnDef::new(Chats::UserId).integer().not_null())
                    .col(ColumnDef::new(Chats::CreatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-chats-live_id")
                            .from(Chats::Table, Chats::LiveId)
                            .to(Lives::Table, Lives::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-chats-user_id")
                            .from(Chats::Table, Chats::UserId)
                            .to(Users::Table, Users::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx-chats-live_id")
                    .table(Chats::Table)
                    .col(Chats::LiveId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Chats::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Chats {
    Table,
    Id,
    DedupeKey,
    Message,
    RichLevel,
    LiveId,
    UserId,
    CreatedAt,
}
