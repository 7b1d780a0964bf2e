//! Writes ingestion jobs to the database.
//!
//! Every write is idempotent: users are created-if-absent, consume rows are
//! upserted on `(live_id, user_id)` and chats are inserted-or-ignored on
//! their dedupe key. A job may be delivered more than once.

use crate::chat_log::ChatLog;
use crate::error::SyncError;
use crate::queue::{ChatJob, ConsumeJob, IngestJob};
use chrono::{DateTime, Utc};
use entity::user::NameHistory;
use entity::{chat, consume, live, user};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use tracing::debug;

/// Conditional rename retries before giving up on a contended user row.
const RENAME_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct IngestWorker {
    db: DatabaseConnection,
    chat_log: Arc<ChatLog>,
}

impl IngestWorker {
    pub fn new(db: DatabaseConnection, chat_log: Arc<ChatLog>) -> Self {
        Self { db, chat_log }
    }

    pub async fn handle(&self, job: &IngestJob) -> Result<(), SyncError> {
        match job {
            IngestJob::Chat(job) => self.store_chat(job).await,
            IngestJob::Consume(job) => self.store_consume(job).await,
        }
    }

    /// Returns the user row for `uid`, creating it on first sight. A changed
    /// display name is applied and the previous one appended to the history.
    pub async fn resolve_user(&self, uid: i64, name: &str) -> Result<user::Model, SyncError> {
        let now = Utc::now();
        let fresh = user::ActiveModel {
            uid: Set(uid),
            name: Set(name.to_string()),
            history_name: Set(NameHistory::default()),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        user::Entity::insert(fresh)
            .on_conflict(OnConflict::column(user::Column::Uid).do_nothing().to_owned())
            .exec_without_returning(&self.db)
            .await?;

        for _ in 0..RENAME_ATTEMPTS {
            let existing = user::Entity::find()
                .filter(user::Column::Uid.eq(uid))
                .one(&self.db)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("user {}", uid)))?;

            if existing.name == name {
                return Ok(existing);
            }

            let history = existing.history_name.with_appended(&existing.name);

            // Only applies if nobody renamed the row since we read it.
            let result = user::Entity::update_many()
                .col_expr(user::Column::Name, Expr::value(name))
                .col_expr(
                    user::Column::HistoryName,
                    Expr::value(serde_json::to_value(&history)?),
                )
                .col_expr(user::Column::UpdatedAt, Expr::value(now))
                .filter(user::Column::Id.eq(existing.id))
                .filter(user::Column::Name.eq(existing.name.as_str()))
                .exec(&self.db)
                .await?;

            if result.rows_affected > 0 {
                debug!("User {} renamed {} -> {}", uid, existing.name, name);
                return Ok(user::Model {
                    name: name.to_string(),
                    history_name: history,
                    updated_at: now,
                    ..existing
                });
            }
        }

        Err(SyncError::Database(DbErr::RecordNotUpdated))
    }

    async fn store_consume(&self, job: &ConsumeJob) -> Result<(), SyncError> {
        let session = live::Entity::find()
            .filter(live::Column::Lid.eq(job.lid))
            .one(&self.db)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("live session {}", job.lid)))?;

        let viewer = self
            .resolve_user(job.consume.user_id, &job.consume.user_name)
            .await?;

        let now = Utc::now();
        let row = consume::ActiveModel {
            live_id: Set(session.id),
            user_id: Set(viewer.id),
            amount: Set(job.consume.amount),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        consume::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([consume::Column::LiveId, consume::Column::UserId])
                    .update_columns([consume::Column::Amount, consume::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        Ok(())
    }

    async fn store_chat(&self, job: &ChatJob) -> Result<(), SyncError> {
        let sender = self
            .resolve_user(job.chat.sender_id, &job.chat.sender_name)
            .await?;

        let sent_at = DateTime::<Utc>::from_timestamp(job.chat.timestamp, 0).unwrap_or_else(Utc::now);
        let row = chat::ActiveModel {
            dedupe_key: Set(job.dedupe_key.clone()),
            message: Set(job.chat.content.clone()),
            rich_level: Set(job.chat.rich_level),
            live_id: Set(job.live.id),
            user_id: Set(sender.id),
            created_at: Set(sent_at),
            ..Default::default()
        };

        let inserted = chat::Entity::insert(row)
            .on_conflict(OnConflict::column(chat::Column::DedupeKey).do_nothing().to_owned())
            .exec_without_returning(&self.db)
            .await?;

        if inserted > 0 {
            self.chat_log.record(
                job.live.anchor_uid,
                &job.live.anchor_name,
                job.chat.rich_level,
                &job.chat.sender_name,
                &job.chat.content,
            );
        } else {
            debug!("Skipping duplicate chat {}", job.dedupe_key);
        }

        Ok(())
    }
}
