use crate::blued::RawChat;
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::queue::{ChatJob, IngestJob, LiveRef};
use crate::scheduler::SyncTarget;
use entity::{chat, live};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QuerySelect};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Spam tokens dropped before ingestion. Case-sensitive exact matches.
pub const BLOCKED_WORDS: [&str; 8] = ["f", "ff", "F", "FF", "已婚聊天", "瘦f", "聊天f", "FFF"];

pub fn is_blocked(content: &str) -> bool {
    BLOCKED_WORDS.contains(&content)
}

/// Computes a dedupe key for every message of a fetched batch.
///
/// The key covers session, sender, platform timestamp and content, plus the
/// occurrence index of that exact tuple inside the batch, so a viewer who
/// sends the same text twice within one second yields two keys while a
/// message re-fetched on the next tick keeps its key.
pub fn chat_dedupe_keys(lid: i64, chats: &[RawChat]) -> Vec<String> {
    let mut occurrences: HashMap<(i64, i64, &str), u32> = HashMap::new();

    chats
        .iter()
        .map(|chat| {
            let seen = occurrences
                .entry((chat.sender_id, chat.timestamp, chat.content.as_str()))
                .or_insert(0);
            let name = format!(
                "{}:{}:{}:{}:{}",
                lid, chat.sender_id, chat.timestamp, seen, chat.content
            );
            *seen += 1;
            Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
        })
        .collect()
}

impl SyncEngine {
    /// One chat-sync tick: fetch the backlog, drop what is stored or
    /// blocked, queue the rest. Returns the number of queued messages.
    pub async fn sync_chat(
        &self,
        target: &SyncTarget,
        cancel: &CancellationToken,
    ) -> Result<usize, SyncError> {
        if cancel.is_cancelled() {
            return Ok(0);
        }

        let chats = self.api.fetch_recent_chat(target.lid).await?;
        if chats.is_empty() {
            return Ok(0);
        }

        let session = live::Entity::find()
            .filter(live::Column::Lid.eq(target.lid))
            .one(&self.db)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("live session {}", target.lid)))?;

        let keys = chat_dedupe_keys(target.lid, &chats);
        let stored: HashSet<String> = chat::Entity::find()
            .select_only()
            .column(chat::Column::DedupeKey)
            .filter(chat::Column::LiveId.eq(session.id))
            .filter(chat::Column::DedupeKey.is_in(keys.clone()))
            .into_tuple::<String>()
            .all(&self.db)
            .await?
            .into_iter()
            .collect();

        let live = LiveRef {
            id: session.id,
            lid: session.lid,
            anchor_uid: target.anchor_uid,
            anchor_name: target.anchor_name.clone(),
        };

        let mut queued = 0;
        for (chat, dedupe_key) in chats.into_iter().zip(keys) {
            if stored.contains(&dedupe_key) || is_blocked(&chat.content) {
                continue;
            }
            self.queue
                .enqueue(IngestJob::Chat(ChatJob {
                    chat,
                    live: live.clone(),
                    dedupe_key,
                }))
                .await?;
            queued += 1;
        }

        Ok(queued)
    }
}
