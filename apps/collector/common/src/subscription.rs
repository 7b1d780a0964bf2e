use crate::engine::SyncEngine;
use crate::error::SyncError;
use chrono::Utc;
use entity::{anchor, consume, live, user};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, ModelTrait, QueryFilter, QueryOrder, Set};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorDetail {
    #[serde(flatten)]
    pub anchor: anchor::Model,
    /// Newest first.
    pub lives: Vec<live::Model>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeSummary {
    pub uid: i64,
    pub user: String,
    pub amount: i64,
}

impl SyncEngine {
    /// Subscribes to the anchor with platform id `uid`. An unsubscribed
    /// anchor is re-subscribed with its profile refreshed.
    pub async fn add_anchor_by_uid(&self, uid: i64) -> Result<anchor::Model, SyncError> {
        let info = self
            .api
            .get_anchor_info(uid)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("anchor {}", uid)))?;

        self.subscribe(uid, info.display_name, info.avatar).await
    }

    /// Subscribes to the first anchor the platform search returns for `name`.
    pub async fn add_anchor_by_name(&self, name: &str) -> Result<anchor::Model, SyncError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::Validation("anchor name must not be empty".to_string()));
        }

        let hit = self
            .api
            .search_users(name)
            .await?
            .into_iter()
            .find(|hit| hit.is_anchor)
            .ok_or_else(|| SyncError::NotFound(format!("no anchor named {}", name)))?;

        self.subscribe(hit.id, hit.name, hit.avatar).await
    }

    async fn subscribe(
        &self,
        uid: i64,
        name: String,
        avatar: Option<String>,
    ) -> Result<anchor::Model, SyncError> {
        let now = Utc::now();
        let existing = anchor::Entity::find()
            .filter(anchor::Column::Uid.eq(uid))
            .one(&self.db)
            .await?;

        let model = match existing {
            Some(existing) => {
                let mut model: anchor::ActiveModel = existing.into();
                model.name = Set(name);
                model.avatar = Set(avatar);
                model.deleted = Set(false);
                model.updated_at = Set(now);
                model.update(&self.db).await?
            }
            None => {
                anchor::ActiveModel {
                    uid: Set(uid),
                    name: Set(name),
                    avatar: Set(avatar),
                    is_live: Set(false),
                    deleted: Set(false),
                    total_beans: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                }
                .insert(&self.db)
                .await?
            }
        };

        info!("Subscribed to {} ({})", model.name, model.uid);
        Ok(model)
    }

    /// Marks the anchor unsubscribed and stops its sync tasks. The row and
    /// its history stay.
    pub async fn remove_anchor(&self, uid: i64) -> Result<anchor::Model, SyncError> {
        let existing = self.find_anchor(uid).await?;

        let mut model: anchor::ActiveModel = existing.into();
        model.deleted = Set(true);
        model.updated_at = Set(Utc::now());
        let removed = model.update(&self.db).await?;

        self.stop_sync_tasks(removed.uid, &removed.name).await;
        info!("Unsubscribed from {} ({})", removed.name, removed.uid);
        Ok(removed)
    }

    /// Anchors currently subscribed.
    pub async fn list_anchors(&self) -> Result<Vec<anchor::Model>, SyncError> {
        Ok(anchor::Entity::find()
            .filter(anchor::Column::Deleted.eq(false))
            .order_by_asc(anchor::Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn anchor_detail(&self, uid: i64) -> Result<AnchorDetail, SyncError> {
        let anchor = self.find_anchor(uid).await?;
        let lives = anchor
            .find_related(live::Entity)
            .order_by_desc(live::Column::CreatedAt)
            .order_by_desc(live::Column::Id)
            .all(&self.db)
            .await?;

        Ok(AnchorDetail { anchor, lives })
    }

    /// Per-viewer contributions of session `lid`, highest first.
    pub async fn consume_summary(&self, lid: i64) -> Result<Vec<ConsumeSummary>, SyncError> {
        let session = live::Entity::find()
            .filter(live::Column::Lid.eq(lid))
            .one(&self.db)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("live session {}", lid)))?;

        let rows = consume::Entity::find()
            .filter(consume::Column::LiveId.eq(session.id))
            .find_also_related(user::Entity)
            .order_by_desc(consume::Column::Amount)
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(consume, viewer)| {
                viewer.map(|viewer| ConsumeSummary {
                    uid: viewer.uid,
                    user: viewer.name,
                    amount: consume.amount,
                })
            })
            .collect())
    }

    async fn find_anchor(&self, uid: i64) -> Result<anchor::Model, SyncError> {
        anchor::Entity::find()
            .filter(anchor::Column::Uid.eq(uid))
            .one(&self.db)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("anchor {}", uid)))
    }
}
