use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One broadcast session. `created_at` is back-dated to the session start.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "lives")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub lid: i64,
    pub link: String,
    pub beans: i64,
    pub anchor_id: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::anchor::Entity",
        from = "Column::AnchorId",
        to = "super::anchor::Column::Id"
    )]
    Anchor,
    #[sea_orm(has_many = "super::chat::Entity")]
    Chat,
    #[sea_orm(has_many = "super::consume::Entity")]
    Consume,
}

impl Related<super::anchor::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Anchor.def()
    }
}

impl Related<super::chat::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Chat.def()
    }
}

impl Related<super::consume::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Consume.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
