use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A tracked broadcaster. Never hard-deleted; `deleted` marks an unsubscribe.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "anchors")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub uid: i64,
    pub name: String,
    pub avatar: Option<String>,
    pub is_live: bool,
    pub deleted: bool,
    pub total_beans: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::live::Entity")]
    Live,
}

impl Related<super::live::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Live.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
