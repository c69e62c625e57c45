use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only change-data-capture log for the sql backend. Store mutations
/// insert a row here in the same transaction as the write; the polled change
/// feed tails the table by ascending id.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "change_log")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Logical collection name ("products", "inventory", …).
    pub collection: String,
    /// "insert" | "update" | "replace" | "delete"
    pub op: String,
    /// Full document snapshot; absent for deletes.
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub document: Option<Json>,
    pub entity_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
