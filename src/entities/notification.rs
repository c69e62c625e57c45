use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Recipient value that marks a notification as visible to every user.
pub const SYSTEM_RECIPIENT: &str = "system";

/// Closed set of notification types the engine produces or relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    LowStock,
    System,
    InventoryUpdated,
    ProductCreated,
    ProductUpdated,
    ProductDeleted,
    CostCreated,
    CostUpdated,
    CostDeleted,
    UserCreated,
    UserUpdated,
    UserDeleted,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::LowStock => "low_stock",
            NotificationType::System => "system",
            NotificationType::InventoryUpdated => "inventory_updated",
            NotificationType::ProductCreated => "product_created",
            NotificationType::ProductUpdated => "product_updated",
            NotificationType::ProductDeleted => "product_deleted",
            NotificationType::CostCreated => "cost_created",
            NotificationType::CostUpdated => "cost_updated",
            NotificationType::CostDeleted => "cost_deleted",
            NotificationType::UserCreated => "user_created",
            NotificationType::UserUpdated => "user_updated",
            NotificationType::UserDeleted => "user_deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low_stock" => Some(NotificationType::LowStock),
            "system" => Some(NotificationType::System),
            "inventory_updated" => Some(NotificationType::InventoryUpdated),
            "product_created" => Some(NotificationType::ProductCreated),
            "product_updated" => Some(NotificationType::ProductUpdated),
            "product_deleted" => Some(NotificationType::ProductDeleted),
            "cost_created" => Some(NotificationType::CostCreated),
            "cost_updated" => Some(NotificationType::CostUpdated),
            "cost_deleted" => Some(NotificationType::CostDeleted),
            "user_created" => Some(NotificationType::UserCreated),
            "user_updated" => Some(NotificationType::UserUpdated),
            "user_deleted" => Some(NotificationType::UserDeleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "notifications")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    /// Opaque payload, e.g. `{"product_id": …, "urgency": …}`.
    #[sea_orm(column_type = "JsonBinary")]
    pub data: Json,
    /// User id the notification targets; `"system"` broadcasts to everyone.
    pub recipient: String,
    pub read: bool,
    pub priority: String,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Model {
    pub fn notification_type(&self) -> Option<NotificationType> {
        NotificationType::parse(&self.notification_type)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at < now)
    }

    /// Visible while unread and not expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.read && !self.is_expired(now)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, _insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        if let ActiveValue::NotSet = active_model.created_at {
            active_model.created_at = Set(Utc::now());
        }
        Ok(active_model)
    }
}
