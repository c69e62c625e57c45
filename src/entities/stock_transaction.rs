use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Types of stock ledger entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Addition,
    Usage,
    Adjustment,
    Sale,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Addition => "addition",
            TransactionType::Usage => "usage",
            TransactionType::Adjustment => "adjustment",
            TransactionType::Sale => "sale",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "addition" => Some(TransactionType::Addition),
            "usage" => Some(TransactionType::Usage),
            "adjustment" => Some(TransactionType::Adjustment),
            "sale" => Some(TransactionType::Sale),
            _ => None,
        }
    }

    /// Sign applied to `quantity` when computing the new balance. Adjustments
    /// carry their own sign in the delta and are recorded as-is.
    pub fn sign(&self) -> i32 {
        match self {
            TransactionType::Addition => 1,
            TransactionType::Usage | TransactionType::Sale => -1,
            TransactionType::Adjustment => 1,
        }
    }
}

/// Append-only stock ledger row. Entries are immutable once written;
/// `new_quantity = previous_quantity ± quantity` per the type's sign.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    pub tx_type: String, // stored as string, converted through TransactionType
    pub quantity: i32,   // unsigned magnitude
    pub previous_quantity: i32,
    pub new_quantity: i32,
    pub reason: Option<String>,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

impl Model {
    pub fn tx_type(&self) -> Option<TransactionType> {
        TransactionType::parse(&self.tx_type)
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
