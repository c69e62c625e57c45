use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stock classification of a product. Sellable items are restocked more
/// aggressively than raw ingredients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProductType {
    RawStock,
    Sellable,
    Combination,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::RawStock => "raw-stock",
            ProductType::Sellable => "sellable",
            ProductType::Combination => "combination",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw-stock" | "ingredient" => Some(ProductType::RawStock),
            "sellable" => Some(ProductType::Sellable),
            "combination" => Some(ProductType::Combination),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    pub current_quantity: i32,
    pub min_stock_level: i32,
    /// Unit label shown alongside quantities ("kg", "pcs", "l").
    pub metric: String,
    pub product_type: String, // stored as string, converted through ProductType
    pub cost_price: Option<Decimal>,
    pub selling_price: Option<Decimal>,
    pub group_id: Option<Uuid>,
    pub stock_tracking_enabled: bool,
    pub last_restocked: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn product_type(&self) -> Option<ProductType> {
        ProductType::parse(&self.product_type)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        if insert {
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(Utc::now());
            }
        }
        active_model.updated_at = Set(Utc::now());
        Ok(active_model)
    }
}
