use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::entities::stock_transaction::TransactionType;
use crate::entities::{notification, product, stock_transaction};
use crate::errors::ServiceError;

pub mod memory;
pub mod sql;

/// Errors surfaced by a change feed connection or stream.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed connection failed: {0}")]
    Connection(String),

    #[error("stream for collection '{0}' failed: {1}")]
    Stream(String, String),

    #[error("stream lagged; {0} events were dropped")]
    Lagged(u64),

    #[error("feed closed")]
    Closed,
}

/// Raw change-data-capture operation as reported by the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOp {
    Insert,
    Update,
    Replace,
    Delete,
}

/// Unnormalized event read off a collection's change stream. Deletes carry
/// only the entity key; the other operations carry the full document.
#[derive(Debug, Clone)]
pub struct RawChange {
    pub collection: String,
    pub op: RawOp,
    pub document: Option<Value>,
    pub entity_id: Uuid,
}

pub type ChangeStream = BoxStream<'static, Result<RawChange, FeedError>>;

/// A stock mutation applied as one atomic unit: the balance update and the
/// ledger row commit (or fail) together.
#[derive(Debug, Clone)]
pub struct StockChange {
    /// Signed delta; positive for additions, negative for usage/sales.
    pub delta: i32,
    pub tx_type: TransactionType,
    pub reason: Option<String>,
    pub user_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    pub unread_only: bool,
    pub notification_type: Option<crate::entities::NotificationType>,
    pub category: Option<String>,
    pub limit: Option<u64>,
    pub skip: u64,
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn get_product(&self, id: Uuid) -> Result<Option<product::Model>, ServiceError>;

    /// All products with stock tracking enabled.
    async fn list_tracked_products(&self) -> Result<Vec<product::Model>, ServiceError>;

    async fn insert_product(&self, product: product::Model) -> Result<product::Model, ServiceError>;

    /// Applies a stock change atomically: validates the resulting balance is
    /// non-negative, updates `current_quantity`, stamps `last_restocked` on
    /// additions, and appends the ledger row. Returns `None` when the product
    /// does not exist.
    async fn apply_stock_change(
        &self,
        product_id: Uuid,
        change: StockChange,
    ) -> Result<Option<(product::Model, stock_transaction::Model)>, ServiceError>;

    /// Metadata-only threshold update. Returns `None` when the product does
    /// not exist.
    async fn update_min_stock(
        &self,
        product_id: Uuid,
        new_min_stock_level: i32,
    ) -> Result<Option<product::Model>, ServiceError>;

    /// Ledger rows for a product created at or after `since`, oldest first.
    async fn transactions_since(
        &self,
        product_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<stock_transaction::Model>, ServiceError>;

    async fn append_cost_entry(
        &self,
        entry: crate::entities::cost_entry::Model,
    ) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert(
        &self,
        notification: notification::Model,
    ) -> Result<notification::Model, ServiceError>;

    /// Conditional insert enforcing the one-active-low-stock-alert-per-product
    /// invariant: inserts only if no unread, unexpired `low_stock`
    /// notification referencing `product_id` exists. Returns `None` when an
    /// active alert already exists.
    async fn insert_low_stock_if_absent(
        &self,
        product_id: Uuid,
        notification: notification::Model,
    ) -> Result<Option<notification::Model>, ServiceError>;

    async fn get(&self, id: Uuid) -> Result<Option<notification::Model>, ServiceError>;

    /// Filtered, paginated, newest-first read for a recipient. Includes
    /// `"system"` broadcasts and always excludes expired notifications.
    async fn query(
        &self,
        recipient: &str,
        filter: &NotificationFilter,
    ) -> Result<Vec<notification::Model>, ServiceError>;

    /// Returns whether a row was actually modified (idempotent).
    async fn set_read(&self, id: Uuid, read: bool) -> Result<bool, ServiceError>;

    /// Unread-to-read for the exact recipient; returns the modified count.
    async fn mark_all_read(&self, recipient: &str) -> Result<u64, ServiceError>;

    async fn delete(&self, id: Uuid) -> Result<bool, ServiceError>;

    /// Deletes all notifications with `expires_at` before `now`; returns the
    /// deleted count. Rows without an expiry are never touched.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, ServiceError>;

    /// Deletes unread `low_stock` notifications whose payload references the
    /// product. Used when the underlying condition resolves.
    async fn delete_unread_low_stock_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<u64, ServiceError>;

    async fn count_unread(&self, recipient: &str) -> Result<u64, ServiceError>;

    /// Unread, unexpired `low_stock` notifications, optionally scoped to a
    /// recipient.
    async fn active_low_stock(
        &self,
        recipient: Option<&str>,
    ) -> Result<Vec<notification::Model>, ServiceError>;
}

/// Change-data-capture subscription surface of the backing store.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Establishes the underlying client connection. Streams are opened per
    /// collection afterwards via [`watch`](Self::watch).
    async fn connect(&self) -> Result<(), FeedError>;

    /// Opens a live stream of raw changes for one logical collection. FIFO
    /// within the stream; no ordering across collections.
    async fn watch(&self, collection: &str) -> Result<ChangeStream, FeedError>;

    /// Closes the connection and all streams. Idempotent.
    async fn close(&self);
}
