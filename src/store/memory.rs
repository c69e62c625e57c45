use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::entities::stock_transaction::TransactionType;
use crate::entities::{cost_entry, notification, product, stock_transaction, NotificationType};
use crate::errors::ServiceError;
use crate::store::{
    ChangeFeed, ChangeStream, FeedError, NotificationFilter, NotificationStore, ProductStore,
    RawChange, RawOp, StockChange,
};

const CHANNEL_CAPACITY: usize = 256;
const DEFAULT_QUERY_LIMIT: u64 = 50;

/// In-memory backing store with a broadcast-channel change feed. Used as the
/// development backend and as the store double in tests; mutations publish
/// the same raw changes a real change-data-capture stream would carry.
#[derive(Default)]
pub struct MemoryBackend {
    products: RwLock<HashMap<Uuid, product::Model>>,
    transactions: RwLock<Vec<stock_transaction::Model>>,
    notifications: RwLock<HashMap<Uuid, notification::Model>>,
    cost_entries: RwLock<Vec<cost_entry::Model>>,
    channels: DashMap<String, broadcast::Sender<RawChange>>,
    connected: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, collection: &str, op: RawOp, document: Option<serde_json::Value>, id: Uuid) {
        let sender = self
            .channels
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        // send only fails when nobody is listening
        let _ = sender.send(RawChange {
            collection: collection.to_string(),
            op,
            document,
            entity_id: id,
        });
    }

    fn doc<T: serde::Serialize>(value: &T) -> Option<serde_json::Value> {
        serde_json::to_value(value).ok()
    }
}

/// True when the notification's payload references the product.
fn references_product(n: &notification::Model, product_id: Uuid) -> bool {
    n.data
        .get("product_id")
        .and_then(|v| v.as_str())
        .map(|s| s == product_id.to_string())
        .unwrap_or(false)
}

fn is_active_low_stock(n: &notification::Model, now: DateTime<Utc>) -> bool {
    n.notification_type() == Some(NotificationType::LowStock) && n.is_active(now)
}

#[async_trait]
impl ProductStore for MemoryBackend {
    async fn get_product(&self, id: Uuid) -> Result<Option<product::Model>, ServiceError> {
        Ok(self.products.read().await.get(&id).cloned())
    }

    async fn list_tracked_products(&self) -> Result<Vec<product::Model>, ServiceError> {
        let mut items: Vec<_> = self
            .products
            .read()
            .await
            .values()
            .filter(|p| p.stock_tracking_enabled)
            .cloned()
            .collect();
        items.sort_by_key(|p| p.current_quantity);
        Ok(items)
    }

    async fn insert_product(
        &self,
        product: product::Model,
    ) -> Result<product::Model, ServiceError> {
        self.products
            .write()
            .await
            .insert(product.id, product.clone());
        self.publish("products", RawOp::Insert, Self::doc(&product), product.id);
        Ok(product)
    }

    async fn apply_stock_change(
        &self,
        product_id: Uuid,
        change: StockChange,
    ) -> Result<Option<(product::Model, stock_transaction::Model)>, ServiceError> {
        let mut products = self.products.write().await;
        let Some(product) = products.get_mut(&product_id) else {
            return Ok(None);
        };

        let previous = product.current_quantity;
        let new_quantity = previous + change.delta;
        if new_quantity < 0 {
            return Err(ServiceError::InvalidOperation(format!(
                "stock change of {} would take product {} below zero (current {})",
                change.delta, product_id, previous
            )));
        }

        let now = Utc::now();
        product.current_quantity = new_quantity;
        product.updated_at = now;
        if change.tx_type == TransactionType::Addition {
            product.last_restocked = Some(now);
        }

        let tx = stock_transaction::Model {
            id: Uuid::new_v4(),
            product_id,
            tx_type: change.tx_type.as_str().to_string(),
            quantity: change.delta.unsigned_abs() as i32,
            previous_quantity: previous,
            new_quantity,
            reason: change.reason,
            user_id: change.user_id,
            created_at: now,
        };
        let product = product.clone();
        // balance and ledger mutate under the same write lock
        self.transactions.write().await.push(tx.clone());
        drop(products);

        self.publish("products", RawOp::Update, Self::doc(&product), product_id);
        self.publish("inventory", RawOp::Insert, Self::doc(&tx), tx.id);
        if change.tx_type == TransactionType::Sale {
            self.publish("sale-transactions", RawOp::Insert, Self::doc(&tx), tx.id);
        }
        Ok(Some((product, tx)))
    }

    async fn update_min_stock(
        &self,
        product_id: Uuid,
        new_min_stock_level: i32,
    ) -> Result<Option<product::Model>, ServiceError> {
        let mut products = self.products.write().await;
        let Some(product) = products.get_mut(&product_id) else {
            return Ok(None);
        };
        product.min_stock_level = new_min_stock_level;
        product.updated_at = Utc::now();
        let product = product.clone();
        drop(products);

        self.publish("products", RawOp::Update, Self::doc(&product), product_id);
        Ok(Some(product))
    }

    async fn transactions_since(
        &self,
        product_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<stock_transaction::Model>, ServiceError> {
        Ok(self
            .transactions
            .read()
            .await
            .iter()
            .filter(|t| t.product_id == product_id && t.created_at >= since)
            .cloned()
            .collect())
    }

    async fn append_cost_entry(&self, entry: cost_entry::Model) -> Result<(), ServiceError> {
        let id = entry.id;
        let doc = Self::doc(&entry);
        self.cost_entries.write().await.push(entry);
        self.publish("cost-operations", RawOp::Insert, doc, id);
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for MemoryBackend {
    async fn insert(
        &self,
        notification: notification::Model,
    ) -> Result<notification::Model, ServiceError> {
        self.notifications
            .write()
            .await
            .insert(notification.id, notification.clone());
        self.publish(
            "notifications",
            RawOp::Insert,
            Self::doc(&notification),
            notification.id,
        );
        Ok(notification)
    }

    async fn insert_low_stock_if_absent(
        &self,
        product_id: Uuid,
        notification: notification::Model,
    ) -> Result<Option<notification::Model>, ServiceError> {
        let now = Utc::now();
        let mut notifications = self.notifications.write().await;
        let exists = notifications
            .values()
            .any(|n| is_active_low_stock(n, now) && references_product(n, product_id));
        if exists {
            return Ok(None);
        }
        notifications.insert(notification.id, notification.clone());
        drop(notifications);

        self.publish(
            "notifications",
            RawOp::Insert,
            Self::doc(&notification),
            notification.id,
        );
        Ok(Some(notification))
    }

    async fn get(&self, id: Uuid) -> Result<Option<notification::Model>, ServiceError> {
        Ok(self.notifications.read().await.get(&id).cloned())
    }

    async fn query(
        &self,
        recipient: &str,
        filter: &NotificationFilter,
    ) -> Result<Vec<notification::Model>, ServiceError> {
        let now = Utc::now();
        let notifications = self.notifications.read().await;
        let mut matched: Vec<_> = notifications
            .values()
            .filter(|n| {
                (n.recipient == recipient || n.recipient == notification::SYSTEM_RECIPIENT)
                    && !n.is_expired(now)
                    && (!filter.unread_only || !n.read)
                    && filter
                        .notification_type
                        .map_or(true, |t| n.notification_type == t.as_str())
                    && filter
                        .category
                        .as_deref()
                        .map_or(true, |c| n.category == c)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let limit = filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT) as usize;
        Ok(matched
            .into_iter()
            .skip(filter.skip as usize)
            .take(limit)
            .collect())
    }

    async fn set_read(&self, id: Uuid, read: bool) -> Result<bool, ServiceError> {
        let mut notifications = self.notifications.write().await;
        let Some(n) = notifications.get_mut(&id) else {
            return Ok(false);
        };
        if n.read == read {
            return Ok(false);
        }
        n.read = read;
        let doc = Self::doc(n);
        drop(notifications);
        self.publish("notifications", RawOp::Update, doc, id);
        Ok(true)
    }

    async fn mark_all_read(&self, recipient: &str) -> Result<u64, ServiceError> {
        let mut notifications = self.notifications.write().await;
        let mut modified = 0;
        for n in notifications.values_mut() {
            if n.recipient == recipient && !n.read {
                n.read = true;
                modified += 1;
            }
        }
        Ok(modified)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, ServiceError> {
        let removed = self.notifications.write().await.remove(&id).is_some();
        if removed {
            self.publish("notifications", RawOp::Delete, None, id);
        }
        Ok(removed)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let mut notifications = self.notifications.write().await;
        let expired: Vec<Uuid> = notifications
            .values()
            .filter(|n| n.is_expired(now))
            .map(|n| n.id)
            .collect();
        for id in &expired {
            notifications.remove(id);
        }
        drop(notifications);

        for id in &expired {
            self.publish("notifications", RawOp::Delete, None, *id);
        }
        Ok(expired.len() as u64)
    }

    async fn delete_unread_low_stock_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<u64, ServiceError> {
        let mut notifications = self.notifications.write().await;
        let targets: Vec<Uuid> = notifications
            .values()
            .filter(|n| {
                n.notification_type() == Some(NotificationType::LowStock)
                    && !n.read
                    && references_product(n, product_id)
            })
            .map(|n| n.id)
            .collect();
        for id in &targets {
            notifications.remove(id);
        }
        drop(notifications);

        for id in &targets {
            self.publish("notifications", RawOp::Delete, None, *id);
        }
        Ok(targets.len() as u64)
    }

    async fn count_unread(&self, recipient: &str) -> Result<u64, ServiceError> {
        let now = Utc::now();
        Ok(self
            .notifications
            .read()
            .await
            .values()
            .filter(|n| {
                (n.recipient == recipient || n.recipient == notification::SYSTEM_RECIPIENT)
                    && n.is_active(now)
            })
            .count() as u64)
    }

    async fn active_low_stock(
        &self,
        recipient: Option<&str>,
    ) -> Result<Vec<notification::Model>, ServiceError> {
        let now = Utc::now();
        Ok(self
            .notifications
            .read()
            .await
            .values()
            .filter(|n| {
                is_active_low_stock(n, now)
                    && recipient.map_or(true, |r| {
                        n.recipient == r || n.recipient == notification::SYSTEM_RECIPIENT
                    })
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn connect(&self) -> Result<(), FeedError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn watch(&self, collection: &str) -> Result<ChangeStream, FeedError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(FeedError::Connection("feed is not connected".to_string()));
        }
        let receiver = self
            .channels
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        debug!(collection, "opened in-memory change stream");

        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            match rx.recv().await {
                Ok(change) => Some((Ok(change), rx)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    Some((Err(FeedError::Lagged(n)), rx))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // dropping the senders ends every open stream
        self.channels.clear();
    }
}
