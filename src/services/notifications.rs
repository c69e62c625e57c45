use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::entities::notification::{self, SYSTEM_RECIPIENT};
use crate::entities::{NotificationType, Priority};
use crate::errors::ServiceError;
use crate::events::{ChangeEvent, ChangeOp, EntityKind, EventBroadcaster, Listener, SubscriptionId};
use crate::services::low_stock::Urgency;
use crate::store::{NotificationFilter, NotificationStore};

/// Low-stock alerts stay visible for a week unless resolved earlier.
const LOW_STOCK_TTL_DAYS: i64 = 7;

/// Caller-supplied fields for a new notification; anything left unset is
/// filled from the type's template.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct NewNotification {
    #[serde(rename = "type")]
    pub notification_type: Option<NotificationType>,
    pub title: Option<String>,
    pub message: Option<String>,
    pub data: Option<serde_json::Value>,
    pub recipient: Option<String>,
    pub priority: Option<Priority>,
    pub category: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

struct Template {
    title: &'static str,
    message: &'static str,
    priority: Priority,
    category: &'static str,
}

fn template(nt: NotificationType) -> Template {
    use NotificationType::*;
    match nt {
        LowStock => Template {
            title: "Low Stock Alert",
            message: "A product is running low on stock",
            priority: Priority::High,
            category: "inventory",
        },
        System => Template {
            title: "System Notification",
            message: "System update",
            priority: Priority::Medium,
            category: "system",
        },
        InventoryUpdated => Template {
            title: "Inventory Updated",
            message: "Inventory levels have changed",
            priority: Priority::Low,
            category: "inventory",
        },
        ProductCreated => Template {
            title: "Product Created",
            message: "A new product was added",
            priority: Priority::Low,
            category: "products",
        },
        ProductUpdated => Template {
            title: "Product Updated",
            message: "A product was updated",
            priority: Priority::Low,
            category: "products",
        },
        ProductDeleted => Template {
            title: "Product Deleted",
            message: "A product was removed",
            priority: Priority::Medium,
            category: "products",
        },
        CostCreated => Template {
            title: "Cost Recorded",
            message: "A new cost record was added",
            priority: Priority::Low,
            category: "costs",
        },
        CostUpdated => Template {
            title: "Cost Updated",
            message: "A cost record was updated",
            priority: Priority::Low,
            category: "costs",
        },
        CostDeleted => Template {
            title: "Cost Deleted",
            message: "A cost record was removed",
            priority: Priority::Medium,
            category: "costs",
        },
        UserCreated => Template {
            title: "User Created",
            message: "A new user account was created",
            priority: Priority::Low,
            category: "users",
        },
        UserUpdated => Template {
            title: "User Updated",
            message: "A user account was updated",
            priority: Priority::Low,
            category: "users",
        },
        UserDeleted => Template {
            title: "User Deleted",
            message: "A user account was removed",
            priority: Priority::Medium,
            category: "users",
        },
    }
}

/// Creates, dedups, reads, expires and deletes notification records, and
/// re-broadcasts every create through the event hub.
pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    broadcaster: Arc<EventBroadcaster>,
}

impl NotificationService {
    pub fn new(store: Arc<dyn NotificationStore>, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self { store, broadcaster }
    }

    /// Merges the caller's fields with the type template, persists and fans
    /// out. Storage failures are logged and swallowed — a failed notification
    /// must never abort the business operation that triggered it.
    #[instrument(skip(self, data))]
    pub async fn create_notification(&self, data: NewNotification) -> Option<notification::Model> {
        let nt = data.notification_type.unwrap_or(NotificationType::System);
        let tpl = template(nt);
        let model = notification::Model {
            id: Uuid::new_v4(),
            notification_type: nt.as_str().to_string(),
            title: data.title.unwrap_or_else(|| tpl.title.to_string()),
            message: data.message.unwrap_or_else(|| tpl.message.to_string()),
            data: data.data.unwrap_or(serde_json::Value::Null),
            recipient: data.recipient.unwrap_or_else(|| SYSTEM_RECIPIENT.to_string()),
            read: false,
            priority: data.priority.unwrap_or(tpl.priority).as_str().to_string(),
            category: data.category.unwrap_or_else(|| tpl.category.to_string()),
            created_at: Utc::now(),
            expires_at: data.expires_at,
        };

        match self.store.insert(model).await {
            Ok(created) => {
                self.fan_out(&created);
                Some(created)
            }
            Err(e) => {
                error!(error = %e, notification_type = nt.as_str(), "failed to create notification");
                None
            }
        }
    }

    /// Filtered, paginated, newest-first; expired rows are never returned.
    pub async fn get_notifications(
        &self,
        user_id: &str,
        filter: &NotificationFilter,
    ) -> Result<Vec<notification::Model>, ServiceError> {
        self.store.query(user_id, filter).await
    }

    pub async fn mark_as_read(&self, id: Uuid) -> Result<bool, ServiceError> {
        self.store.set_read(id, true).await
    }

    pub async fn mark_as_unread(&self, id: Uuid) -> Result<bool, ServiceError> {
        self.store.set_read(id, false).await
    }

    /// Unread-to-read for the recipient's own rows. Returns the modified count.
    pub async fn mark_all_as_read(&self, user_id: &str) -> Result<u64, ServiceError> {
        self.store.mark_all_read(user_id).await
    }

    pub async fn delete_notification(&self, id: Uuid) -> Result<bool, ServiceError> {
        self.store.delete(id).await
    }

    #[instrument(skip(self))]
    pub async fn cleanup_expired_notifications(&self) -> Result<u64, ServiceError> {
        let removed = self.store.delete_expired(Utc::now()).await?;
        if removed > 0 {
            info!(removed, "expired notifications cleaned up");
        }
        Ok(removed)
    }

    /// Hourly expiry sweep for the lifetime of the process.
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        interval: std::time::Duration,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if let Err(e) = service.cleanup_expired_notifications().await {
                    warn!(error = %e, "notification cleanup cycle failed");
                }
            }
        })
    }

    pub async fn get_unread_count(&self, user_id: &str) -> Result<u64, ServiceError> {
        self.store.count_unread(user_id).await
    }

    /// Sole producer of `low_stock` notifications. Dedup is enforced by an
    /// atomic conditional insert keyed on the product; returns `Ok(None)`
    /// when an active alert already exists.
    #[instrument(skip(self, name, metric))]
    pub async fn create_low_stock_notification(
        &self,
        product_id: Uuid,
        name: &str,
        current_quantity: i32,
        min_stock_level: i32,
        metric: &str,
        urgency: Urgency,
    ) -> Result<Option<notification::Model>, ServiceError> {
        let (title, message, priority) = match urgency {
            Urgency::Critical if current_quantity == 0 => (
                "Out of Stock".to_string(),
                format!("{name} is out of stock. Immediate restock required."),
                Priority::High,
            ),
            Urgency::Critical => (
                "Critical Stock Level".to_string(),
                format!(
                    "{name} is critically low: {current_quantity} {metric} left (minimum {min_stock_level})."
                ),
                Priority::High,
            ),
            Urgency::Warning => (
                "Low Stock Warning".to_string(),
                format!(
                    "{name} is running low: {current_quantity} {metric} left (minimum {min_stock_level})."
                ),
                Priority::Medium,
            ),
            Urgency::Low => (
                "Stock Notice".to_string(),
                format!(
                    "{name} is below its minimum level: {current_quantity} {metric} left (minimum {min_stock_level})."
                ),
                Priority::Low,
            ),
        };

        let model = notification::Model {
            id: Uuid::new_v4(),
            notification_type: NotificationType::LowStock.as_str().to_string(),
            title,
            message,
            data: json!({
                "product_id": product_id,
                "current_quantity": current_quantity,
                "min_stock_level": min_stock_level,
                "metric": metric,
                "urgency": urgency.as_str(),
            }),
            recipient: SYSTEM_RECIPIENT.to_string(),
            read: false,
            priority: priority.as_str().to_string(),
            category: "inventory".to_string(),
            created_at: Utc::now(),
            expires_at: Some(Utc::now() + ChronoDuration::days(LOW_STOCK_TTL_DAYS)),
        };

        let created = self
            .store
            .insert_low_stock_if_absent(product_id, model)
            .await?;
        if let Some(ref n) = created {
            info!(%product_id, urgency = urgency.as_str(), "low-stock notification created");
            self.fan_out(n);
        }
        Ok(created)
    }

    /// Removes unread low-stock alerts for a product once the underlying
    /// condition resolves; keeps the one-active-alert invariant.
    #[instrument(skip(self))]
    pub async fn cleanup_resolved_low_stock_notifications(
        &self,
        product_id: Uuid,
    ) -> Result<u64, ServiceError> {
        let removed = self
            .store
            .delete_unread_low_stock_for_product(product_id)
            .await?;
        if removed > 0 {
            info!(%product_id, removed, "resolved low-stock notifications cleaned up");
        }
        Ok(removed)
    }

    /// Read path the monitor uses to see which products already alert.
    pub async fn get_active_low_stock_notifications(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<notification::Model>, ServiceError> {
        self.store.active_low_stock(user_id).await
    }

    pub fn subscribe(&self, user_id: &str, listener: Listener) -> SubscriptionId {
        self.broadcaster.subscribe(user_id, listener)
    }

    pub fn unsubscribe(&self, user_id: &str, id: SubscriptionId) -> bool {
        self.broadcaster.unsubscribe(user_id, id)
    }

    /// Delivers the created record to the recipient's subscribers and to the
    /// system scope.
    fn fan_out(&self, created: &notification::Model) {
        let event = ChangeEvent::new(
            EntityKind::Notification,
            ChangeOp::Create,
            serde_json::to_value(created).unwrap_or(serde_json::Value::Null),
        );
        self.broadcaster.notify_scope(&created.recipient, &event);
        if created.recipient != SYSTEM_RECIPIENT {
            self.broadcaster.notify_scope(SYSTEM_RECIPIENT, &event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_cover_every_type() {
        for nt in [
            NotificationType::LowStock,
            NotificationType::System,
            NotificationType::InventoryUpdated,
            NotificationType::ProductCreated,
            NotificationType::ProductUpdated,
            NotificationType::ProductDeleted,
            NotificationType::CostCreated,
            NotificationType::CostUpdated,
            NotificationType::CostDeleted,
            NotificationType::UserCreated,
            NotificationType::UserUpdated,
            NotificationType::UserDeleted,
        ] {
            let tpl = template(nt);
            assert!(!tpl.title.is_empty());
            assert!(!tpl.category.is_empty());
        }
    }

    #[test]
    fn low_stock_template_is_high_priority_inventory() {
        let tpl = template(NotificationType::LowStock);
        assert_eq!(tpl.priority, Priority::High);
        assert_eq!(tpl.category, "inventory");
    }

    #[tokio::test]
    async fn cleanup_task_handle_is_abortable() {
        let service = Arc::new(NotificationService::new(
            Arc::new(crate::store::memory::MemoryBackend::new()),
            Arc::new(EventBroadcaster::new()),
        ));
        let handle = service.spawn_cleanup_task(std::time::Duration::from_secs(3600));
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
