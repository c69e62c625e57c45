use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::entities::cost_entry::{self, CostEntryType};
use crate::entities::product::{self, ProductType};
use crate::entities::stock_transaction::TransactionType;
use crate::entities::NotificationType;
use crate::errors::ServiceError;
use crate::events::{ChangeEvent, ChangeOp, EntityKind, EventBroadcaster};
use crate::services::notifications::{NewNotification, NotificationService};
use crate::store::{ProductStore, StockChange};

/// Trailing window for the ledger-derived usage rate.
const USAGE_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Critical,
    Warning,
    Low,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Critical => "critical",
            Urgency::Warning => "warning",
            Urgency::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Urgency::Critical),
            "warning" => Some(Urgency::Warning),
            "low" => Some(Urgency::Low),
            _ => None,
        }
    }
}

/// Derived stock-health view of one product. Recomputed on every read.
#[derive(Debug, Clone, Serialize)]
pub struct LowStockItem {
    pub product_id: Uuid,
    pub name: String,
    pub current_quantity: i32,
    pub min_stock_level: i32,
    pub metric: String,
    pub product_type: String,
    pub urgency: Urgency,
    pub suggested_restock: i32,
    pub days_until_empty: Option<i64>,
    pub last_restocked: Option<DateTime<Utc>>,
    pub cost_price: Option<Decimal>,
    pub selling_price: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestockRequest {
    pub product_id: Uuid,
    pub quantity: i32,
    pub reason: Option<String>,
    pub user_id: Option<String>,
}

/// Per-item result of a restock. Restocks never fail across the service
/// boundary; callers inspect `success`.
#[derive(Debug, Clone, Serialize)]
pub struct RestockOutcome {
    pub product_id: Uuid,
    pub success: bool,
    pub new_quantity: Option<i32>,
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchRestockReport {
    pub successful: Vec<RestockOutcome>,
    pub failed: Vec<RestockOutcome>,
}

/// `critical` at zero or ratio <= 0.2, `warning` at <= 0.5, `low` otherwise.
/// Callers must have established the product is low-stock at all
/// (`current <= min` with tracking enabled).
pub fn classify(current_quantity: i32, min_stock_level: i32) -> Urgency {
    if current_quantity == 0 {
        return Urgency::Critical;
    }
    if min_stock_level <= 0 {
        // only reachable when current == min == 0 is false; treat as lowest band
        return Urgency::Low;
    }
    let ratio = current_quantity as f64 / min_stock_level as f64;
    if ratio <= 0.2 {
        Urgency::Critical
    } else if ratio <= 0.5 {
        Urgency::Warning
    } else {
        Urgency::Low
    }
}

/// Suggested order size: refill to twice the minimum, with a per-type floor.
/// Never suggests less than one unit.
pub fn suggested_restock(
    current_quantity: i32,
    min_stock_level: i32,
    product_type: Option<ProductType>,
) -> i32 {
    let base = (min_stock_level * 2 - current_quantity) as f64;
    let min = min_stock_level as f64;
    let adjusted = match product_type {
        Some(ProductType::Sellable) => base.max(min * 3.0),
        Some(ProductType::RawStock) => base.max(min * 1.5),
        _ => base.max(min * 2.0),
    };
    (adjusted.ceil() as i32).max(1)
}

/// Days of stock left at the given daily usage rate. A ledger-derived rate is
/// preferred when positive; otherwise the `min * 0.1` heuristic applies.
pub fn days_until_empty(
    current_quantity: i32,
    min_stock_level: i32,
    ledger_rate: Option<f64>,
) -> Option<i64> {
    if current_quantity == 0 {
        return Some(0);
    }
    let rate = ledger_rate
        .filter(|r| *r > 0.0)
        .unwrap_or(min_stock_level as f64 * 0.1);
    if rate > 0.0 {
        Some((current_quantity as f64 / rate).floor() as i64)
    } else {
        None
    }
}

/// Classifies product stock health and drives alert creation/resolution,
/// both on a timer sweep and on demand after mutations.
pub struct LowStockService {
    products: Arc<dyn ProductStore>,
    notifications: Arc<NotificationService>,
    broadcaster: Arc<EventBroadcaster>,
    is_monitoring: AtomicBool,
    /// Single-flight guard: a sweep that outlives the interval must not
    /// overlap the next one.
    sweep_lock: tokio::sync::Mutex<()>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LowStockService {
    pub fn new(
        products: Arc<dyn ProductStore>,
        notifications: Arc<NotificationService>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            products,
            notifications,
            broadcaster,
            is_monitoring: AtomicBool::new(false),
            sweep_lock: tokio::sync::Mutex::new(()),
            monitor_handle: Mutex::new(None),
        }
    }

    /// Daily usage over the trailing window, from actual usage/sale ledger
    /// rows. `None` when the ledger holds no consumption for the product.
    async fn ledger_usage_rate(&self, product_id: Uuid) -> Result<Option<f64>, ServiceError> {
        let since = Utc::now() - ChronoDuration::days(USAGE_WINDOW_DAYS);
        let consumed: i64 = self
            .products
            .transactions_since(product_id, since)
            .await?
            .iter()
            .filter(|t| {
                matches!(
                    t.tx_type(),
                    Some(TransactionType::Usage) | Some(TransactionType::Sale)
                )
            })
            .map(|t| t.quantity as i64)
            .sum();
        if consumed > 0 {
            Ok(Some(consumed as f64 / USAGE_WINDOW_DAYS as f64))
        } else {
            Ok(None)
        }
    }

    fn to_item(product: &product::Model, ledger_rate: Option<f64>) -> LowStockItem {
        let urgency = classify(product.current_quantity, product.min_stock_level);
        LowStockItem {
            product_id: product.id,
            name: product.name.clone(),
            current_quantity: product.current_quantity,
            min_stock_level: product.min_stock_level,
            metric: product.metric.clone(),
            product_type: product.product_type.clone(),
            urgency,
            suggested_restock: suggested_restock(
                product.current_quantity,
                product.min_stock_level,
                product.product_type(),
            ),
            days_until_empty: days_until_empty(
                product.current_quantity,
                product.min_stock_level,
                ledger_rate,
            ),
            last_restocked: product.last_restocked,
            cost_price: product.cost_price,
            selling_price: product.selling_price,
        }
    }

    fn is_low_stock(product: &product::Model) -> bool {
        product.stock_tracking_enabled && product.current_quantity <= product.min_stock_level
    }

    /// All low-stock items, freshly computed, ascending by current quantity.
    #[instrument(skip(self))]
    pub async fn get_low_stock_items(&self) -> Result<Vec<LowStockItem>, ServiceError> {
        let mut items = Vec::new();
        for product in self.products.list_tracked_products().await? {
            if !Self::is_low_stock(&product) {
                continue;
            }
            let rate = self.ledger_usage_rate(product.id).await?;
            items.push(Self::to_item(&product, rate));
        }
        items.sort_by_key(|i| i.current_quantity);
        Ok(items)
    }

    pub async fn get_items_by_urgency(
        &self,
        urgency: Urgency,
    ) -> Result<Vec<LowStockItem>, ServiceError> {
        Ok(self
            .get_low_stock_items()
            .await?
            .into_iter()
            .filter(|i| i.urgency == urgency)
            .collect())
    }

    pub async fn get_critical_items(&self) -> Result<Vec<LowStockItem>, ServiceError> {
        self.get_items_by_urgency(Urgency::Critical).await
    }

    /// Adds stock, appends the `addition` ledger row, records the expense
    /// when the product is priced, resolves alerts if the level recovered and
    /// announces the change. Never errors across this boundary.
    #[instrument(skip(self, request), fields(product_id = %request.product_id))]
    pub async fn restock_item(&self, request: RestockRequest) -> RestockOutcome {
        let product_id = request.product_id;
        let fail = |error: String| RestockOutcome {
            product_id,
            success: false,
            new_quantity: None,
            error: Some(error),
        };

        if request.quantity <= 0 {
            return fail("restock quantity must be positive".to_string());
        }

        let change = StockChange {
            delta: request.quantity,
            tx_type: TransactionType::Addition,
            reason: request
                .reason
                .clone()
                .or_else(|| Some("manual restock".to_string())),
            user_id: request.user_id.unwrap_or_else(|| "system".to_string()),
        };
        let (product, _tx) = match self.products.apply_stock_change(product_id, change).await {
            Ok(Some(applied)) => applied,
            Ok(None) => return fail(format!("product {product_id} not found")),
            Err(e) => {
                error!(error = %e, "restock failed");
                return fail(e.to_string());
            }
        };

        if let Some(cost_price) = product.cost_price {
            let entry = cost_entry::Model {
                id: Uuid::new_v4(),
                product_id,
                description: format!(
                    "Restock: {} x{} {}",
                    product.name, request.quantity, product.metric
                ),
                amount: cost_price * Decimal::from(request.quantity),
                entry_type: CostEntryType::Restock.as_str().to_string(),
                created_at: Utc::now(),
            };
            if let Err(e) = self.products.append_cost_entry(entry).await {
                // the restock itself succeeded; the expense record is best effort
                warn!(error = %e, "failed to record restock expense");
            }
        }

        if product.current_quantity > product.min_stock_level {
            if let Err(e) = self
                .notifications
                .cleanup_resolved_low_stock_notifications(product_id)
                .await
            {
                warn!(error = %e, "failed to resolve low-stock notifications after restock");
            }
        }

        self.broadcaster.broadcast(&ChangeEvent::new(
            EntityKind::Product,
            ChangeOp::Update,
            serde_json::to_value(&product).unwrap_or(serde_json::Value::Null),
        ));
        self.notifications
            .create_notification(NewNotification {
                notification_type: Some(NotificationType::InventoryUpdated),
                message: Some(format!(
                    "{} restocked: +{} {} (now {})",
                    product.name, request.quantity, product.metric, product.current_quantity
                )),
                data: Some(serde_json::json!({
                    "product_id": product_id,
                    "quantity": request.quantity,
                    "new_quantity": product.current_quantity,
                })),
                ..Default::default()
            })
            .await;

        info!(new_quantity = product.current_quantity, "restock applied");
        RestockOutcome {
            product_id,
            success: true,
            new_quantity: Some(product.current_quantity),
            error: None,
        }
    }

    /// Applies each entry independently; partial failure is expected and
    /// reported, never rolled back as a unit.
    pub async fn batch_restock(&self, items: Vec<RestockRequest>) -> BatchRestockReport {
        let mut report = BatchRestockReport::default();
        for item in items {
            let outcome = self.restock_item(item).await;
            if outcome.success {
                report.successful.push(outcome);
            } else {
                report.failed.push(outcome);
            }
        }
        report
    }

    /// Metadata-only; urgency is re-evaluated by the next sweep or on-demand
    /// check, not here.
    #[instrument(skip(self))]
    pub async fn update_stock_threshold(
        &self,
        product_id: Uuid,
        new_min_stock_level: i32,
    ) -> Result<bool, ServiceError> {
        if new_min_stock_level < 0 {
            return Err(ServiceError::ValidationError(
                "minimum stock level cannot be negative".to_string(),
            ));
        }
        let Some(product) = self
            .products
            .update_min_stock(product_id, new_min_stock_level)
            .await?
        else {
            return Ok(false);
        };
        self.broadcaster.broadcast(&ChangeEvent::new(
            EntityKind::Product,
            ChangeOp::Update,
            serde_json::to_value(&product).unwrap_or(serde_json::Value::Null),
        ));
        Ok(true)
    }

    /// Point-in-time evaluation of one product: raises an alert when newly
    /// low-stock, resolves alerts when recovered. Used after mutations, as
    /// opposed to the timer sweep. Returns false for unknown products.
    #[instrument(skip(self))]
    pub async fn check_product_stock_level(&self, product_id: Uuid) -> Result<bool, ServiceError> {
        let Some(product) = self.products.get_product(product_id).await? else {
            return Ok(false);
        };

        if Self::is_low_stock(&product) {
            let urgency = classify(product.current_quantity, product.min_stock_level);
            self.notifications
                .create_low_stock_notification(
                    product.id,
                    &product.name,
                    product.current_quantity,
                    product.min_stock_level,
                    &product.metric,
                    urgency,
                )
                .await?;
        } else {
            self.notifications
                .cleanup_resolved_low_stock_notifications(product_id)
                .await?;
        }
        Ok(true)
    }

    /// One monitoring cycle: diff the low-stock product set against the
    /// active alerts, create the missing, resolve the stale.
    pub async fn run_sweep(&self) -> Result<(), ServiceError> {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            warn!("previous low-stock sweep still running; skipping this cycle");
            return Ok(());
        };

        let items = self.get_low_stock_items().await?;
        let low_ids: HashSet<Uuid> = items.iter().map(|i| i.product_id).collect();

        let active = self
            .notifications
            .get_active_low_stock_notifications(None)
            .await?;
        let alerted: HashSet<Uuid> = active
            .iter()
            .filter_map(|n| {
                n.data
                    .get("product_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
            })
            .collect();

        for item in &items {
            if !alerted.contains(&item.product_id) {
                if let Err(e) = self
                    .notifications
                    .create_low_stock_notification(
                        item.product_id,
                        &item.name,
                        item.current_quantity,
                        item.min_stock_level,
                        &item.metric,
                        item.urgency,
                    )
                    .await
                {
                    warn!(product_id = %item.product_id, error = %e, "sweep failed to create alert");
                }
            }
        }

        for stale in alerted.difference(&low_ids) {
            if let Err(e) = self
                .notifications
                .cleanup_resolved_low_stock_notifications(*stale)
                .await
            {
                warn!(product_id = %stale, error = %e, "sweep failed to resolve alert");
            }
        }

        debug!(
            low_stock = low_ids.len(),
            previously_alerted = alerted.len(),
            "low-stock sweep finished"
        );
        Ok(())
    }

    /// Timer-driven sweep. Double starts are rejected; an in-flight sweep
    /// that outlives the interval is skipped, not stacked.
    pub fn start_monitoring(self: &Arc<Self>, interval: std::time::Duration) -> bool {
        if self.is_monitoring.swap(true, Ordering::SeqCst) {
            warn!("low-stock monitoring already running");
            return false;
        }

        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = service.run_sweep().await {
                    error!(error = %e, "low-stock sweep failed");
                }
            }
        });
        *self.monitor_handle.lock().expect("monitor handle lock poisoned") = Some(handle);
        info!(interval_secs = interval.as_secs(), "low-stock monitoring started");
        true
    }

    pub fn stop_monitoring(&self) {
        if !self.is_monitoring.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self
            .monitor_handle
            .lock()
            .expect("monitor handle lock poisoned")
            .take()
        {
            handle.abort();
        }
        info!("low-stock monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        self.is_monitoring.load(Ordering::SeqCst)
    }
}
