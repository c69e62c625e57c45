mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

use stockwatch::entities::product::{self, ProductType};
use stockwatch::entities::stock_transaction::TransactionType;
use stockwatch::entities::{cost_entry, stock_transaction};
use stockwatch::errors::ServiceError;
use stockwatch::events::EventBroadcaster;
use stockwatch::services::low_stock::{RestockRequest, Urgency};
use stockwatch::services::{LowStockService, NotificationService};
use stockwatch::store::memory::MemoryBackend;
use stockwatch::store::{NotificationFilter, ProductStore, StockChange};

use common::{engine, product, seed, wait_for};

#[tokio::test]
async fn low_stock_items_are_classified_and_sorted() {
    let eng = engine();
    seed(&eng, product("Flour", 0, 10, ProductType::RawStock)).await;
    seed(&eng, product("Sugar", 2, 10, ProductType::RawStock)).await;
    seed(&eng, product("Butter", 4, 10, ProductType::RawStock)).await;
    seed(&eng, product("Eggs", 8, 10, ProductType::RawStock)).await;
    seed(&eng, product("Salt", 50, 10, ProductType::RawStock)).await;
    let mut untracked = product("Napkins", 0, 10, ProductType::Combination);
    untracked.stock_tracking_enabled = false;
    seed(&eng, untracked).await;

    let items = eng.low_stock.get_low_stock_items().await.unwrap();
    assert_eq!(items.len(), 4);

    // ascending by current quantity
    let quantities: Vec<i32> = items.iter().map(|i| i.current_quantity).collect();
    assert_eq!(quantities, vec![0, 2, 4, 8]);

    assert_eq!(items[0].urgency, Urgency::Critical); // out of stock
    assert_eq!(items[1].urgency, Urgency::Critical); // ratio 0.2
    assert_eq!(items[2].urgency, Urgency::Warning); // ratio 0.4
    assert_eq!(items[3].urgency, Urgency::Low); // ratio 0.8

    let critical = eng.low_stock.get_critical_items().await.unwrap();
    assert_eq!(critical.len(), 2);
    let warnings = eng
        .low_stock
        .get_items_by_urgency(Urgency::Warning)
        .await
        .unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].name, "Butter");
}

#[tokio::test]
async fn depletion_estimate_prefers_ledger_usage() {
    let eng = engine();
    let p = seed(&eng, product("Milk", 130, 100, ProductType::RawStock)).await;

    // 60 units consumed inside the trailing window: 2 units per day
    eng.backend
        .apply_stock_change(
            p.id,
            StockChange {
                delta: -60,
                tx_type: TransactionType::Usage,
                reason: None,
                user_id: "kitchen".to_string(),
            },
        )
        .await
        .unwrap()
        .unwrap();

    let items = eng.low_stock.get_low_stock_items().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].current_quantity, 70);
    assert_eq!(items[0].days_until_empty, Some(35));
}

#[tokio::test]
async fn restock_applies_ledger_row_and_notification() {
    let eng = engine();
    let p = seed(&eng, product("Coffee", 3, 10, ProductType::RawStock)).await;

    let outcome = eng
        .low_stock
        .restock_item(RestockRequest {
            product_id: p.id,
            quantity: 20,
            reason: Some("weekly order".to_string()),
            user_id: Some("manager".to_string()),
        })
        .await;
    assert!(outcome.success);
    assert_eq!(outcome.new_quantity, Some(23));

    let updated = eng.backend.get_product(p.id).await.unwrap().unwrap();
    assert_eq!(updated.current_quantity, 23);
    assert!(updated.last_restocked.is_some());

    let ledger = eng
        .backend
        .transactions_since(p.id, chrono::Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].tx_type(), Some(TransactionType::Addition));
    assert_eq!(ledger[0].quantity, 20);
    assert_eq!(ledger[0].previous_quantity, 3);
    assert_eq!(ledger[0].new_quantity, 23);
    assert_eq!(ledger[0].user_id, "manager");

    let filter = NotificationFilter {
        notification_type: Some(stockwatch::entities::NotificationType::InventoryUpdated),
        ..Default::default()
    };
    let updates = eng
        .notifications
        .get_notifications("system", &filter)
        .await
        .unwrap();
    assert_eq!(updates.len(), 1);
    assert!(updates[0].message.contains("Coffee"));
}

#[tokio::test]
async fn restock_never_errors_across_the_boundary() {
    let eng = engine();
    let p = seed(&eng, product("Tea", 3, 10, ProductType::RawStock)).await;

    let zero = eng
        .low_stock
        .restock_item(RestockRequest {
            product_id: p.id,
            quantity: 0,
            reason: None,
            user_id: None,
        })
        .await;
    assert!(!zero.success);
    assert!(zero.error.unwrap().contains("positive"));

    let missing = eng
        .low_stock
        .restock_item(RestockRequest {
            product_id: Uuid::new_v4(),
            quantity: 5,
            reason: None,
            user_id: None,
        })
        .await;
    assert!(!missing.success);
    assert!(missing.error.unwrap().contains("not found"));

    // the failed attempts left no ledger rows behind
    let ledger = eng
        .backend
        .transactions_since(p.id, chrono::Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn batch_restock_reports_partial_failure() {
    let eng = engine();
    let a = seed(&eng, product("Rice", 2, 10, ProductType::RawStock)).await;
    let b = seed(&eng, product("Beans", 1, 10, ProductType::RawStock)).await;
    let bogus = Uuid::new_v4();

    let report = eng
        .low_stock
        .batch_restock(vec![
            RestockRequest {
                product_id: a.id,
                quantity: 10,
                reason: None,
                user_id: None,
            },
            RestockRequest {
                product_id: bogus,
                quantity: 10,
                reason: None,
                user_id: None,
            },
            RestockRequest {
                product_id: b.id,
                quantity: 15,
                reason: None,
                user_id: None,
            },
        ])
        .await;

    assert_eq!(report.successful.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].product_id, bogus);
}

#[tokio::test]
async fn threshold_update_validates_and_reports_existence() {
    let eng = engine();
    let p = seed(&eng, product("Oil", 5, 10, ProductType::RawStock)).await;

    let err = eng
        .low_stock
        .update_stock_threshold(p.id, -1)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));

    assert!(eng.low_stock.update_stock_threshold(p.id, 4).await.unwrap());
    let updated = eng.backend.get_product(p.id).await.unwrap().unwrap();
    assert_eq!(updated.min_stock_level, 4);

    assert!(!eng
        .low_stock
        .update_stock_threshold(Uuid::new_v4(), 4)
        .await
        .unwrap());
}

#[tokio::test]
async fn check_raises_then_restock_resolves_alert() {
    let eng = engine();
    let p = seed(&eng, product("Yeast", 1, 10, ProductType::RawStock)).await;

    assert!(eng.low_stock.check_product_stock_level(p.id).await.unwrap());
    let active = eng
        .notifications
        .get_active_low_stock_notifications(None)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);

    // second check must not duplicate the alert
    assert!(eng.low_stock.check_product_stock_level(p.id).await.unwrap());
    let active = eng
        .notifications
        .get_active_low_stock_notifications(None)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);

    // restocking above the minimum resolves it
    let outcome = eng
        .low_stock
        .restock_item(RestockRequest {
            product_id: p.id,
            quantity: 20,
            reason: None,
            user_id: None,
        })
        .await;
    assert!(outcome.success);
    let active = eng
        .notifications
        .get_active_low_stock_notifications(None)
        .await
        .unwrap();
    assert!(active.is_empty());

    // unknown products report false
    assert!(!eng
        .low_stock
        .check_product_stock_level(Uuid::new_v4())
        .await
        .unwrap());
}

#[tokio::test]
async fn sweep_creates_missing_and_resolves_stale_alerts() {
    let eng = engine();
    let a = seed(&eng, product("Flour", 2, 10, ProductType::RawStock)).await;
    seed(&eng, product("Sugar", 0, 10, ProductType::RawStock)).await;
    seed(&eng, product("Salt", 40, 10, ProductType::RawStock)).await;

    eng.low_stock.run_sweep().await.unwrap();
    let active = eng
        .notifications
        .get_active_low_stock_notifications(None)
        .await
        .unwrap();
    assert_eq!(active.len(), 2);

    // a second sweep changes nothing
    eng.low_stock.run_sweep().await.unwrap();
    let active = eng
        .notifications
        .get_active_low_stock_notifications(None)
        .await
        .unwrap();
    assert_eq!(active.len(), 2);

    // direct stock mutation recovers one product; the next sweep resolves it
    eng.backend
        .apply_stock_change(
            a.id,
            StockChange {
                delta: 30,
                tx_type: TransactionType::Addition,
                reason: None,
                user_id: "system".to_string(),
            },
        )
        .await
        .unwrap()
        .unwrap();
    eng.low_stock.run_sweep().await.unwrap();
    let active = eng
        .notifications
        .get_active_low_stock_notifications(None)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

/// Product store that parks `list_tracked_products` on a semaphore so a sweep
/// can be held in flight; everything else passes through.
struct GatedProducts {
    inner: Arc<MemoryBackend>,
    gate: Arc<Semaphore>,
    entered: Arc<AtomicBool>,
}

#[async_trait]
impl ProductStore for GatedProducts {
    async fn get_product(&self, id: Uuid) -> Result<Option<product::Model>, ServiceError> {
        self.inner.get_product(id).await
    }

    async fn list_tracked_products(&self) -> Result<Vec<product::Model>, ServiceError> {
        self.entered.store(true, Ordering::SeqCst);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| ServiceError::InternalError("gate closed".to_string()))?;
        self.inner.list_tracked_products().await
    }

    async fn insert_product(
        &self,
        product: product::Model,
    ) -> Result<product::Model, ServiceError> {
        self.inner.insert_product(product).await
    }

    async fn apply_stock_change(
        &self,
        product_id: Uuid,
        change: StockChange,
    ) -> Result<Option<(product::Model, stock_transaction::Model)>, ServiceError> {
        self.inner.apply_stock_change(product_id, change).await
    }

    async fn update_min_stock(
        &self,
        product_id: Uuid,
        new_min_stock_level: i32,
    ) -> Result<Option<product::Model>, ServiceError> {
        self.inner.update_min_stock(product_id, new_min_stock_level).await
    }

    async fn transactions_since(
        &self,
        product_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<stock_transaction::Model>, ServiceError> {
        self.inner.transactions_since(product_id, since).await
    }

    async fn append_cost_entry(&self, entry: cost_entry::Model) -> Result<(), ServiceError> {
        self.inner.append_cost_entry(entry).await
    }
}

#[tokio::test]
async fn overlapping_sweep_is_skipped_not_stacked() {
    let backend = Arc::new(MemoryBackend::new());
    let gate = Arc::new(Semaphore::new(0));
    let entered = Arc::new(AtomicBool::new(false));
    let products = Arc::new(GatedProducts {
        inner: backend.clone(),
        gate: gate.clone(),
        entered: entered.clone(),
    });
    let broadcaster = Arc::new(EventBroadcaster::new());
    let notifications = Arc::new(NotificationService::new(backend.clone(), broadcaster.clone()));
    let low_stock = Arc::new(LowStockService::new(
        products,
        notifications.clone(),
        broadcaster,
    ));

    backend
        .insert_product(product("Flour", 2, 10, ProductType::RawStock))
        .await
        .unwrap();

    let slow = low_stock.clone();
    let first = tokio::spawn(async move { slow.run_sweep().await });
    assert!(
        wait_for(|| entered.load(Ordering::SeqCst)).await,
        "first sweep never reached the store"
    );

    // the first sweep still holds the lock; this tick skips without alerting
    low_stock.run_sweep().await.unwrap();
    assert!(notifications
        .get_active_low_stock_notifications(None)
        .await
        .unwrap()
        .is_empty());

    gate.add_permits(1);
    first.await.unwrap().unwrap();
    let active = notifications
        .get_active_low_stock_notifications(None)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn monitoring_rejects_double_start() {
    let eng = engine();
    assert!(!eng.low_stock.is_monitoring());

    assert!(eng.low_stock.start_monitoring(Duration::from_secs(3600)));
    assert!(eng.low_stock.is_monitoring());
    assert!(!eng.low_stock.start_monitoring(Duration::from_secs(3600)));

    eng.low_stock.stop_monitoring();
    assert!(!eng.low_stock.is_monitoring());
    // stop is idempotent
    eng.low_stock.stop_monitoring();
    assert!(!eng.low_stock.is_monitoring());
}
