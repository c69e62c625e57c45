#![allow(dead_code)]

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use stockwatch::entities::product::{self, ProductType};
use stockwatch::events::EventBroadcaster;
use stockwatch::services::{LowStockService, NotificationService};
use stockwatch::store::memory::MemoryBackend;
use stockwatch::store::ProductStore;

pub struct TestEngine {
    pub backend: Arc<MemoryBackend>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub notifications: Arc<NotificationService>,
    pub low_stock: Arc<LowStockService>,
}

pub fn engine() -> TestEngine {
    let backend = Arc::new(MemoryBackend::new());
    let broadcaster = Arc::new(EventBroadcaster::new());
    let notifications = Arc::new(NotificationService::new(
        backend.clone(),
        broadcaster.clone(),
    ));
    let low_stock = Arc::new(LowStockService::new(
        backend.clone(),
        notifications.clone(),
        broadcaster.clone(),
    ));
    TestEngine {
        backend,
        broadcaster,
        notifications,
        low_stock,
    }
}

pub fn product(name: &str, current: i32, min: i32, product_type: ProductType) -> product::Model {
    let now = Utc::now();
    product::Model {
        id: Uuid::new_v4(),
        name: name.to_string(),
        current_quantity: current,
        min_stock_level: min,
        metric: "kg".to_string(),
        product_type: product_type.as_str().to_string(),
        cost_price: None,
        selling_price: None,
        group_id: None,
        stock_tracking_enabled: true,
        last_restocked: None,
        created_at: now,
        updated_at: now,
    }
}

pub async fn seed(engine: &TestEngine, model: product::Model) -> product::Model {
    engine
        .backend
        .insert_product(model)
        .await
        .expect("seeding product failed")
}

/// Polls until the predicate holds or roughly two seconds pass.
pub async fn wait_for<F: Fn() -> bool>(predicate: F) -> bool {
    for _ in 0..200 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
