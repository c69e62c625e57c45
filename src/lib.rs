//! stockwatch
//!
//! Real-time stock-change detection and notification engine for restaurant
//! inventory: a change feed watcher normalizes store mutations into live
//! events, a low-stock monitor classifies stock health and drives alerting,
//! and a notification lifecycle manager persists and fans out the results.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod services;
pub mod store;

use axum::Router;
use std::sync::Arc;

use events::EventBroadcaster;
use services::{ChangeFeedWatcher, LowStockService, NotificationService};
use store::{ChangeFeed, NotificationStore, ProductStore};

/// Service instances constructed once at startup and injected everywhere;
/// no globals.
#[derive(Clone)]
pub struct AppState {
    pub config: config::AppConfig,
    pub broadcaster: Arc<EventBroadcaster>,
    pub notifications: Arc<NotificationService>,
    pub low_stock: Arc<LowStockService>,
    pub watcher: Arc<ChangeFeedWatcher>,
}

impl AppState {
    /// Wires the engine on top of one backend. The backend object typically
    /// implements all three store traits (memory and sql backends both do).
    pub fn build(
        config: config::AppConfig,
        products: Arc<dyn ProductStore>,
        notifications_store: Arc<dyn NotificationStore>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let notifications = Arc::new(NotificationService::new(
            notifications_store,
            broadcaster.clone(),
        ));
        let low_stock = Arc::new(LowStockService::new(
            products,
            notifications.clone(),
            broadcaster.clone(),
        ));
        let watcher = Arc::new(ChangeFeedWatcher::new(
            feed,
            broadcaster.clone(),
            config.watcher_config(),
        ));
        Self {
            config,
            broadcaster,
            notifications,
            low_stock,
            watcher,
        }
    }
}

/// The HTTP surface consumed by the web layer.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/low-stock", handlers::low_stock_routes())
        .nest("/api/notifications", handlers::notification_routes())
        .with_state(state)
}
