mod common;

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use stockwatch::entities::product::ProductType;
use stockwatch::events::{
    ChangeEvent, ChangeOp, EntityKind, EventBroadcaster, Listener, SYSTEM_SCOPE,
};
use stockwatch::services::change_feed::{BackoffPolicy, ChangeFeedWatcher, WatcherConfig};
use stockwatch::store::{ChangeFeed, ChangeStream, FeedError, NotificationStore, RawChange, RawOp};

use common::{engine, product, seed, wait_for};

fn fast_config() -> WatcherConfig {
    WatcherConfig {
        connect_backoff: BackoffPolicy::bounded(
            Duration::from_millis(1),
            Duration::from_millis(5),
            3,
        ),
        stream_backoff: BackoffPolicy::unbounded(
            Duration::from_millis(1),
            Duration::from_millis(5),
        ),
    }
}

fn collector() -> (Arc<Mutex<Vec<ChangeEvent>>>, Listener) {
    let seen: Arc<Mutex<Vec<ChangeEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener: Listener = Arc::new(move |event| sink.lock().unwrap().push(event.clone()));
    (seen, listener)
}

/// Serves a fixed script of raw changes on one collection, then stays open.
struct ScriptedFeed {
    collection: &'static str,
    script: Mutex<Vec<RawChange>>,
}

impl ScriptedFeed {
    fn new(collection: &'static str, script: Vec<RawChange>) -> Self {
        Self {
            collection,
            script: Mutex::new(script),
        }
    }
}

#[async_trait]
impl ChangeFeed for ScriptedFeed {
    async fn connect(&self) -> Result<(), FeedError> {
        Ok(())
    }

    async fn watch(&self, collection: &str) -> Result<ChangeStream, FeedError> {
        let items: Vec<Result<RawChange, FeedError>> = if collection == self.collection {
            std::mem::take(&mut *self.script.lock().unwrap())
                .into_iter()
                .map(Ok)
                .collect()
        } else {
            Vec::new()
        };
        let stream = futures::stream::iter(items).chain(futures::stream::pending());
        Ok(Box::pin(stream))
    }

    async fn close(&self) {}
}

/// Never connects.
struct FailingFeed {
    attempts: AtomicU32,
}

#[async_trait]
impl ChangeFeed for FailingFeed {
    async fn connect(&self) -> Result<(), FeedError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(FeedError::Connection("store unreachable".to_string()))
    }

    async fn watch(&self, _collection: &str) -> Result<ChangeStream, FeedError> {
        Err(FeedError::Connection("store unreachable".to_string()))
    }

    async fn close(&self) {}
}

/// The products stream errors on its first subscription and recovers on the
/// second; every other collection stays quiet.
struct FlakyFeed {
    product_subscriptions: AtomicU32,
    recovery_change: Mutex<Option<RawChange>>,
}

#[async_trait]
impl ChangeFeed for FlakyFeed {
    async fn connect(&self) -> Result<(), FeedError> {
        Ok(())
    }

    async fn watch(&self, collection: &str) -> Result<ChangeStream, FeedError> {
        if collection != "products" {
            return Ok(Box::pin(futures::stream::pending()));
        }
        let subscription = self.product_subscriptions.fetch_add(1, Ordering::SeqCst);
        if subscription == 0 {
            let err = FeedError::Stream("products".to_string(), "cursor died".to_string());
            let items: Vec<Result<RawChange, FeedError>> = vec![Err(err)];
            return Ok(Box::pin(
                futures::stream::iter(items).chain(futures::stream::pending()),
            ));
        }
        let items: Vec<Result<RawChange, FeedError>> = self
            .recovery_change
            .lock()
            .unwrap()
            .take()
            .map(Ok)
            .into_iter()
            .collect();
        Ok(Box::pin(
            futures::stream::iter(items).chain(futures::stream::pending()),
        ))
    }

    async fn close(&self) {}
}

#[tokio::test]
async fn store_mutations_surface_as_broadcast_events() {
    let eng = engine();
    let (seen, listener) = collector();
    eng.broadcaster.subscribe(SYSTEM_SCOPE, listener);

    let watcher = Arc::new(ChangeFeedWatcher::new(
        eng.backend.clone(),
        eng.broadcaster.clone(),
        fast_config(),
    ));
    assert!(watcher.connect().await);
    assert!(watcher.is_connected());
    // let the per-collection stream tasks subscribe before mutating
    tokio::time::sleep(Duration::from_millis(100)).await;

    let p = seed(&eng, product("Flour", 5, 10, ProductType::RawStock)).await;
    assert!(
        wait_for(|| {
            seen.lock().unwrap().iter().any(|e| {
                e.entity == EntityKind::Product
                    && e.op == ChangeOp::Create
                    && e.data["id"] == p.id.to_string()
            })
        })
        .await,
        "product insert never reached the broadcaster"
    );

    let event = seen
        .lock()
        .unwrap()
        .iter()
        .find(|e| e.op == ChangeOp::Create && e.entity == EntityKind::Product)
        .cloned()
        .unwrap();
    assert_eq!(event.data["name"], "Flour");
    assert!(event.version.contains('-'));

    watcher.disconnect().await;
    assert!(!watcher.is_connected());
    // disconnect is idempotent
    watcher.disconnect().await;
}

#[tokio::test]
async fn deletes_carry_only_the_entity_id() {
    let eng = engine();
    let (seen, listener) = collector();
    eng.broadcaster.subscribe(SYSTEM_SCOPE, listener);

    let watcher = Arc::new(ChangeFeedWatcher::new(
        eng.backend.clone(),
        eng.broadcaster.clone(),
        fast_config(),
    ));
    assert!(watcher.connect().await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let record = stockwatch::entities::notification::Model {
        id: Uuid::new_v4(),
        notification_type: "system".to_string(),
        title: "t".to_string(),
        message: "m".to_string(),
        data: serde_json::Value::Null,
        recipient: "system".to_string(),
        read: false,
        priority: "low".to_string(),
        category: "system".to_string(),
        created_at: chrono::Utc::now(),
        expires_at: None,
    };
    let record = eng.backend.insert(record).await.unwrap();
    eng.backend.delete(record.id).await.unwrap();

    assert!(
        wait_for(|| {
            seen.lock().unwrap().iter().any(|e| {
                e.entity == EntityKind::Notification
                    && e.op == ChangeOp::Delete
                    && e.data["id"] == record.id.to_string()
            })
        })
        .await,
        "notification delete never reached the broadcaster"
    );

    let delete = seen
        .lock()
        .unwrap()
        .iter()
        .find(|e| e.op == ChangeOp::Delete)
        .cloned()
        .unwrap();
    // id only, no document snapshot
    assert_eq!(delete.data.as_object().unwrap().len(), 1);

    watcher.disconnect().await;
}

#[tokio::test]
async fn unmapped_collections_are_dropped() {
    let broadcaster = Arc::new(EventBroadcaster::new());
    let (seen, listener) = collector();
    broadcaster.subscribe(SYSTEM_SCOPE, listener);

    let good_id = Uuid::new_v4();
    let feed = Arc::new(ScriptedFeed::new(
        "products",
        vec![
            // an upstream event for a collection the watcher does not map
            RawChange {
                collection: "audit-logs".to_string(),
                op: RawOp::Insert,
                document: Some(serde_json::json!({ "id": Uuid::new_v4() })),
                entity_id: Uuid::new_v4(),
            },
            // an insert without a document cannot be normalized either
            RawChange {
                collection: "products".to_string(),
                op: RawOp::Insert,
                document: None,
                entity_id: Uuid::new_v4(),
            },
            RawChange {
                collection: "products".to_string(),
                op: RawOp::Replace,
                document: Some(serde_json::json!({ "id": good_id, "name": "Flour" })),
                entity_id: good_id,
            },
        ],
    ));

    let watcher = Arc::new(ChangeFeedWatcher::new(feed, broadcaster, fast_config()));
    assert!(watcher.connect().await);

    assert!(
        wait_for(|| !seen.lock().unwrap().is_empty()).await,
        "scripted change never reached the broadcaster"
    );
    let events = seen.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].entity, EntityKind::Product);
    // replace normalizes to update
    assert_eq!(events[0].op, ChangeOp::Update);

    watcher.disconnect().await;
}

#[tokio::test]
async fn connect_gives_up_after_the_attempt_budget() {
    let feed = Arc::new(FailingFeed {
        attempts: AtomicU32::new(0),
    });
    let broadcaster = Arc::new(EventBroadcaster::new());
    let watcher = Arc::new(ChangeFeedWatcher::new(
        feed.clone(),
        broadcaster,
        fast_config(),
    ));

    assert!(!watcher.connect().await);
    assert!(!watcher.is_connected());
    assert!(watcher.is_disabled());
    assert_eq!(watcher.reconnect_attempts(), 3);
    assert_eq!(feed.attempts.load(Ordering::SeqCst), 3);

    // a disabled watcher refuses further attempts outright
    assert!(!watcher.connect().await);
    assert_eq!(feed.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn stream_errors_resubscribe_without_losing_the_feed() {
    let broadcaster = Arc::new(EventBroadcaster::new());
    let (seen, listener) = collector();
    broadcaster.subscribe(SYSTEM_SCOPE, listener);

    let id = Uuid::new_v4();
    let feed = Arc::new(FlakyFeed {
        product_subscriptions: AtomicU32::new(0),
        recovery_change: Mutex::new(Some(RawChange {
            collection: "products".to_string(),
            op: RawOp::Update,
            document: Some(serde_json::json!({ "id": id, "name": "Flour" })),
            entity_id: id,
        })),
    });

    let watcher = Arc::new(ChangeFeedWatcher::new(
        feed.clone(),
        broadcaster,
        fast_config(),
    ));
    assert!(watcher.connect().await);

    // the errored products stream comes back on its own and delivers
    assert!(
        wait_for(|| {
            seen.lock()
                .unwrap()
                .iter()
                .any(|e| e.entity == EntityKind::Product && e.op == ChangeOp::Update)
        })
        .await,
        "products stream never recovered"
    );
    assert!(feed.product_subscriptions.load(Ordering::SeqCst) >= 2);
    assert!(watcher.is_connected());

    watcher.disconnect().await;
}
