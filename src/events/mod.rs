use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Scope that receives every broadcast in addition to its own.
pub const SYSTEM_SCOPE: &str = "system";

/// Logical entity a change event refers to. Maps one-to-one onto the
/// collections the change feed watcher tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Product,
    Inventory,
    CostOperation,
    SaleTransaction,
    Notification,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Inventory => "inventory",
            EntityKind::CostOperation => "cost_operation",
            EntityKind::SaleTransaction => "sale_transaction",
            EntityKind::Notification => "notification",
        }
    }

    /// Resolve a backing-store collection name to an entity kind. Unknown
    /// collections have no mapping and their events are dropped.
    pub fn from_collection(name: &str) -> Option<Self> {
        match name {
            "products" => Some(EntityKind::Product),
            "inventory" => Some(EntityKind::Inventory),
            "cost-operations" => Some(EntityKind::CostOperation),
            "sale-transactions" => Some(EntityKind::SaleTransaction),
            "notifications" => Some(EntityKind::Notification),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

/// Transient change message fanned out to live subscribers. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity: EntityKind,
    pub op: ChangeOp,
    /// Full document snapshot, or `{"id": …}` for deletes.
    pub data: serde_json::Value,
    /// `{unix_millis}-{random}` ordering/dedup hint for clients. Not a vector
    /// clock; ties across publishers are possible and harmless.
    pub version: String,
}

impl ChangeEvent {
    pub fn new(entity: EntityKind, op: ChangeOp, data: serde_json::Value) -> Self {
        let version = format!(
            "{}-{:06x}",
            Utc::now().timestamp_millis(),
            rand::thread_rng().gen_range(0u32..0x1_000_000)
        );
        Self {
            entity,
            op,
            data,
            version,
        }
    }

    pub fn deleted(entity: EntityKind, id: Uuid) -> Self {
        Self::new(entity, ChangeOp::Delete, serde_json::json!({ "id": id }))
    }
}

pub type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Handle returned by [`EventBroadcaster::subscribe`]; closures are not
/// comparable, so unsubscription is by id.
pub type SubscriptionId = Uuid;

/// In-process fan-out hub. Listeners are registered under a scope (a user id,
/// or [`SYSTEM_SCOPE`] for broadcast consumers) and invoked synchronously in
/// registration order. A panicking listener is isolated and logged; delivery
/// to the remaining listeners continues. No buffering, no replay.
#[derive(Default)]
pub struct EventBroadcaster {
    subscribers: DashMap<String, Vec<(SubscriptionId, Listener)>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, scope: &str, listener: Listener) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.subscribers
            .entry(scope.to_string())
            .or_default()
            .push((id, listener));
        debug!(scope, subscription = %id, "listener subscribed");
        id
    }

    /// Returns false when no listener with that id was registered under the
    /// scope. Idempotent.
    pub fn unsubscribe(&self, scope: &str, id: SubscriptionId) -> bool {
        let Some(mut entry) = self.subscribers.get_mut(scope) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|(sub_id, _)| *sub_id != id);
        before != entry.len()
    }

    /// Delivers the event to every registered listener, in registration order
    /// within each scope. Listeners run outside the subscriber-table guard,
    /// so they may subscribe or unsubscribe re-entrantly.
    pub fn broadcast(&self, event: &ChangeEvent) {
        let scopes: Vec<(String, Vec<(SubscriptionId, Listener)>)> = self
            .subscribers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (scope, listeners) in scopes {
            Self::deliver(&scope, &listeners, event);
        }
    }

    /// Delivers the event to the listeners of a single scope only.
    pub fn notify_scope(&self, scope: &str, event: &ChangeEvent) {
        let listeners = self
            .subscribers
            .get(scope)
            .map(|entry| entry.value().clone());
        if let Some(listeners) = listeners {
            Self::deliver(scope, &listeners, event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().map(|e| e.value().len()).sum()
    }

    fn deliver(scope: &str, listeners: &[(SubscriptionId, Listener)], event: &ChangeEvent) {
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(scope, subscription = %id, "event listener panicked; delivery continues");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn event() -> ChangeEvent {
        ChangeEvent::new(
            EntityKind::Product,
            ChangeOp::Update,
            serde_json::json!({ "id": Uuid::new_v4() }),
        )
    }

    #[test]
    fn delivers_in_registration_order() {
        let hub = EventBroadcaster::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let seen = seen.clone();
            hub.subscribe("alice", Arc::new(move |_| seen.lock().unwrap().push(i)));
        }

        hub.broadcast(&event());
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let hub = EventBroadcaster::new();
        let delivered = Arc::new(Mutex::new(0));
        hub.subscribe("alice", Arc::new(|_| panic!("subscriber bug")));
        let counter = delivered.clone();
        hub.subscribe(
            "alice",
            Arc::new(move |_| *counter.lock().unwrap() += 1),
        );

        hub.broadcast(&event());
        assert_eq!(*delivered.lock().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_removes_listener() {
        let hub = EventBroadcaster::new();
        let delivered = Arc::new(Mutex::new(0));
        let counter = delivered.clone();
        let id = hub.subscribe(
            "bob",
            Arc::new(move |_| *counter.lock().unwrap() += 1),
        );

        assert!(hub.unsubscribe("bob", id));
        assert!(!hub.unsubscribe("bob", id));
        hub.broadcast(&event());
        assert_eq!(*delivered.lock().unwrap(), 0);
    }

    #[test]
    fn notify_scope_targets_one_scope() {
        let hub = EventBroadcaster::new();
        let alice = Arc::new(Mutex::new(0));
        let bob = Arc::new(Mutex::new(0));
        let a = alice.clone();
        let b = bob.clone();
        hub.subscribe("alice", Arc::new(move |_| *a.lock().unwrap() += 1));
        hub.subscribe("bob", Arc::new(move |_| *b.lock().unwrap() += 1));

        hub.notify_scope("alice", &event());
        assert_eq!(*alice.lock().unwrap(), 1);
        assert_eq!(*bob.lock().unwrap(), 0);
    }

    #[test]
    fn listener_may_subscribe_during_delivery() {
        let hub = Arc::new(EventBroadcaster::new());
        let inner = Arc::clone(&hub);
        hub.subscribe(
            "alice",
            Arc::new(move |_| {
                inner.subscribe("alice", Arc::new(|_| {}));
            }),
        );

        hub.broadcast(&event());
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[test]
    fn listener_may_unsubscribe_itself_during_delivery() {
        let hub = Arc::new(EventBroadcaster::new());
        let delivered = Arc::new(Mutex::new(0));

        let id_slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&hub);
        let slot = id_slot.clone();
        let counter = delivered.clone();
        let id = hub.subscribe(
            "bob",
            Arc::new(move |_| {
                *counter.lock().unwrap() += 1;
                if let Some(id) = *slot.lock().unwrap() {
                    inner.unsubscribe("bob", id);
                }
            }),
        );
        *id_slot.lock().unwrap() = Some(id);

        hub.notify_scope("bob", &event());
        hub.notify_scope("bob", &event());
        assert_eq!(*delivered.lock().unwrap(), 1);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn version_tag_shape() {
        let ev = event();
        let (ts, rand_part) = ev.version.split_once('-').expect("version has two parts");
        assert!(ts.parse::<i64>().is_ok());
        assert_eq!(rand_part.len(), 6);
    }

    #[test]
    fn unknown_collection_has_no_mapping() {
        assert!(EntityKind::from_collection("audit-logs").is_none());
        assert_eq!(
            EntityKind::from_collection("inventory"),
            Some(EntityKind::Inventory)
        );
    }
}
