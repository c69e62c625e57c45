use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::events::{ChangeEvent, ChangeOp, EntityKind, EventBroadcaster};
use crate::store::{ChangeFeed, RawChange, RawOp};

/// Logical collections the watcher subscribes to.
pub const TRACKED_COLLECTIONS: [&str; 5] = [
    "products",
    "inventory",
    "cost-operations",
    "sale-transactions",
    "notifications",
];

/// Exponential backoff, optionally bounded. One policy serves both the global
/// connect path and each per-collection stream so reconnect behavior stays
/// uniform.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    pub fn bounded(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            max_attempts: Some(max_attempts),
        }
    }

    pub fn unbounded(base: Duration, max_delay: Duration) -> Self {
        Self {
            base,
            max_delay,
            max_attempts: None,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub connect_backoff: BackoffPolicy,
    pub stream_backoff: BackoffPolicy,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            connect_backoff: BackoffPolicy::bounded(
                Duration::from_secs(1),
                Duration::from_secs(60),
                5,
            ),
            stream_backoff: BackoffPolicy::unbounded(
                Duration::from_secs(1),
                Duration::from_secs(60),
            ),
        }
    }
}

/// Subscribes to the backing store's change streams for the tracked
/// collections, normalizes raw events into [`ChangeEvent`]s and publishes
/// them on the broadcaster. Owns reconnection: connect failures back off
/// exponentially up to a hard cap, after which monitoring stays disabled
/// until restarted externally; an individual stream error only resubscribes
/// that stream and never affects its siblings.
pub struct ChangeFeedWatcher {
    feed: Arc<dyn ChangeFeed>,
    broadcaster: Arc<EventBroadcaster>,
    config: WatcherConfig,
    connected: AtomicBool,
    disabled: AtomicBool,
    reconnect_attempts: AtomicU32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChangeFeedWatcher {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        broadcaster: Arc<EventBroadcaster>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            feed,
            broadcaster,
            config,
            connected: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Establishes the feed connection and opens one stream task per tracked
    /// collection, retrying with backoff. Returns false once the attempt
    /// budget is exhausted; past that point the watcher is permanently
    /// disabled and a process restart (or a fresh watcher) is required.
    pub async fn connect(self: &Arc<Self>) -> bool {
        if self.disabled.load(Ordering::SeqCst) {
            warn!("change feed watcher is disabled; refusing to connect");
            return false;
        }

        let policy = self.config.connect_backoff.clone();
        let mut attempt: u32 = 0;
        loop {
            match self.feed.connect().await {
                Ok(()) => {
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    self.connected.store(true, Ordering::SeqCst);
                    self.spawn_streams();
                    info!(
                        collections = TRACKED_COLLECTIONS.len(),
                        "change feed connected"
                    );
                    return true;
                }
                Err(e) => {
                    attempt += 1;
                    self.reconnect_attempts.store(attempt, Ordering::SeqCst);
                    if policy.exhausted(attempt) {
                        self.connected.store(false, Ordering::SeqCst);
                        self.disabled.store(true, Ordering::SeqCst);
                        // fatal condition: surfaced for operational alerting,
                        // no further automatic reconnect
                        error!(
                            attempts = attempt,
                            error = %e,
                            "change feed reconnect budget exhausted; monitoring disabled"
                        );
                        return false;
                    }
                    let delay = policy.delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "change feed connect failed; retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Spawns `connect` in the background.
    pub fn start(self: &Arc<Self>) -> JoinHandle<bool> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move { watcher.connect().await })
    }

    fn spawn_streams(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("watcher task list poisoned");
        for collection in TRACKED_COLLECTIONS {
            let watcher = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                watcher.run_stream(collection).await;
            }));
        }
    }

    /// One collection's stream loop. Cycles Active -> Erroring ->
    /// Reconnecting -> Active independently of the other collections.
    async fn run_stream(self: Arc<Self>, collection: &'static str) {
        let policy = self.config.stream_backoff.clone();
        let mut attempt: u32 = 0;
        loop {
            if !self.connected.load(Ordering::SeqCst) {
                return;
            }
            match self.feed.watch(collection).await {
                Ok(mut stream) => {
                    debug!(collection, "change stream active");
                    attempt = 0;
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(raw) => self.handle_change(raw),
                            Err(e) => {
                                warn!(collection, error = %e, "change stream errored");
                                break;
                            }
                        }
                    }
                    if !self.connected.load(Ordering::SeqCst) {
                        return;
                    }
                }
                Err(e) => {
                    warn!(collection, error = %e, "failed to open change stream");
                }
            }
            attempt += 1;
            let delay = policy.delay(attempt);
            debug!(
                collection,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "resubscribing change stream"
            );
            sleep(delay).await;
        }
    }

    /// Normalizes a raw store event and fans it out. Unknown collections are
    /// logged and dropped.
    fn handle_change(&self, raw: RawChange) {
        let Some(entity) = EntityKind::from_collection(&raw.collection) else {
            warn!(collection = %raw.collection, "change event for unmapped collection dropped");
            return;
        };

        let event = match raw.op {
            RawOp::Delete => ChangeEvent::deleted(entity, raw.entity_id),
            op => {
                let Some(document) = raw.document else {
                    warn!(
                        collection = %raw.collection,
                        "change event without document dropped"
                    );
                    return;
                };
                let change_op = if op == RawOp::Insert {
                    ChangeOp::Create
                } else {
                    ChangeOp::Update
                };
                ChangeEvent::new(entity, change_op, document)
            }
        };
        self.broadcaster.broadcast(&event);
    }

    /// Closes every stream then the connection. Idempotent.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().expect("watcher task list poisoned");
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        self.feed.close().await;
        info!("change feed disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// True once the reconnect budget was exhausted; cleared only by
    /// constructing a fresh watcher.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy::unbounded(Duration::from_secs(1), Duration::from_secs(8));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(8));
    }

    #[test]
    fn bounded_policy_exhausts_at_cap() {
        let policy = BackoffPolicy::bounded(Duration::from_millis(1), Duration::from_secs(1), 5);
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
        assert!(policy.exhausted(6));
    }

    #[test]
    fn unbounded_policy_never_exhausts() {
        let policy = BackoffPolicy::unbounded(Duration::from_secs(1), Duration::from_secs(60));
        assert!(!policy.exhausted(u32::MAX));
    }
}
