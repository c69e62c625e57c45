pub mod change_feed;
pub mod low_stock;
pub mod notifications;

pub use change_feed::{BackoffPolicy, ChangeFeedWatcher, WatcherConfig};
pub use low_stock::LowStockService;
pub use notifications::NotificationService;
