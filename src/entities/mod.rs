pub mod change_log;
pub mod cost_entry;
pub mod notification;
pub mod product;
pub mod stock_transaction;

pub use notification::{NotificationType, Priority, SYSTEM_RECIPIENT};
pub use product::ProductType;
pub use stock_transaction::TransactionType;
