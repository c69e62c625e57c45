pub mod low_stock;
pub mod notifications;

pub use low_stock::low_stock_routes;
pub use notifications::notification_routes;
