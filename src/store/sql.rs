use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Set, ColumnTrait, Condition,
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, EntityTrait,
    IntoActiveModel, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Statement,
    TransactionTrait,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entities::stock_transaction::TransactionType;
use crate::entities::{
    change_log, cost_entry, notification, product, stock_transaction, NotificationType,
};
use crate::errors::ServiceError;
use crate::store::{
    ChangeFeed, ChangeStream, FeedError, NotificationFilter, NotificationStore, ProductStore,
    RawChange, RawOp, StockChange,
};

const POLL_BATCH: u64 = 100;
const DEFAULT_QUERY_LIMIT: u64 = 50;

/// sea-orm backed store. Every mutation appends a `change_log` row inside the
/// same transaction as the write; the change feed tails that table, so CDC
/// consumers observe exactly the committed mutations in commit order.
pub struct SqlBackend {
    db: Arc<DatabaseConnection>,
    poll_interval: Duration,
    connected: Arc<AtomicBool>,
}

impl SqlBackend {
    pub fn new(db: Arc<DatabaseConnection>, poll_interval: Duration) -> Self {
        Self {
            db,
            poll_interval,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bootstraps the schema. Safe to run on every startup.
    pub async fn init_schema(&self) -> Result<(), ServiceError> {
        for sql in schema_statements(self.db.get_database_backend()) {
            self.db
                .execute(Statement::from_string(self.db.get_database_backend(), sql))
                .await?;
        }
        Ok(())
    }

    fn log_row(
        collection: &str,
        op: RawOp,
        document: Option<serde_json::Value>,
        entity_id: Uuid,
    ) -> change_log::ActiveModel {
        change_log::ActiveModel {
            id: NotSet,
            collection: Set(collection.to_string()),
            op: Set(raw_op_str(op).to_string()),
            document: Set(document),
            entity_id: Set(entity_id),
            created_at: Set(Utc::now()),
        }
    }

    async fn append_log(
        txn: &DatabaseTransaction,
        collection: &str,
        op: RawOp,
        document: Option<serde_json::Value>,
        entity_id: Uuid,
    ) -> Result<(), ServiceError> {
        change_log::Entity::insert(Self::log_row(collection, op, document, entity_id))
            .exec(txn)
            .await?;
        Ok(())
    }

    fn doc<T: serde::Serialize>(value: &T) -> Option<serde_json::Value> {
        serde_json::to_value(value).ok()
    }
}

fn raw_op_str(op: RawOp) -> &'static str {
    match op {
        RawOp::Insert => "insert",
        RawOp::Update => "update",
        RawOp::Replace => "replace",
        RawOp::Delete => "delete",
    }
}

fn parse_raw_op(s: &str) -> RawOp {
    match s {
        "insert" => RawOp::Insert,
        "replace" => RawOp::Replace,
        "delete" => RawOp::Delete,
        _ => RawOp::Update,
    }
}

fn unexpired(now: DateTime<Utc>) -> Condition {
    Condition::any()
        .add(notification::Column::ExpiresAt.is_null())
        .add(notification::Column::ExpiresAt.gt(now))
}

fn schema_statements(backend: DbBackend) -> Vec<String> {
    let (uuid_ty, json_ty, ts_ty, serial_ty) = match backend {
        DbBackend::Postgres => ("UUID", "JSONB", "TIMESTAMPTZ", "BIGSERIAL PRIMARY KEY"),
        _ => (
            "TEXT",
            "TEXT",
            "TEXT",
            "INTEGER PRIMARY KEY AUTOINCREMENT",
        ),
    };
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS products (
                id {uuid_ty} PRIMARY KEY,
                name TEXT NOT NULL,
                current_quantity INTEGER NOT NULL DEFAULT 0,
                min_stock_level INTEGER NOT NULL DEFAULT 0,
                metric TEXT NOT NULL,
                product_type TEXT NOT NULL,
                cost_price DECIMAL,
                selling_price DECIMAL,
                group_id {uuid_ty},
                stock_tracking_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                last_restocked {ts_ty},
                created_at {ts_ty} NOT NULL,
                updated_at {ts_ty} NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS stock_transactions (
                id {uuid_ty} PRIMARY KEY,
                product_id {uuid_ty} NOT NULL,
                tx_type TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                previous_quantity INTEGER NOT NULL,
                new_quantity INTEGER NOT NULL,
                reason TEXT,
                user_id TEXT NOT NULL,
                created_at {ts_ty} NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS notifications (
                id {uuid_ty} PRIMARY KEY,
                notification_type TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                data {json_ty} NOT NULL,
                recipient TEXT NOT NULL,
                read BOOLEAN NOT NULL DEFAULT FALSE,
                priority TEXT NOT NULL,
                category TEXT NOT NULL,
                created_at {ts_ty} NOT NULL,
                expires_at {ts_ty}
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS cost_entries (
                id {uuid_ty} PRIMARY KEY,
                product_id {uuid_ty} NOT NULL,
                description TEXT NOT NULL,
                amount DECIMAL NOT NULL,
                entry_type TEXT NOT NULL,
                created_at {ts_ty} NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS change_log (
                id {serial_ty},
                collection TEXT NOT NULL,
                op TEXT NOT NULL,
                document {json_ty},
                entity_id {uuid_ty} NOT NULL,
                created_at {ts_ty} NOT NULL
            )"
        ),
    ]
}

#[async_trait]
impl ProductStore for SqlBackend {
    async fn get_product(&self, id: Uuid) -> Result<Option<product::Model>, ServiceError> {
        Ok(product::Entity::find_by_id(id).one(&*self.db).await?)
    }

    async fn list_tracked_products(&self) -> Result<Vec<product::Model>, ServiceError> {
        Ok(product::Entity::find()
            .filter(product::Column::StockTrackingEnabled.eq(true))
            .order_by_asc(product::Column::CurrentQuantity)
            .all(&*self.db)
            .await?)
    }

    async fn insert_product(
        &self,
        product_model: product::Model,
    ) -> Result<product::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let id = product_model.id;
        let doc = Self::doc(&product_model);
        product::Entity::insert(product_model.clone().into_active_model())
            .exec(&txn)
            .await?;
        Self::append_log(&txn, "products", RawOp::Insert, doc, id).await?;
        txn.commit().await?;
        Ok(product_model)
    }

    async fn apply_stock_change(
        &self,
        product_id: Uuid,
        change: StockChange,
    ) -> Result<Option<(product::Model, stock_transaction::Model)>, ServiceError> {
        let txn = self.db.begin().await?;
        let Some(current) = product::Entity::find_by_id(product_id).one(&txn).await? else {
            txn.rollback().await?;
            return Ok(None);
        };

        let previous = current.current_quantity;
        let new_quantity = previous + change.delta;
        if new_quantity < 0 {
            txn.rollback().await?;
            return Err(ServiceError::InvalidOperation(format!(
                "stock change of {} would take product {} below zero (current {})",
                change.delta, product_id, previous
            )));
        }

        let now = Utc::now();
        let mut active = current.clone().into_active_model();
        active.current_quantity = Set(new_quantity);
        active.updated_at = Set(now);
        if change.tx_type == TransactionType::Addition {
            active.last_restocked = Set(Some(now));
        }
        let updated = active.update(&txn).await?;

        let tx = stock_transaction::Model {
            id: Uuid::new_v4(),
            product_id,
            tx_type: change.tx_type.as_str().to_string(),
            quantity: change.delta.unsigned_abs() as i32,
            previous_quantity: previous,
            new_quantity,
            reason: change.reason,
            user_id: change.user_id,
            created_at: now,
        };
        stock_transaction::Entity::insert(tx.clone().into_active_model())
            .exec(&txn)
            .await?;

        Self::append_log(&txn, "products", RawOp::Update, Self::doc(&updated), product_id).await?;
        Self::append_log(&txn, "inventory", RawOp::Insert, Self::doc(&tx), tx.id).await?;
        if change.tx_type == TransactionType::Sale {
            Self::append_log(&txn, "sale-transactions", RawOp::Insert, Self::doc(&tx), tx.id)
                .await?;
        }
        txn.commit().await?;
        Ok(Some((updated, tx)))
    }

    async fn update_min_stock(
        &self,
        product_id: Uuid,
        new_min_stock_level: i32,
    ) -> Result<Option<product::Model>, ServiceError> {
        let txn = self.db.begin().await?;
        let Some(current) = product::Entity::find_by_id(product_id).one(&txn).await? else {
            txn.rollback().await?;
            return Ok(None);
        };
        let mut active = current.into_active_model();
        active.min_stock_level = Set(new_min_stock_level);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;
        Self::append_log(&txn, "products", RawOp::Update, Self::doc(&updated), product_id).await?;
        txn.commit().await?;
        Ok(Some(updated))
    }

    async fn transactions_since(
        &self,
        product_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<stock_transaction::Model>, ServiceError> {
        Ok(stock_transaction::Entity::find()
            .filter(stock_transaction::Column::ProductId.eq(product_id))
            .filter(stock_transaction::Column::CreatedAt.gte(since))
            .order_by_asc(stock_transaction::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    async fn append_cost_entry(&self, entry: cost_entry::Model) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        let id = entry.id;
        let doc = Self::doc(&entry);
        cost_entry::Entity::insert(entry.into_active_model())
            .exec(&txn)
            .await?;
        Self::append_log(&txn, "cost-operations", RawOp::Insert, doc, id).await?;
        txn.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for SqlBackend {
    async fn insert(
        &self,
        notification_model: notification::Model,
    ) -> Result<notification::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let id = notification_model.id;
        let doc = Self::doc(&notification_model);
        notification::Entity::insert(notification_model.clone().into_active_model())
            .exec(&txn)
            .await?;
        Self::append_log(&txn, "notifications", RawOp::Insert, doc, id).await?;
        txn.commit().await?;
        Ok(notification_model)
    }

    async fn insert_low_stock_if_absent(
        &self,
        product_id: Uuid,
        notification_model: notification::Model,
    ) -> Result<Option<notification::Model>, ServiceError> {
        let backend = self.db.get_database_backend();
        let txn = self.db.begin().await?;

        // Concurrent evaluators of the same product serialize on a
        // transaction-scoped advisory lock; sqlite already has a single
        // writer. With the lock held, the guarded insert below is the only
        // statement that can create an alert for this product.
        if backend == DbBackend::Postgres {
            txn.execute(Statement::from_sql_and_values(
                backend,
                "SELECT pg_advisory_xact_lock(hashtext($1))",
                [product_id.to_string().into()],
            ))
            .await?;
        }

        // Existence check and insert are one statement.
        let sql = match backend {
            DbBackend::Postgres => {
                "INSERT INTO notifications \
                 (id, notification_type, title, message, data, recipient, \
                  read, priority, category, created_at, expires_at) \
                 SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11 \
                 WHERE NOT EXISTS (SELECT 1 FROM notifications \
                     WHERE notification_type = 'low_stock' AND read = FALSE \
                     AND (expires_at IS NULL OR expires_at > $12) \
                     AND data->>'product_id' = $13)"
            }
            _ => {
                "INSERT INTO notifications \
                 (id, notification_type, title, message, data, recipient, \
                  read, priority, category, created_at, expires_at) \
                 SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ? \
                 WHERE NOT EXISTS (SELECT 1 FROM notifications \
                     WHERE notification_type = 'low_stock' AND read = FALSE \
                     AND (expires_at IS NULL OR expires_at > ?) \
                     AND json_extract(data, '$.product_id') = ?)"
            }
        };
        let m = &notification_model;
        let result = txn
            .execute(Statement::from_sql_and_values(
                backend,
                sql,
                [
                    m.id.into(),
                    m.notification_type.clone().into(),
                    m.title.clone().into(),
                    m.message.clone().into(),
                    m.data.clone().into(),
                    m.recipient.clone().into(),
                    m.read.into(),
                    m.priority.clone().into(),
                    m.category.clone().into(),
                    m.created_at.into(),
                    m.expires_at.into(),
                    Utc::now().into(),
                    product_id.to_string().into(),
                ],
            ))
            .await?;
        if result.rows_affected() == 0 {
            txn.rollback().await?;
            return Ok(None);
        }

        let id = notification_model.id;
        let doc = Self::doc(&notification_model);
        Self::append_log(&txn, "notifications", RawOp::Insert, doc, id).await?;
        txn.commit().await?;
        Ok(Some(notification_model))
    }

    async fn get(&self, id: Uuid) -> Result<Option<notification::Model>, ServiceError> {
        Ok(notification::Entity::find_by_id(id).one(&*self.db).await?)
    }

    async fn query(
        &self,
        recipient: &str,
        filter: &NotificationFilter,
    ) -> Result<Vec<notification::Model>, ServiceError> {
        let now = Utc::now();
        let mut query = notification::Entity::find()
            .filter(
                Condition::any()
                    .add(notification::Column::Recipient.eq(recipient))
                    .add(notification::Column::Recipient.eq(notification::SYSTEM_RECIPIENT)),
            )
            .filter(unexpired(now));
        if filter.unread_only {
            query = query.filter(notification::Column::Read.eq(false));
        }
        if let Some(nt) = filter.notification_type {
            query = query.filter(notification::Column::NotificationType.eq(nt.as_str()));
        }
        if let Some(category) = filter.category.as_deref() {
            query = query.filter(notification::Column::Category.eq(category));
        }
        Ok(query
            .order_by_desc(notification::Column::CreatedAt)
            .offset(filter.skip)
            .limit(filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT))
            .all(&*self.db)
            .await?)
    }

    async fn set_read(&self, id: Uuid, read: bool) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await?;
        let Some(current) = notification::Entity::find_by_id(id).one(&txn).await? else {
            txn.rollback().await?;
            return Ok(false);
        };
        if current.read == read {
            txn.rollback().await?;
            return Ok(false);
        }
        let mut active = current.into_active_model();
        active.read = Set(read);
        let updated = active.update(&txn).await?;
        Self::append_log(&txn, "notifications", RawOp::Update, Self::doc(&updated), id).await?;
        txn.commit().await?;
        Ok(true)
    }

    async fn mark_all_read(&self, recipient: &str) -> Result<u64, ServiceError> {
        let result = notification::Entity::update_many()
            .col_expr(notification::Column::Read, Expr::value(true))
            .filter(notification::Column::Recipient.eq(recipient))
            .filter(notification::Column::Read.eq(false))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await?;
        let result = notification::Entity::delete_by_id(id).exec(&txn).await?;
        if result.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(false);
        }
        Self::append_log(&txn, "notifications", RawOp::Delete, None, id).await?;
        txn.commit().await?;
        Ok(true)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let txn = self.db.begin().await?;
        let expired: Vec<Uuid> = notification::Entity::find()
            .filter(notification::Column::ExpiresAt.is_not_null())
            .filter(notification::Column::ExpiresAt.lt(now))
            .all(&txn)
            .await?
            .into_iter()
            .map(|n| n.id)
            .collect();
        if expired.is_empty() {
            txn.rollback().await?;
            return Ok(0);
        }
        notification::Entity::delete_many()
            .filter(notification::Column::Id.is_in(expired.clone()))
            .exec(&txn)
            .await?;
        for id in &expired {
            Self::append_log(&txn, "notifications", RawOp::Delete, None, *id).await?;
        }
        txn.commit().await?;
        Ok(expired.len() as u64)
    }

    async fn delete_unread_low_stock_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<u64, ServiceError> {
        let backend = self.db.get_database_backend();
        let txn = self.db.begin().await?;
        let sql = match backend {
            DbBackend::Postgres => {
                "SELECT id FROM notifications \
                 WHERE notification_type = 'low_stock' AND read = FALSE \
                 AND data->>'product_id' = $1"
            }
            _ => {
                "SELECT id FROM notifications \
                 WHERE notification_type = 'low_stock' AND read = FALSE \
                 AND json_extract(data, '$.product_id') = ?"
            }
        };
        let rows = txn
            .query_all(Statement::from_sql_and_values(
                backend,
                sql,
                [product_id.to_string().into()],
            ))
            .await?;
        let ids: Vec<Uuid> = rows
            .iter()
            .filter_map(|r| r.try_get::<Uuid>("", "id").ok())
            .collect();
        if ids.is_empty() {
            txn.rollback().await?;
            return Ok(0);
        }
        notification::Entity::delete_many()
            .filter(notification::Column::Id.is_in(ids.clone()))
            .exec(&txn)
            .await?;
        for id in &ids {
            Self::append_log(&txn, "notifications", RawOp::Delete, None, *id).await?;
        }
        txn.commit().await?;
        Ok(ids.len() as u64)
    }

    async fn count_unread(&self, recipient: &str) -> Result<u64, ServiceError> {
        Ok(notification::Entity::find()
            .filter(
                Condition::any()
                    .add(notification::Column::Recipient.eq(recipient))
                    .add(notification::Column::Recipient.eq(notification::SYSTEM_RECIPIENT)),
            )
            .filter(notification::Column::Read.eq(false))
            .filter(unexpired(Utc::now()))
            .count(&*self.db)
            .await?)
    }

    async fn active_low_stock(
        &self,
        recipient: Option<&str>,
    ) -> Result<Vec<notification::Model>, ServiceError> {
        let mut query = notification::Entity::find()
            .filter(
                notification::Column::NotificationType.eq(NotificationType::LowStock.as_str()),
            )
            .filter(notification::Column::Read.eq(false))
            .filter(unexpired(Utc::now()));
        if let Some(r) = recipient {
            query = query.filter(
                Condition::any()
                    .add(notification::Column::Recipient.eq(r))
                    .add(notification::Column::Recipient.eq(notification::SYSTEM_RECIPIENT)),
            );
        }
        Ok(query.all(&*self.db).await?)
    }
}

#[async_trait]
impl ChangeFeed for SqlBackend {
    async fn connect(&self) -> Result<(), FeedError> {
        self.db
            .ping()
            .await
            .map_err(|e| FeedError::Connection(e.to_string()))?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn watch(&self, collection: &str) -> Result<ChangeStream, FeedError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(FeedError::Connection("feed is not connected".to_string()));
        }

        // Start tailing after the current high-water mark so only new
        // mutations are observed.
        let last_id = change_log::Entity::find()
            .order_by_desc(change_log::Column::Id)
            .one(&*self.db)
            .await
            .map_err(|e| FeedError::Stream(collection.to_string(), e.to_string()))?
            .map(|row| row.id)
            .unwrap_or(0);
        debug!(collection, last_id, "tailing change_log");

        struct PollState {
            db: Arc<DatabaseConnection>,
            collection: String,
            last_id: i64,
            buffer: VecDeque<change_log::Model>,
            interval: Duration,
            connected: Arc<AtomicBool>,
        }

        let state = PollState {
            db: self.db.clone(),
            collection: collection.to_string(),
            last_id,
            buffer: VecDeque::new(),
            interval: self.poll_interval,
            connected: self.connected.clone(),
        };

        let stream = futures::stream::unfold(state, |mut s| async move {
            loop {
                if let Some(row) = s.buffer.pop_front() {
                    let change = RawChange {
                        collection: row.collection.clone(),
                        op: parse_raw_op(&row.op),
                        document: row.document,
                        entity_id: row.entity_id,
                    };
                    return Some((Ok(change), s));
                }
                if !s.connected.load(Ordering::SeqCst) {
                    return None;
                }
                sleep(s.interval).await;
                let batch = change_log::Entity::find()
                    .filter(change_log::Column::Collection.eq(s.collection.as_str()))
                    .filter(change_log::Column::Id.gt(s.last_id))
                    .order_by_asc(change_log::Column::Id)
                    .limit(POLL_BATCH)
                    .all(&*s.db)
                    .await;
                match batch {
                    Ok(rows) => {
                        for row in rows {
                            s.last_id = row.id;
                            s.buffer.push_back(row);
                        }
                    }
                    Err(e) => {
                        warn!(collection = %s.collection, error = %e, "change_log poll failed");
                        let err = FeedError::Stream(s.collection.clone(), e.to_string());
                        return Some((Err(err), s));
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
