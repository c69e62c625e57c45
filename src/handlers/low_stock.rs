use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::services::low_stock::{LowStockItem, RestockRequest, Urgency};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LowStockQuery {
    pub urgency: Option<String>,
    #[serde(default)]
    pub include_suggestions: bool,
}

#[derive(Debug, Deserialize)]
pub struct LowStockAction {
    pub action: String,
    pub product_id: Option<Uuid>,
    pub quantity: Option<i32>,
    pub reason: Option<String>,
    pub user_id: Option<String>,
    pub min_stock_level: Option<i32>,
    pub items: Option<Vec<RestockRequest>>,
}

fn summary(items: &[LowStockItem]) -> serde_json::Value {
    let count = |u: Urgency| items.iter().filter(|i| i.urgency == u).count();
    json!({
        "critical": count(Urgency::Critical),
        "warning": count(Urgency::Warning),
        "low": count(Urgency::Low),
        "total": items.len(),
    })
}

async fn get_low_stock_handler(
    State(state): State<AppState>,
    Query(query): Query<LowStockQuery>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let items = match query.urgency.as_deref() {
        Some(raw) => {
            let urgency = Urgency::parse(raw).ok_or_else(|| {
                ServiceError::ValidationError(format!("unknown urgency level '{raw}'"))
            })?;
            state.low_stock.get_items_by_urgency(urgency).await?
        }
        None => state.low_stock.get_low_stock_items().await?,
    };

    let mut body = json!({
        "success": true,
        "items": items,
        "summary": summary(&items),
    });
    if query.include_suggestions {
        let suggestions: Vec<_> = items
            .iter()
            .map(|i| {
                json!({
                    "product_id": i.product_id,
                    "name": i.name,
                    "suggested_restock": i.suggested_restock,
                    "metric": i.metric,
                })
            })
            .collect();
        body["suggestions"] = json!(suggestions);
    }
    Ok(Json(body))
}

async fn post_low_stock_handler(
    State(state): State<AppState>,
    Json(payload): Json<LowStockAction>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    match payload.action.as_str() {
        "restock" => {
            let product_id = payload.product_id.ok_or_else(|| {
                ServiceError::ValidationError("restock requires product_id".to_string())
            })?;
            let quantity = payload.quantity.ok_or_else(|| {
                ServiceError::ValidationError("restock requires quantity".to_string())
            })?;
            let outcome = state
                .low_stock
                .restock_item(RestockRequest {
                    product_id,
                    quantity,
                    reason: payload.reason,
                    user_id: payload.user_id,
                })
                .await;
            Ok(Json(json!({ "success": outcome.success, "result": outcome })))
        }
        "batch-restock" => {
            let items = payload.items.ok_or_else(|| {
                ServiceError::ValidationError("batch-restock requires items".to_string())
            })?;
            let report = state.low_stock.batch_restock(items).await;
            Ok(Json(json!({
                "success": report.failed.is_empty(),
                "successful": report.successful,
                "failed": report.failed,
            })))
        }
        "update-threshold" => {
            let product_id = payload.product_id.ok_or_else(|| {
                ServiceError::ValidationError("update-threshold requires product_id".to_string())
            })?;
            let min_stock_level = payload.min_stock_level.ok_or_else(|| {
                ServiceError::ValidationError(
                    "update-threshold requires min_stock_level".to_string(),
                )
            })?;
            let updated = state
                .low_stock
                .update_stock_threshold(product_id, min_stock_level)
                .await?;
            Ok(Json(json!({ "success": updated })))
        }
        other => Err(ServiceError::ValidationError(format!(
            "unknown action '{other}'"
        ))),
    }
}

pub fn low_stock_routes() -> Router<AppState> {
    Router::new().route("/", get(get_low_stock_handler).post(post_low_stock_handler))
}
