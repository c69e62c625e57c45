use axum::{
    extract::{Path, Query, State},
    routing::{get, patch},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::entities::{NotificationType, SYSTEM_RECIPIENT};
use crate::errors::ServiceError;
use crate::services::notifications::NewNotification;
use crate::store::NotificationFilter;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct NotificationsQuery {
    pub user_id: Option<String>,
    #[serde(default)]
    pub unread_only: bool,
    #[serde(rename = "type")]
    pub notification_type: Option<String>,
    pub category: Option<String>,
    pub limit: Option<u64>,
    #[serde(default)]
    pub skip: u64,
}

#[derive(Debug, Deserialize)]
pub struct ReadStatePayload {
    pub read: bool,
}

#[derive(Debug, Deserialize)]
pub struct MarkAllReadPayload {
    pub user_id: String,
}

async fn get_notifications_handler(
    State(state): State<AppState>,
    Query(query): Query<NotificationsQuery>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let user_id = query
        .user_id
        .unwrap_or_else(|| SYSTEM_RECIPIENT.to_string());
    let notification_type = query
        .notification_type
        .as_deref()
        .map(|raw| {
            NotificationType::parse(raw).ok_or_else(|| {
                ServiceError::ValidationError(format!("unknown notification type '{raw}'"))
            })
        })
        .transpose()?;

    let filter = NotificationFilter {
        unread_only: query.unread_only,
        notification_type,
        category: query.category,
        limit: query.limit,
        skip: query.skip,
    };
    let notifications = state.notifications.get_notifications(&user_id, &filter).await?;
    let unread_count = state.notifications.get_unread_count(&user_id).await?;
    let count = notifications.len();

    Ok(Json(json!({
        "success": true,
        "notifications": notifications,
        "unread_count": unread_count,
        "pagination": {
            "limit": filter.limit,
            "skip": filter.skip,
            "count": count,
        },
    })))
}

async fn create_notification_handler(
    State(state): State<AppState>,
    Json(payload): Json<NewNotification>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    match state.notifications.create_notification(payload).await {
        Some(created) => Ok(Json(json!({ "success": true, "notification": created }))),
        None => Err(ServiceError::InternalError(
            "notification could not be created".to_string(),
        )),
    }
}

async fn update_notification_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReadStatePayload>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let modified = if payload.read {
        state.notifications.mark_as_read(id).await?
    } else {
        state.notifications.mark_as_unread(id).await?
    };
    Ok(Json(json!({ "success": true, "modified": modified })))
}

async fn delete_notification_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let deleted = state.notifications.delete_notification(id).await?;
    if !deleted {
        return Err(ServiceError::NotFound(format!("notification {id}")));
    }
    Ok(Json(json!({ "success": true })))
}

async fn mark_all_read_handler(
    State(state): State<AppState>,
    Json(payload): Json<MarkAllReadPayload>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let modified = state
        .notifications
        .mark_all_as_read(&payload.user_id)
        .await?;
    Ok(Json(json!({ "success": true, "modified": modified })))
}

pub fn notification_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(get_notifications_handler).post(create_notification_handler),
        )
        .route("/mark-all-read", patch(mark_all_read_handler))
        .route(
            "/:id",
            patch(update_notification_handler).delete(delete_notification_handler),
        )
}
