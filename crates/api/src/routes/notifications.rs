//! Notification write path and durable history.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::Event;
use courier_engine::CreateNotificationParams;

use crate::extract::{AppJson, AppPath, AppQuery};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    // `{id}` is the recipient on the history route and the event on the
    // read route; both segments must share a name.
    Router::new()
        .route("/api/v1/notifications", post(create_notification))
        .route("/api/v1/notifications/{id}", get(list_notifications))
        .route("/api/v1/notifications/{id}/read", put(mark_read))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// POST /api/v1/notifications: Record a notification for delivery.
async fn create_notification(
    State(state): State<AppState>,
    AppJson(params): AppJson<CreateNotificationParams>,
) -> Result<(StatusCode, Json<Event>), AppError> {
    let event = state.service.create(params).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

/// GET /api/v1/notifications/:recipient_id: History, newest first.
async fn list_notifications(
    State(state): State<AppState>,
    AppPath(recipient_id): AppPath<Uuid>,
    AppQuery(query): AppQuery<HistoryQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let notifications = state
        .service
        .history(recipient_id, query.limit, query.offset)
        .await?;
    Ok(Json(json!({ "notifications": notifications })))
}

/// PUT /api/v1/notifications/:id/read
async fn mark_read(
    State(state): State<AppState>,
    AppPath(id): AppPath<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.service.mark_read(id).await?;
    Ok(Json(json!({ "id": id, "status": "read" })))
}
