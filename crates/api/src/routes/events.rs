//! Domain events reported by other services.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::Event;

use crate::extract::AppJson;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/api/v1/events/practice-completed",
        post(practice_completed),
    )
}

#[derive(Debug, Deserialize)]
pub struct PracticeCompleted {
    pub user_id: Uuid,
    pub points: Option<i32>,
}

/// POST /api/v1/events/practice-completed: Achievement notification.
async fn practice_completed(
    State(state): State<AppState>,
    AppJson(request): AppJson<PracticeCompleted>,
) -> Result<(StatusCode, Json<Event>), AppError> {
    let event = state
        .service
        .practice_completed(request.user_id, request.points)
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}
