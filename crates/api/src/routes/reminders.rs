//! Manually triggered reminders for a single user.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::CohortRule;

use crate::extract::AppJson;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/reminders/daily", post(daily_reminder))
        .route("/api/v1/reminders/streak", post(streak_reminder))
}

#[derive(Debug, Deserialize)]
pub struct ReminderRequest {
    #[serde(alias = "id")]
    pub user_id: Uuid,
}

/// POST /api/v1/reminders/daily
async fn daily_reminder(
    State(state): State<AppState>,
    AppJson(request): AppJson<ReminderRequest>,
) -> Result<Response, AppError> {
    remind(&state, CohortRule::DailyReminder, request.user_id).await
}

/// POST /api/v1/reminders/streak: 400 when the user has no active streak.
async fn streak_reminder(
    State(state): State<AppState>,
    AppJson(request): AppJson<ReminderRequest>,
) -> Result<Response, AppError> {
    remind(&state, CohortRule::StreakReminder, request.user_id).await
}

/// 201 with the event, or 200 when the user was already reminded in the
/// rule's window.
async fn remind(state: &AppState, rule: CohortRule, user_id: Uuid) -> Result<Response, AppError> {
    match state.service.remind(rule, user_id).await? {
        Some(event) => Ok((StatusCode::CREATED, Json(event)).into_response()),
        None => Ok(Json(json!({
            "user_id": user_id,
            "rule": rule,
            "created": false,
        }))
        .into_response()),
    }
}
