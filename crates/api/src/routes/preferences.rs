//! Notification preference routes.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::UserPreference;
use courier_engine::PreferenceUpdate;

use crate::extract::{AppJson, AppPath};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/api/v1/preferences/{user_id}",
        get(get_preferences).put(update_preferences),
    )
}

/// GET /api/v1/preferences/:user_id
async fn get_preferences(
    State(state): State<AppState>,
    AppPath(user_id): AppPath<Uuid>,
) -> Result<Json<Vec<UserPreference>>, AppError> {
    let preferences = state.service.preferences(user_id).await?;
    Ok(Json(preferences))
}

/// PUT /api/v1/preferences/:user_id: Upsert rows and return the full set.
async fn update_preferences(
    State(state): State<AppState>,
    AppPath(user_id): AppPath<Uuid>,
    AppJson(updates): AppJson<Vec<PreferenceUpdate>>,
) -> Result<Json<Vec<UserPreference>>, AppError> {
    let preferences = state.service.update_preferences(user_id, updates).await?;
    Ok(Json(preferences))
}
