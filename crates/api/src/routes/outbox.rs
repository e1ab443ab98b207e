use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use courier_common::error::AppError;
use courier_engine::BatchReport;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/outbox/process", post(process_outbox))
}

/// POST /api/v1/outbox/process: Run one publisher batch now.
async fn process_outbox(State(state): State<AppState>) -> Result<Json<BatchReport>, AppError> {
    let report = state.publisher.process_batch().await?;
    Ok(Json(report))
}
