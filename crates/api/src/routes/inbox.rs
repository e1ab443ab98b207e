//! Live inbox served from the delivery store.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use crate::extract::AppPath;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/inbox/{recipient_id}", get(get_inbox))
}

/// GET /api/v1/inbox/:recipient_id: Messages consumed for a recipient, in
/// arrival order. An unknown recipient has an empty inbox.
async fn get_inbox(
    State(state): State<AppState>,
    AppPath(recipient_id): AppPath<Uuid>,
) -> Json<serde_json::Value> {
    let notifications = state.deliveries.get(recipient_id);
    Json(json!({
        "recipient_id": recipient_id,
        "count": notifications.len(),
        "notifications": notifications,
    }))
}
