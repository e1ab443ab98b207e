//! Health check endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// GET /health: database ping, broker health check and consumer state.
///
/// Answers 503 with `"status": "degraded"` when the database or the broker
/// is unreachable. The consumer state is informational only.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let (database, broker) = tokio::join!(state.store.ping(), state.broker.health_check());

    let (database_ok, database) = component("Database", database);
    let (broker_ok, broker) = component("Broker", broker);

    let status = if database_ok && broker_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "ok" } else { "degraded" },
            "service": "courier",
            "version": env!("CARGO_PKG_VERSION"),
            "database": database,
            "broker": broker,
            "consumer": state.consumer.snapshot(),
        })),
    )
}

fn component<E: std::fmt::Display>(name: &str, result: Result<(), E>) -> (bool, serde_json::Value) {
    match result {
        Ok(()) => (true, json!({ "status": "ok" })),
        Err(e) => {
            tracing::warn!(component = name, error = %e, "Health check failed");
            (false, json!({ "status": "error", "error": e.to_string() }))
        }
    }
}
