pub mod events;
pub mod health;
pub mod inbox;
pub mod notifications;
pub mod outbox;
pub mod preferences;
pub mod reminders;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(notifications::router())
        .merge(inbox::router())
        .merge(preferences::router())
        .merge(outbox::router())
        .merge(reminders::router())
        .merge(events::router())
        .with_state(state)
}
