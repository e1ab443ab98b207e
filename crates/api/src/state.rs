//! Shared application state for the Axum API server.

use std::sync::Arc;

use courier_broker::HealthCheck;
use courier_consumer::{ConsumerStatus, DeliveryStore};
use courier_engine::{NotificationService, OutboxPublisher};
use courier_store::EventStore;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub service: Arc<NotificationService>,
    pub publisher: Arc<OutboxPublisher>,
    pub deliveries: Arc<DeliveryStore>,
    pub consumer: ConsumerStatus,
    pub broker: Arc<dyn HealthCheck>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn EventStore>,
        service: Arc<NotificationService>,
        publisher: Arc<OutboxPublisher>,
        deliveries: Arc<DeliveryStore>,
        consumer: ConsumerStatus,
        broker: Arc<dyn HealthCheck>,
    ) -> Self {
        Self {
            store,
            service,
            publisher,
            deliveries,
            consumer,
            broker,
        }
    }
}
