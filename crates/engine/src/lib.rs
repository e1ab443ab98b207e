//! Outbox publisher and the notification service built on the event store.

pub mod outbox;
pub mod service;

pub use outbox::{BatchReport, OutboxPublisher};
pub use service::{CreateNotificationParams, NotificationService, PreferenceUpdate};
