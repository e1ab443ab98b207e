//! Event store: the durable record of notification intents and their outbox rows.
//!
//! Everything downstream (publisher, scheduler, read path) talks to the store
//! through the [`EventStore`] trait:
//!
//! - [`postgres::PgEventStore`] is the production implementation
//! - [`memory::MemoryEventStore`] backs tests
//!
//! Statements are row-scoped; no task takes a lock that spans rows, so the
//! publisher, the scheduler loops and the HTTP path can share one store.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    CohortRule, Event, NewOutboxEntry, OutboxEntry, Recipient, Recorded, UserPreference,
};

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

/// Default page size for recipient history queries.
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert an event. Fails if its dedupe key is already taken.
    async fn create_event(&self, event: &Event) -> Result<(), AppError>;

    /// Insert an outbox row for an existing event.
    async fn create_outbox_entry(&self, entry: &NewOutboxEntry) -> Result<OutboxEntry, AppError>;

    /// Insert an event and its outbox row in one logical write.
    ///
    /// Returns [`Recorded::Duplicate`] without writing anything when the
    /// event's dedupe key already exists.
    async fn record(&self, event: &Event, topic: &str) -> Result<Recorded, AppError>;

    /// Up to `limit` unpublished outbox rows, oldest first.
    async fn fetch_unpublished_outbox(&self, limit: i64) -> Result<Vec<OutboxEntry>, AppError>;

    /// Flag an outbox row as published and move its event from `queued` to
    /// `sent`. Already-published rows are left untouched.
    async fn mark_outbox_published(&self, id: i64) -> Result<(), AppError>;

    /// Recipients matching a scheduler rule at `now`.
    async fn fetch_cohort(
        &self,
        rule: CohortRule,
        now: DateTime<Utc>,
    ) -> Result<Vec<Recipient>, AppError>;

    /// Durable history for a recipient, newest first.
    async fn events_for_recipient(
        &self,
        recipient_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Event>, AppError>;

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>, AppError>;

    /// Set an event to `read`. Returns false when the event does not exist or
    /// is already in a terminal status.
    async fn mark_read(&self, id: Uuid) -> Result<bool, AppError>;

    /// A single user with their practice streak (0 when they have none).
    async fn recipient(&self, user_id: Uuid) -> Result<Option<Recipient>, AppError>;

    async fn preferences(&self, user_id: Uuid) -> Result<Vec<UserPreference>, AppError>;

    async fn upsert_preference(&self, preference: &UserPreference) -> Result<(), AppError>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), AppError>;
}
