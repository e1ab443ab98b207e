//! Notification service: the write and read paths used by the HTTP layer.

use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    Channel, CohortRule, Event, EventStatus, NotificationType, Priority, Recorded,
    UserPreference,
};
use courier_scheduler::rules;
use courier_store::{DEFAULT_HISTORY_LIMIT, EventStore};

use crate::outbox::OutboxPublisher;

/// Largest page a history query may request.
pub const MAX_HISTORY_LIMIT: i64 = 500;

/// Parameters for creating a notification.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateNotificationParams {
    #[serde(alias = "recipient_id")]
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    #[serde(default = "default_channel")]
    pub channel: Channel,
    #[serde(default)]
    pub priority: Priority,
    pub title: Option<String>,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

fn default_channel() -> Channel {
    Channel::InApp
}

/// One preference row in an update request.
#[derive(Debug, Clone, Deserialize)]
pub struct PreferenceUpdate {
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub channel: Channel,
    pub enabled: bool,
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub max_per_day: Option<i32>,
}

pub struct NotificationService {
    store: Arc<dyn EventStore>,
    publisher: Arc<OutboxPublisher>,
    topic: String,
    immediate_publish: bool,
}

impl NotificationService {
    pub fn new(
        store: Arc<dyn EventStore>,
        publisher: Arc<OutboxPublisher>,
        topic: impl Into<String>,
        immediate_publish: bool,
    ) -> Self {
        Self {
            store,
            publisher,
            topic: topic.into(),
            immediate_publish,
        }
    }

    /// Record a new notification and its outbox row.
    ///
    /// With immediate publish enabled a publisher batch runs before
    /// returning; its outcome does not affect the result.
    pub async fn create(&self, params: CreateNotificationParams) -> Result<Event, AppError> {
        if params.message.trim().is_empty() {
            return Err(AppError::Validation("message must not be empty".into()));
        }

        let event = Event::new(
            params.user_id,
            params.notification_type,
            params.channel,
            params.priority,
            params.title,
            params.message,
        )
        .with_metadata(params.metadata.unwrap_or_else(|| serde_json::json!({})))
        .with_scheduled_for(params.scheduled_for);

        match self.store.record(&event, &self.topic).await? {
            Recorded::Created(entry) => {
                tracing::info!(
                    event_id = %event.id,
                    recipient_id = %event.recipient_id,
                    notification_type = %event.notification_type,
                    outbox_id = entry.id,
                    "Notification created"
                );
            }
            Recorded::Duplicate => {
                return Err(AppError::Validation(format!(
                    "notification {} already exists",
                    event.id
                )));
            }
        }

        self.publish_now().await;
        Ok(event)
    }

    /// Create `rule`'s notification for one user outside the scheduler.
    ///
    /// Shares the rule's dedupe key, so a user already reminded in the
    /// current window gets `None` back instead of a second event.
    pub async fn remind(&self, rule: CohortRule, user_id: Uuid) -> Result<Option<Event>, AppError> {
        let recipient = self
            .store
            .recipient(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;

        if rule == CohortRule::StreakReminder && recipient.current_streak <= 0 {
            return Err(AppError::Validation("user has no active streak".into()));
        }

        let event = rules::compose(rule, &recipient, Utc::now());
        match self.store.record(&event, &self.topic).await? {
            Recorded::Created(entry) => {
                tracing::info!(
                    event_id = %event.id,
                    recipient_id = %user_id,
                    rule = %rule,
                    outbox_id = entry.id,
                    "Reminder created"
                );
            }
            Recorded::Duplicate => {
                tracing::debug!(recipient_id = %user_id, rule = %rule, "Reminder already sent");
                return Ok(None);
            }
        }

        self.publish_now().await;
        Ok(Some(event))
    }

    /// Achievement notification for a finished practice session.
    pub async fn practice_completed(
        &self,
        user_id: Uuid,
        points: Option<i32>,
    ) -> Result<Event, AppError> {
        let mut message =
            String::from("Great job on completing your practice session. Keep it up!");
        if let Some(points) = points {
            if points < 0 {
                return Err(AppError::Validation("points must not be negative".into()));
            }
            message.push_str(&format!(" You earned {} XP.", points));
        }

        self.create(CreateNotificationParams {
            user_id,
            notification_type: NotificationType::AchievementUnlock,
            channel: Channel::InApp,
            priority: Priority::Medium,
            title: Some("Practice Completed!".into()),
            message,
            metadata: Some(serde_json::json!({
                "event": "practice_completed",
                "points": points,
            })),
            scheduled_for: None,
        })
        .await
    }

    /// Run one publisher batch when immediate publish is on. Failures leave
    /// the rows for the next tick.
    async fn publish_now(&self) {
        if !self.immediate_publish {
            return;
        }
        match self.publisher.process_batch().await {
            Ok(report) if !report.is_complete() => {
                tracing::warn!(
                    stopped_at = ?report.stopped_at,
                    "Immediate publish incomplete, left for the next tick"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Immediate publish failed, left for the next tick");
            }
        }
    }

    /// Durable history for a recipient, newest first.
    pub async fn history(
        &self,
        recipient_id: Uuid,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Event>, AppError> {
        let limit = match limit {
            Some(l) if l > 0 => l.min(MAX_HISTORY_LIMIT),
            _ => DEFAULT_HISTORY_LIMIT,
        };
        let offset = offset.unwrap_or(0).max(0);

        self.store
            .events_for_recipient(recipient_id, limit, offset)
            .await
    }

    /// Mark a notification read. Marking an already-read notification again
    /// succeeds.
    pub async fn mark_read(&self, id: Uuid) -> Result<(), AppError> {
        if self.store.mark_read(id).await? {
            tracing::debug!(event_id = %id, "Notification marked read");
            return Ok(());
        }

        match self.store.get_event(id).await? {
            None => Err(AppError::NotFound(format!("Notification {} not found", id))),
            Some(event) if event.status == EventStatus::Read => Ok(()),
            Some(event) => Err(AppError::Validation(format!(
                "Notification {} is {} and cannot be marked read",
                id, event.status
            ))),
        }
    }

    pub async fn preferences(&self, user_id: Uuid) -> Result<Vec<UserPreference>, AppError> {
        self.store.preferences(user_id).await
    }

    /// Apply preference updates and return the user's full preference set.
    pub async fn update_preferences(
        &self,
        user_id: Uuid,
        updates: Vec<PreferenceUpdate>,
    ) -> Result<Vec<UserPreference>, AppError> {
        for update in &updates {
            validate_quiet_hours(update)?;
            if matches!(update.max_per_day, Some(n) if n < 0) {
                return Err(AppError::Validation(
                    "max_per_day must not be negative".into(),
                ));
            }
        }

        let now = Utc::now();
        for update in updates {
            let preference = UserPreference {
                user_id,
                notification_type: update.notification_type,
                channel: update.channel,
                enabled: update.enabled,
                quiet_hours_start: update.quiet_hours_start,
                quiet_hours_end: update.quiet_hours_end,
                max_per_day: update.max_per_day,
                updated_at: now,
            };
            self.store.upsert_preference(&preference).await?;
        }

        self.store.preferences(user_id).await
    }
}

/// Quiet hours are `HH:MM`; both ends or neither.
fn validate_quiet_hours(update: &PreferenceUpdate) -> Result<(), AppError> {
    match (&update.quiet_hours_start, &update.quiet_hours_end) {
        (None, None) => Ok(()),
        (Some(start), Some(end)) => {
            for value in [start, end] {
                NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| {
                    AppError::Validation(format!("invalid quiet hours time '{}'", value))
                })?;
            }
            Ok(())
        }
        _ => Err(AppError::Validation(
            "quiet_hours_start and quiet_hours_end must be set together".into(),
        )),
    }
}
