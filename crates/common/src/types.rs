use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of notification the system knows how to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum NotificationType {
    DailyReminder,
    StreakReminder,
    LastChanceAlert,
    AchievementUnlock,
    XpGoalReminder,
    LeagueUpdate,
    WeMissYou,
    EventNotification,
    NewCourse,
    PracticeNeeded,
    WeeklyRecap,
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::DailyReminder => write!(f, "daily_reminder"),
            NotificationType::StreakReminder => write!(f, "streak_reminder"),
            NotificationType::LastChanceAlert => write!(f, "last_chance_alert"),
            NotificationType::AchievementUnlock => write!(f, "achievement_unlock"),
            NotificationType::XpGoalReminder => write!(f, "xp_goal_reminder"),
            NotificationType::LeagueUpdate => write!(f, "league_update"),
            NotificationType::WeMissYou => write!(f, "we_miss_you"),
            NotificationType::EventNotification => write!(f, "event_notification"),
            NotificationType::NewCourse => write!(f, "new_course"),
            NotificationType::PracticeNeeded => write!(f, "practice_needed"),
            NotificationType::WeeklyRecap => write!(f, "weekly_recap"),
        }
    }
}

/// Delivery channel of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Push,
    Email,
    Sms,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::InApp => write!(f, "in_app"),
            Channel::Push => write!(f, "push"),
            Channel::Email => write!(f, "email"),
            Channel::Sms => write!(f, "sms"),
        }
    }
}

/// Notification priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

/// Lifecycle status of an event.
///
/// Transitions only move forward (`queued < sent < delivered < read`);
/// `failed` and `suppressed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum EventStatus {
    Queued,
    Sent,
    Delivered,
    Failed,
    Suppressed,
    Read,
}

impl EventStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventStatus::Failed | EventStatus::Suppressed | EventStatus::Read
        )
    }

    fn rank(self) -> u8 {
        match self {
            EventStatus::Queued => 0,
            EventStatus::Sent => 1,
            EventStatus::Delivered => 2,
            EventStatus::Failed | EventStatus::Suppressed => 3,
            EventStatus::Read => 4,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_advance_to(self, next: EventStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            // Only a live (non-terminal) event can be read.
            EventStatus::Read => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventStatus::Queued => write!(f, "queued"),
            EventStatus::Sent => write!(f, "sent"),
            EventStatus::Delivered => write!(f, "delivered"),
            EventStatus::Failed => write!(f, "failed"),
            EventStatus::Suppressed => write!(f, "suppressed"),
            EventStatus::Read => write!(f, "read"),
        }
    }
}

/// A durable "a notification should be created" intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub id: Uuid,
    pub recipient_id: Uuid,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub notification_type: NotificationType,
    pub channel: Channel,
    pub priority: Priority,
    pub title: Option<String>,
    pub message: String,
    pub metadata: serde_json::Value,
    /// Uniqueness guard for synthesized events, e.g. `daily_reminder:<user>:2026-10-19`.
    pub dedupe_key: Option<String>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Build a new queued event.
    pub fn new(
        recipient_id: Uuid,
        notification_type: NotificationType,
        channel: Channel,
        priority: Priority,
        title: Option<String>,
        message: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient_id,
            notification_type,
            channel,
            priority,
            title,
            message,
            metadata: serde_json::json!({}),
            dedupe_key: None,
            status: EventStatus::Queued,
            created_at: Utc::now(),
            scheduled_for: None,
            sent_at: None,
            read_at: None,
        }
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_scheduled_for(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.scheduled_for = at;
        self
    }

    /// The broker message for this event.
    pub fn to_message(&self) -> NotificationMessage {
        NotificationMessage {
            id: self.id,
            recipient_id: self.recipient_id,
            notification_type: self.notification_type,
            channel: self.channel,
            priority: self.priority,
            title: self.title.clone(),
            message: self.message.clone(),
            created_at: self.created_at,
        }
    }
}

/// Wire format carried as the broker message value.
///
/// The message key is `recipient_id` rendered as a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: Uuid,
    pub recipient_id: Uuid,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub channel: Channel,
    pub priority: Priority,
    pub title: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Outbox shadow row owning a reference to exactly one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEntry {
    pub id: i64,
    pub event_id: Uuid,
    pub topic: String,
    /// Snapshot of the wire message taken when the event was written.
    pub payload: serde_json::Value,
    pub published: bool,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Partition key for the broker: the recipient id from the payload snapshot.
    pub fn partition_key(&self) -> Option<&str> {
        self.payload.get("recipient_id").and_then(|v| v.as_str())
    }
}

/// An outbox row that has not been inserted yet.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub event_id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl NewOutboxEntry {
    /// Snapshot `event` into an outbox row for `topic`.
    pub fn for_event(event: &Event, topic: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: event.id,
            topic: topic.to_string(),
            payload: serde_json::to_value(event.to_message())?,
            created_at: Utc::now(),
        })
    }
}

/// Outcome of writing an event together with its outbox row.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Created(OutboxEntry),
    /// Another event already holds the same dedupe key; nothing was written.
    Duplicate,
}

/// A user's preference for one notification type on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserPreference {
    pub user_id: Uuid,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub notification_type: NotificationType,
    pub channel: Channel,
    pub enabled: bool,
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub max_per_day: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

/// Cohort queries driven by the scheduler, one per trigger loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortRule {
    DailyReminder,
    StreakReminder,
    WeeklyRecap,
    InactivityNudge,
}

impl CohortRule {
    pub const ALL: [CohortRule; 4] = [
        CohortRule::DailyReminder,
        CohortRule::StreakReminder,
        CohortRule::WeeklyRecap,
        CohortRule::InactivityNudge,
    ];

    /// Type of the event synthesized for each matched recipient.
    pub fn notification_type(self) -> NotificationType {
        match self {
            CohortRule::DailyReminder => NotificationType::DailyReminder,
            CohortRule::StreakReminder => NotificationType::StreakReminder,
            CohortRule::WeeklyRecap => NotificationType::WeeklyRecap,
            CohortRule::InactivityNudge => NotificationType::WeMissYou,
        }
    }
}

impl CohortRule {
    /// Start of the window in which a previous event of the same type
    /// suppresses a new one: midnight UTC for the daily rules, Monday 00:00
    /// UTC for the weekly recap, a rolling seven days for the nudge.
    pub fn window_start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        match self {
            CohortRule::DailyReminder | CohortRule::StreakReminder => midnight(today),
            CohortRule::WeeklyRecap => {
                let back = i64::from(today.weekday().num_days_from_monday());
                midnight(today - Duration::days(back))
            }
            CohortRule::InactivityNudge => now - Duration::days(7),
        }
    }

    /// Last activity date before which a recipient qualifies, where the rule
    /// looks at activity at all.
    pub fn activity_cutoff(self, now: DateTime<Utc>) -> NaiveDate {
        let today = now.date_naive();
        match self {
            CohortRule::InactivityNudge => today - Duration::days(7),
            _ => today,
        }
    }

    /// Period component of the dedupe key.
    pub fn period_label(self, now: DateTime<Utc>) -> String {
        match self {
            CohortRule::DailyReminder | CohortRule::StreakReminder => {
                now.date_naive().format("%Y-%m-%d").to_string()
            }
            CohortRule::WeeklyRecap | CohortRule::InactivityNudge => {
                let week = now.date_naive().iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
        }
    }

    /// Uniqueness key of the event synthesized for `recipient` at `now`.
    pub fn dedupe_key(self, recipient: Uuid, now: DateTime<Utc>) -> String {
        format!(
            "{}:{}:{}",
            self.notification_type(),
            recipient,
            self.period_label(now)
        )
    }
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

impl std::fmt::Display for CohortRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CohortRule::DailyReminder => write!(f, "daily_reminder"),
            CohortRule::StreakReminder => write!(f, "streak_reminder"),
            CohortRule::WeeklyRecap => write!(f, "weekly_recap"),
            CohortRule::InactivityNudge => write!(f, "inactivity_nudge"),
        }
    }
}

/// A recipient matched by a cohort query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recipient {
    pub id: Uuid,
    pub name: String,
    /// Current practice streak, 0 when the user has none.
    pub current_streak: i32,
}
