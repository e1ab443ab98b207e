//! In-process event store with the same observable behavior as
//! [`PgEventStore`](crate::PgEventStore).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    Channel, CohortRule, Event, EventStatus, NewOutboxEntry, OutboxEntry, Recipient, Recorded,
    UserPreference,
};

use crate::EventStore;

#[derive(Debug, Clone)]
struct UserRecord {
    name: String,
    /// `(current_streak, last_activity_date)` of the practice streak.
    streak: Option<(i32, NaiveDate)>,
}

#[derive(Default)]
struct Inner {
    events: Vec<Event>,
    outbox: Vec<OutboxEntry>,
    next_outbox_id: i64,
    users: HashMap<Uuid, UserRecord>,
    preferences: Vec<UserPreference>,
}

impl Inner {
    fn dedupe_taken(&self, event: &Event) -> bool {
        match &event.dedupe_key {
            Some(key) => self
                .events
                .iter()
                .any(|e| e.dedupe_key.as_deref() == Some(key.as_str())),
            None => false,
        }
    }

    fn push_outbox(&mut self, entry: &NewOutboxEntry) -> OutboxEntry {
        self.next_outbox_id += 1;
        let row = OutboxEntry {
            id: self.next_outbox_id,
            event_id: entry.event_id,
            topic: entry.topic.clone(),
            payload: entry.payload.clone(),
            published: false,
            created_at: entry.created_at,
            published_at: None,
        };
        self.outbox.push(row.clone());
        row
    }

    fn in_app_enabled(&self, user_id: Uuid, rule: CohortRule) -> bool {
        let wanted = rule.notification_type();
        self.preferences.iter().any(|p| {
            p.user_id == user_id
                && p.notification_type == wanted
                && p.channel == Channel::InApp
                && p.enabled
        })
    }

    fn recently_notified(&self, user_id: Uuid, rule: CohortRule, since: DateTime<Utc>) -> bool {
        let wanted = rule.notification_type();
        self.events.iter().any(|e| {
            e.recipient_id == user_id && e.notification_type == wanted && e.created_at >= since
        })
    }
}

/// Event store kept in memory, for tests across the workspace.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user that cohort queries can match.
    pub fn add_user(&self, id: Uuid, name: impl Into<String>) {
        self.inner.lock().users.insert(
            id,
            UserRecord {
                name: name.into(),
                streak: None,
            },
        );
    }

    /// Set the practice streak of a registered user.
    pub fn set_streak(&self, id: Uuid, current_streak: i32, last_activity: NaiveDate) {
        if let Some(user) = self.inner.lock().users.get_mut(&id) {
            user.streak = Some((current_streak, last_activity));
        }
    }

    /// Make every call fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of all events in insertion order.
    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().events.clone()
    }

    /// Snapshot of all outbox rows in insertion order.
    pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.inner.lock().outbox.clone()
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn create_event(&self, event: &Event) -> Result<(), AppError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        if inner.dedupe_taken(event) {
            return Err(AppError::Validation(format!(
                "dedupe key already recorded: {}",
                event.dedupe_key.as_deref().unwrap_or_default()
            )));
        }
        inner.events.push(event.clone());
        Ok(())
    }

    async fn create_outbox_entry(&self, entry: &NewOutboxEntry) -> Result<OutboxEntry, AppError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        if !inner.events.iter().any(|e| e.id == entry.event_id) {
            return Err(AppError::NotFound(format!("event {}", entry.event_id)));
        }
        Ok(inner.push_outbox(entry))
    }

    async fn record(&self, event: &Event, topic: &str) -> Result<Recorded, AppError> {
        self.check_available()?;
        let new_entry = NewOutboxEntry::for_event(event, topic)?;

        let mut inner = self.inner.lock();
        if inner.dedupe_taken(event) {
            return Ok(Recorded::Duplicate);
        }
        inner.events.push(event.clone());
        Ok(Recorded::Created(inner.push_outbox(&new_entry)))
    }

    async fn fetch_unpublished_outbox(&self, limit: i64) -> Result<Vec<OutboxEntry>, AppError> {
        self.check_available()?;
        let inner = self.inner.lock();
        let mut pending: Vec<OutboxEntry> =
            inner.outbox.iter().filter(|e| !e.published).cloned().collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(pending)
    }

    async fn mark_outbox_published(&self, id: i64) -> Result<(), AppError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let now = Utc::now();

        let Some(entry) = inner.outbox.iter_mut().find(|e| e.id == id && !e.published) else {
            return Ok(());
        };
        entry.published = true;
        entry.published_at = Some(now);
        let event_id = entry.event_id;

        if let Some(event) = inner
            .events
            .iter_mut()
            .find(|e| e.id == event_id && e.status == EventStatus::Queued)
        {
            event.status = EventStatus::Sent;
            event.sent_at = Some(now);
        }
        Ok(())
    }

    async fn fetch_cohort(
        &self,
        rule: CohortRule,
        now: DateTime<Utc>,
    ) -> Result<Vec<Recipient>, AppError> {
        self.check_available()?;
        let inner = self.inner.lock();
        let since = rule.window_start(now);
        let cutoff = rule.activity_cutoff(now);

        let mut matched: Vec<Recipient> = inner
            .users
            .iter()
            .filter(|(id, _)| inner.in_app_enabled(**id, rule))
            .filter(|(id, _)| !inner.recently_notified(**id, rule, since))
            .filter(|(_, user)| match (rule, user.streak) {
                (CohortRule::DailyReminder, _) => true,
                (CohortRule::StreakReminder, Some((streak, last))) => streak > 0 && last < cutoff,
                (CohortRule::WeeklyRecap, Some((streak, _))) => streak > 0,
                (CohortRule::InactivityNudge, Some((_, last))) => last < cutoff,
                (_, None) => false,
            })
            .map(|(id, user)| Recipient {
                id: *id,
                name: user.name.clone(),
                current_streak: user.streak.map(|(s, _)| s).unwrap_or(0),
            })
            .collect();

        matched.sort_by_key(|r| r.id);
        Ok(matched)
    }

    async fn events_for_recipient(
        &self,
        recipient_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Event>, AppError> {
        self.check_available()?;
        let inner = self.inner.lock();
        let mut events: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| e.recipient_id == recipient_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let skip = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        let take = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(events.into_iter().skip(skip).take(take).collect())
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>, AppError> {
        self.check_available()?;
        Ok(self.inner.lock().events.iter().find(|e| e.id == id).cloned())
    }

    async fn mark_read(&self, id: Uuid) -> Result<bool, AppError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        match inner.events.iter_mut().find(|e| e.id == id) {
            Some(event) if event.status.can_advance_to(EventStatus::Read) => {
                event.status = EventStatus::Read;
                event.read_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recipient(&self, user_id: Uuid) -> Result<Option<Recipient>, AppError> {
        self.check_available()?;
        Ok(self.inner.lock().users.get(&user_id).map(|user| Recipient {
            id: user_id,
            name: user.name.clone(),
            current_streak: user.streak.map(|(s, _)| s).unwrap_or(0),
        }))
    }

    async fn preferences(&self, user_id: Uuid) -> Result<Vec<UserPreference>, AppError> {
        self.check_available()?;
        let inner = self.inner.lock();
        let mut prefs: Vec<UserPreference> = inner
            .preferences
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        prefs.sort_by_key(|p| (p.notification_type.to_string(), p.channel.to_string()));
        Ok(prefs)
    }

    async fn upsert_preference(&self, preference: &UserPreference) -> Result<(), AppError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        match inner.preferences.iter_mut().find(|p| {
            p.user_id == preference.user_id
                && p.notification_type == preference.notification_type
                && p.channel == preference.channel
        }) {
            Some(existing) => *existing = preference.clone(),
            None => inner.preferences.push(preference.clone()),
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), AppError> {
        self.check_available()
    }
}
