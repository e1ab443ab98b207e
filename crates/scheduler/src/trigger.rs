//! One periodic trigger loop per cohort rule.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};

use courier_common::error::AppError;
use courier_common::shutdown::Shutdown;
use courier_common::types::{CohortRule, Recorded};
use courier_store::EventStore;

use crate::rules;

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub matched: usize,
    pub created: usize,
    /// Recipients whose event for this period already existed.
    pub duplicates: usize,
    pub failed: usize,
}

pub struct TriggerLoop {
    rule: CohortRule,
    interval: Duration,
    store: Arc<dyn EventStore>,
    topic: String,
}

impl TriggerLoop {
    pub fn new(
        rule: CohortRule,
        interval: Duration,
        store: Arc<dyn EventStore>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            rule,
            interval,
            store,
            topic: topic.into(),
        }
    }

    pub fn rule(&self) -> CohortRule {
        self.rule
    }

    /// Tick every interval until shutdown, starting one interval after the
    /// call. A failed tick is logged and the next one runs on schedule.
    pub async fn run(&self, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            rule = %self.rule,
            interval_secs = self.interval.as_secs(),
            "Trigger loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if report.matched > 0 => {
                            tracing::info!(
                                rule = %self.rule,
                                matched = report.matched,
                                created = report.created,
                                duplicates = report.duplicates,
                                failed = report.failed,
                                "Trigger tick finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(rule = %self.rule, error = %e, "Trigger tick failed");
                        }
                    }
                }
            }
        }

        tracing::info!(rule = %self.rule, "Trigger loop stopped");
    }

    /// Query the cohort for `now` and record one event per recipient.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, AppError> {
        if !rules::runs_on(self.rule, now) {
            return Ok(TickReport::default());
        }

        let cohort = self.store.fetch_cohort(self.rule, now).await?;
        let mut report = TickReport {
            matched: cohort.len(),
            ..TickReport::default()
        };

        for recipient in &cohort {
            let event = rules::compose(self.rule, recipient, now);
            match self.store.record(&event, &self.topic).await {
                Ok(Recorded::Created(_)) => report.created += 1,
                Ok(Recorded::Duplicate) => report.duplicates += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        rule = %self.rule,
                        recipient_id = %recipient.id,
                        error = %e,
                        "Failed to record scheduled notification"
                    );
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use courier_common::shutdown::ShutdownController;
    use courier_common::types::{Channel, NotificationType, UserPreference};
    use courier_store::MemoryEventStore;
    use uuid::Uuid;

    async fn opted_in(store: &MemoryEventStore, kind: NotificationType) -> Uuid {
        let id = Uuid::new_v4();
        store.add_user(id, "Ada");
        store
            .upsert_preference(&UserPreference {
                user_id: id,
                notification_type: kind,
                channel: Channel::InApp,
                enabled: true,
                quiet_hours_start: None,
                quiet_hours_end: None,
                max_per_day: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        id
    }

    fn daily_loop(store: &Arc<MemoryEventStore>) -> TriggerLoop {
        TriggerLoop::new(
            CohortRule::DailyReminder,
            Duration::from_secs(300),
            store.clone(),
            "notifications",
        )
    }

    fn daily_count(store: &MemoryEventStore, user: Uuid) -> usize {
        store
            .events()
            .iter()
            .filter(|e| e.recipient_id == user && e.notification_type == NotificationType::DailyReminder)
            .count()
    }

    #[tokio::test]
    async fn test_daily_reminder_once_per_day() {
        let store = Arc::new(MemoryEventStore::new());
        let user = opted_in(&store, NotificationType::DailyReminder).await;
        let trigger = daily_loop(&store);

        let morning = "2026-10-21T08:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let noon = "2026-10-21T12:00:00Z".parse::<DateTime<Utc>>().unwrap();

        let first = trigger.tick(morning).await.unwrap();
        assert_eq!(first.created, 1);
        let second = trigger.tick(noon).await.unwrap();
        assert_eq!(second.created, 0);

        assert_eq!(daily_count(&store, user), 1);
        assert_eq!(store.outbox_entries().len(), 1);

        let next_day = "2026-10-22T08:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(trigger.tick(next_day).await.unwrap().created, 1);
        assert_eq!(daily_count(&store, user), 2);
    }

    #[tokio::test]
    async fn test_overlapping_ticks_do_not_double_create() {
        let store = Arc::new(MemoryEventStore::new());
        let user = opted_in(&store, NotificationType::DailyReminder).await;
        let a = daily_loop(&store);
        let b = daily_loop(&store);
        let now = "2026-10-21T08:00:00Z".parse::<DateTime<Utc>>().unwrap();

        let (ra, rb) = tokio::join!(a.tick(now), b.tick(now));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(ra.created + rb.created, 1);
        assert_eq!(daily_count(&store, user), 1);
    }

    #[tokio::test]
    async fn test_weekly_recap_skips_other_days() {
        let store = Arc::new(MemoryEventStore::new());
        let user = opted_in(&store, NotificationType::WeeklyRecap).await;
        store.set_streak(user, 5, NaiveDate::from_ymd_opt(2026, 10, 18).unwrap());
        let trigger = TriggerLoop::new(
            CohortRule::WeeklyRecap,
            Duration::from_secs(86_400),
            store.clone(),
            "notifications",
        );

        let tuesday = "2026-10-20T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(trigger.tick(tuesday).await.unwrap(), TickReport::default());

        let monday = "2026-10-26T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let report = trigger.tick(monday).await.unwrap();
        assert_eq!(report.created, 1);
        assert!(store.events()[0].message.contains("5-day streak"));
    }

    #[tokio::test]
    async fn test_query_failure_is_reported() {
        let store = Arc::new(MemoryEventStore::new());
        store.set_unavailable(true);
        let err = daily_loop(&store).tick(Utc::now()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryEventStore::new());
        let trigger = Arc::new(daily_loop(&store));
        let controller = ShutdownController::new();

        let task = {
            let trigger = trigger.clone();
            let shutdown = controller.subscribe();
            tokio::spawn(async move { trigger.run(shutdown).await })
        };

        controller.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
