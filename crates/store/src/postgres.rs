//! PostgreSQL-backed event store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    CohortRule, Event, EventStatus, NewOutboxEntry, OutboxEntry, Recipient, Recorded,
    UserPreference,
};

use crate::EventStore;

const EVENT_COLUMNS: &str = r#"
    id, user_id AS recipient_id, type, channel, priority, title, message, metadata,
    dedupe_key, status, created_at, scheduled_for, sent_at, read_at
"#;

const OUTBOX_COLUMNS: &str = r#"
    id, notification_id AS event_id, topic, payload, published, created_at, published_at
"#;

/// Event store over the `notifications` / `outbox_notifications` tables.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert an event row. With `skip_duplicates`, a dedupe key conflict
    /// inserts nothing instead of failing. Returns the number of rows written.
    async fn insert_event<'e, E: PgExecutor<'e>>(
        executor: E,
        event: &Event,
        skip_duplicates: bool,
    ) -> Result<u64, sqlx::Error> {
        let conflict = if skip_duplicates {
            "ON CONFLICT (dedupe_key) DO NOTHING"
        } else {
            ""
        };
        let sql = format!(
            r#"
            INSERT INTO notifications (
                id, user_id, type, channel, priority, title, message,
                metadata, dedupe_key, scheduled_for, status, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            {}
            "#,
            conflict
        );

        let result = sqlx::query(&sql)
            .bind(event.id)
            .bind(event.recipient_id)
            .bind(event.notification_type.to_string())
            .bind(event.channel.to_string())
            .bind(event.priority.to_string())
            .bind(&event.title)
            .bind(&event.message)
            .bind(&event.metadata)
            .bind(&event.dedupe_key)
            .bind(event.scheduled_for)
            .bind(event.status.to_string())
            .bind(event.created_at)
            .execute(executor)
            .await?;

        Ok(result.rows_affected())
    }

    async fn insert_outbox<'e, E: PgExecutor<'e>>(
        executor: E,
        entry: &NewOutboxEntry,
    ) -> Result<OutboxEntry, sqlx::Error> {
        let sql = format!(
            r#"
            INSERT INTO outbox_notifications (notification_id, topic, payload, published, created_at)
            VALUES ($1, $2, $3, false, $4)
            RETURNING {}
            "#,
            OUTBOX_COLUMNS
        );

        sqlx::query_as::<_, OutboxEntry>(&sql)
            .bind(entry.event_id)
            .bind(&entry.topic)
            .bind(&entry.payload)
            .bind(entry.created_at)
            .fetch_one(executor)
            .await
    }

    /// Whether the rule's cohort SQL takes the activity cutoff as `$2`.
    fn uses_activity_cutoff(rule: CohortRule) -> bool {
        matches!(rule, CohortRule::StreakReminder | CohortRule::InactivityNudge)
    }

    /// Cohort SQL per rule. `$1` is the suppression window start; `$2`, when
    /// present, the activity cutoff date.
    fn cohort_query(rule: CohortRule) -> &'static str {
        match rule {
            CohortRule::DailyReminder => {
                r#"
                SELECT DISTINCT u.user_id AS id, u.name, COALESCE(ues.current_streak, 0) AS current_streak
                FROM users u
                JOIN user_notification_preferences unp ON u.user_id = unp.user_id
                LEFT JOIN user_engagement_streaks ues
                  ON ues.user_id = u.user_id AND ues.streak_type = 'practice'
                WHERE unp.type = 'daily_reminder'
                  AND unp.channel = 'in_app'
                  AND unp.enabled = true
                  AND NOT EXISTS (
                    SELECT 1 FROM notifications n
                    WHERE n.user_id = u.user_id
                      AND n.type = 'daily_reminder'
                      AND n.created_at >= $1
                  )
                "#
            }
            CohortRule::StreakReminder => {
                r#"
                SELECT DISTINCT u.user_id AS id, u.name, ues.current_streak
                FROM users u
                JOIN user_notification_preferences unp ON u.user_id = unp.user_id
                JOIN user_engagement_streaks ues ON u.user_id = ues.user_id
                WHERE unp.type = 'streak_reminder'
                  AND unp.channel = 'in_app'
                  AND unp.enabled = true
                  AND ues.streak_type = 'practice'
                  AND ues.current_streak > 0
                  AND ues.last_activity_date < $2
                  AND NOT EXISTS (
                    SELECT 1 FROM notifications n
                    WHERE n.user_id = u.user_id
                      AND n.type = 'streak_reminder'
                      AND n.created_at >= $1
                  )
                "#
            }
            CohortRule::WeeklyRecap => {
                r#"
                SELECT DISTINCT u.user_id AS id, u.name, ues.current_streak
                FROM users u
                JOIN user_notification_preferences unp ON u.user_id = unp.user_id
                JOIN user_engagement_streaks ues ON u.user_id = ues.user_id
                WHERE unp.type = 'weekly_recap'
                  AND unp.channel = 'in_app'
                  AND unp.enabled = true
                  AND ues.streak_type = 'practice'
                  AND ues.current_streak > 0
                  AND NOT EXISTS (
                    SELECT 1 FROM notifications n
                    WHERE n.user_id = u.user_id
                      AND n.type = 'weekly_recap'
                      AND n.created_at >= $1
                  )
                "#
            }
            CohortRule::InactivityNudge => {
                r#"
                SELECT DISTINCT u.user_id AS id, u.name, ues.current_streak
                FROM users u
                JOIN user_notification_preferences unp ON u.user_id = unp.user_id
                JOIN user_engagement_streaks ues ON u.user_id = ues.user_id
                WHERE unp.type = 'we_miss_you'
                  AND unp.channel = 'in_app'
                  AND unp.enabled = true
                  AND ues.streak_type = 'practice'
                  AND ues.last_activity_date < $2
                  AND NOT EXISTS (
                    SELECT 1 FROM notifications n
                    WHERE n.user_id = u.user_id
                      AND n.type = 'we_miss_you'
                      AND n.created_at >= $1
                  )
                "#
            }
        }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn create_event(&self, event: &Event) -> Result<(), AppError> {
        Self::insert_event(&self.pool, event, false).await?;
        Ok(())
    }

    async fn create_outbox_entry(&self, entry: &NewOutboxEntry) -> Result<OutboxEntry, AppError> {
        Ok(Self::insert_outbox(&self.pool, entry).await?)
    }

    async fn record(&self, event: &Event, topic: &str) -> Result<Recorded, AppError> {
        let new_entry = NewOutboxEntry::for_event(event, topic)?;

        let mut tx = self.pool.begin().await?;

        let inserted = Self::insert_event(&mut *tx, event, true).await?;
        if inserted == 0 {
            tx.rollback().await?;
            tracing::debug!(
                event_id = %event.id,
                dedupe_key = ?event.dedupe_key,
                "Event skipped, dedupe key already recorded"
            );
            return Ok(Recorded::Duplicate);
        }

        let entry = Self::insert_outbox(&mut *tx, &new_entry).await?;
        tx.commit().await?;

        Ok(Recorded::Created(entry))
    }

    async fn fetch_unpublished_outbox(&self, limit: i64) -> Result<Vec<OutboxEntry>, AppError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM outbox_notifications
            WHERE published = false
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
            OUTBOX_COLUMNS
        );

        let entries = sqlx::query_as::<_, OutboxEntry>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(entries)
    }

    async fn mark_outbox_published(&self, id: i64) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let owner: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE outbox_notifications
            SET published = true, published_at = NOW()
            WHERE id = $1 AND published = false
            RETURNING notification_id
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((event_id,)) = owner {
            sqlx::query(
                r#"
                UPDATE notifications
                SET status = $1, sent_at = NOW(), updated_at = NOW()
                WHERE id = $2 AND status = $3
                "#,
            )
            .bind(EventStatus::Sent.to_string())
            .bind(event_id)
            .bind(EventStatus::Queued.to_string())
            .execute(&mut *tx)
            .await?;
        } else {
            tracing::debug!(outbox_id = id, "Outbox entry already published");
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fetch_cohort(
        &self,
        rule: CohortRule,
        now: DateTime<Utc>,
    ) -> Result<Vec<Recipient>, AppError> {
        let mut query =
            sqlx::query_as::<_, Recipient>(Self::cohort_query(rule)).bind(rule.window_start(now));
        if Self::uses_activity_cutoff(rule) {
            query = query.bind(rule.activity_cutoff(now));
        }
        let recipients = query.fetch_all(&self.pool).await?;

        Ok(recipients)
    }

    async fn events_for_recipient(
        &self,
        recipient_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Event>, AppError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM notifications
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
            EVENT_COLUMNS
        );

        let events = sqlx::query_as::<_, Event>(&sql)
            .bind(recipient_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(events)
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>, AppError> {
        let sql = format!("SELECT {} FROM notifications WHERE id = $1", EVENT_COLUMNS);

        let event = sqlx::query_as::<_, Event>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(event)
    }

    async fn mark_read(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'read', read_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'sent', 'delivered')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn recipient(&self, user_id: Uuid) -> Result<Option<Recipient>, AppError> {
        let recipient = sqlx::query_as::<_, Recipient>(
            r#"
            SELECT u.user_id AS id, u.name, COALESCE(ues.current_streak, 0) AS current_streak
            FROM users u
            LEFT JOIN user_engagement_streaks ues
              ON ues.user_id = u.user_id AND ues.streak_type = 'practice'
            WHERE u.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(recipient)
    }

    async fn preferences(&self, user_id: Uuid) -> Result<Vec<UserPreference>, AppError> {
        let prefs = sqlx::query_as::<_, UserPreference>(
            r#"
            SELECT user_id, type, channel, enabled, quiet_hours_start, quiet_hours_end,
                   max_per_day, updated_at
            FROM user_notification_preferences
            WHERE user_id = $1
            ORDER BY type, channel
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(prefs)
    }

    async fn upsert_preference(&self, preference: &UserPreference) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO user_notification_preferences (
                user_id, type, channel, enabled, quiet_hours_start, quiet_hours_end,
                max_per_day, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id, type, channel)
            DO UPDATE SET
                enabled = EXCLUDED.enabled,
                quiet_hours_start = EXCLUDED.quiet_hours_start,
                quiet_hours_end = EXCLUDED.quiet_hours_end,
                max_per_day = EXCLUDED.max_per_day,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(preference.user_id)
        .bind(preference.notification_type.to_string())
        .bind(preference.channel.to_string())
        .bind(preference.enabled)
        .bind(&preference.quiet_hours_start)
        .bind(&preference.quiet_hours_end)
        .bind(preference.max_per_day)
        .bind(preference.updated_at)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %preference.user_id,
            notification_type = %preference.notification_type,
            channel = %preference.channel,
            enabled = preference.enabled,
            "Preference updated"
        );

        Ok(())
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cohort_binds_match_placeholders() {
        for rule in CohortRule::ALL {
            let sql = PgEventStore::cohort_query(rule);
            assert!(sql.contains("$1"), "{} has no window bind", rule);
            assert_eq!(
                sql.contains("$2"),
                PgEventStore::uses_activity_cutoff(rule),
                "{} binds do not match its SQL",
                rule
            );
        }
    }
}
