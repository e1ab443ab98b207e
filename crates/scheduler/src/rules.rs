//! Event composition for each cohort rule.

use chrono::{DateTime, Datelike, Utc, Weekday};

use courier_common::types::{Channel, CohortRule, Event, Priority, Recipient};

/// Whether `rule` produces anything at `now`. The weekly recap only goes out
/// on Mondays.
pub fn runs_on(rule: CohortRule, now: DateTime<Utc>) -> bool {
    match rule {
        CohortRule::WeeklyRecap => now.weekday() == Weekday::Mon,
        _ => true,
    }
}

pub fn priority(rule: CohortRule) -> Priority {
    match rule {
        CohortRule::DailyReminder => Priority::Medium,
        CohortRule::StreakReminder => Priority::High,
        CohortRule::WeeklyRecap | CohortRule::InactivityNudge => Priority::Low,
    }
}

/// Title and message shown to the recipient.
pub fn copy(rule: CohortRule, recipient: &Recipient) -> (&'static str, String) {
    let name = &recipient.name;
    let streak = recipient.current_streak;
    match rule {
        CohortRule::DailyReminder => (
            "Time to Practice!",
            format!(
                "Hey {}! It's time for your daily practice session. Keep your {}-day streak alive! 🔥",
                name, streak
            ),
        ),
        CohortRule::StreakReminder => (
            "Don't Break Your Streak!",
            format!(
                "{}, you haven't practiced today! Your {}-day streak is at risk. Practice now to keep it going!",
                name, streak
            ),
        ),
        CohortRule::WeeklyRecap => (
            "Your Weekly Progress Report",
            format!(
                "Great week {}! You maintained your {}-day streak! Keep up the amazing work! 🎉",
                name, streak
            ),
        ),
        CohortRule::InactivityNudge => (
            "We Miss You!",
            format!(
                "Hey {}! It's been a while since your last practice. Your skills are getting rusty! Come back and practice! 💪",
                name
            ),
        ),
    }
}

/// The event synthesized for `recipient` when `rule` fires at `now`.
pub fn compose(rule: CohortRule, recipient: &Recipient, now: DateTime<Utc>) -> Event {
    let (title, message) = copy(rule, recipient);

    let mut event = Event::new(
        recipient.id,
        rule.notification_type(),
        Channel::InApp,
        priority(rule),
        Some(title.to_string()),
        message,
    )
    .with_dedupe_key(rule.dedupe_key(recipient.id, now))
    .with_metadata(serde_json::json!({
        "rule": rule,
        "current_streak": recipient.current_streak,
    }));
    event.created_at = now;
    event
}
