//! Scheduler trigger loops.
//!
//! Each [`CohortRule`] gets its own [`TriggerLoop`] with its own interval.
//! Loops share nothing but the event store and the shutdown signal. The
//! dedupe key on every synthesized event keeps overlapping ticks from
//! creating the same notification twice.

pub mod rules;
pub mod trigger;

use std::sync::Arc;
use std::time::Duration;

use courier_common::config::SchedulerConfig;
use courier_common::types::CohortRule;
use courier_store::EventStore;

pub use trigger::{TickReport, TriggerLoop};

/// Configured interval for `rule`.
pub fn interval_for(rule: CohortRule, config: &SchedulerConfig) -> Duration {
    match rule {
        CohortRule::DailyReminder => config.daily_reminder_interval,
        CohortRule::StreakReminder => config.streak_reminder_interval,
        CohortRule::WeeklyRecap => config.weekly_recap_interval,
        CohortRule::InactivityNudge => config.inactivity_nudge_interval,
    }
}

/// One loop per rule whose interval is non-zero. A zero interval disables
/// that loop.
pub fn build_loops(
    config: &SchedulerConfig,
    store: Arc<dyn EventStore>,
    topic: &str,
) -> Vec<TriggerLoop> {
    CohortRule::ALL
        .iter()
        .filter_map(|&rule| {
            let interval = interval_for(rule, config);
            if interval.is_zero() {
                tracing::info!(rule = %rule, "Trigger loop disabled");
                return None;
            }
            Some(TriggerLoop::new(rule, interval, store.clone(), topic))
        })
        .collect()
}
