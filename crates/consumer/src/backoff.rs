use std::time::Duration;

use courier_common::config::ConsumerConfig;
use courier_common::error::AppError;

/// Delay policy between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl Backoff {
    /// Delay before reconnect attempt number `failures` (1 after the first
    /// failure since the last successful connect).
    pub fn delay(&self, failures: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exponent = failures.saturating_sub(1).min(63) as i32;
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }

    pub fn from_config(config: &ConsumerConfig) -> Result<Self, AppError> {
        match config.backoff.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Backoff::Fixed(config.reconnect_delay)),
            "exponential" => Ok(Backoff::Exponential {
                initial: config.reconnect_delay,
                max: config.reconnect_max_delay.max(config.reconnect_delay),
                multiplier: 2.0,
            }),
            other => Err(AppError::Config(format!(
                "CONSUMER_BACKOFF must be 'fixed' or 'exponential', got '{}'",
                other
            ))),
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::from_secs(5))
    }
}
