use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string, used as the message broker
    pub redis_url: String,

    /// HTTP listen port (default: 8082)
    pub http_port: u16,

    /// `json` or `pretty` log output (default: json)
    pub log_format: String,

    pub broker: BrokerConfig,
    pub outbox: OutboxConfig,
    pub consumer: ConsumerConfig,
    pub scheduler: SchedulerConfig,
}

/// Required acknowledgement level for a produced message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Take the append reply as final; sends are never retried.
    None,
    /// The primary accepted the append.
    Leader,
    /// The primary and `min_insync_replicas` replicas accepted the append.
    All,
}

impl FromStr for Acks {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(Acks::None),
            "leader" | "1" => Ok(Acks::Leader),
            "all" | "-1" => Ok(Acks::All),
            other => Err(format!("unknown acks level '{}'", other)),
        }
    }
}

/// Message value compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Lz4,
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            other => Err(format!("unknown compression codec '{}'", other)),
        }
    }
}

/// Where a brand new consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl FromStr for OffsetReset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" | "oldest" => Ok(OffsetReset::Earliest),
            "latest" | "newest" => Ok(OffsetReset::Latest),
            other => Err(format!("unknown offset reset policy '{}'", other)),
        }
    }
}

/// Broker topology plus producer and consumer-group settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Topic name; each partition is a stream named `{topic}:{partition}`
    pub topic: String,
    /// Number of partitions of the topic (default: 8)
    pub partitions: u32,

    // Producer
    pub acks: Acks,
    /// Replicas that must confirm a write when `acks = all` (default: 0)
    pub min_insync_replicas: u32,
    /// Retries on transport errors before a send fails (default: 3)
    pub retry_max: u32,
    pub retry_backoff: Duration,
    /// Upper bound for one send including replica acknowledgement (default: 10s)
    pub producer_timeout: Duration,
    pub idempotent: bool,
    pub compression: Compression,
    /// Approximate stream length cap (default: 100000)
    pub max_stream_len: usize,

    // Consumer group
    pub consumer_group: String,
    /// Stable member name; pending entries are re-read under this name after a reconnect
    pub consumer_name: String,
    pub member_index: u32,
    pub member_count: u32,
    pub offset_reset: OffsetReset,
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub auto_commit_interval: Duration,
    /// Maximum entries claimed per poll (default: 100)
    pub poll_batch_size: usize,
}

/// Outbox publisher settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    pub interval: Duration,
    pub batch_size: i64,
    /// Publish right after a create call instead of waiting for the next tick
    pub immediate_publish: bool,
}

/// Consumer runtime settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    pub enabled: bool,
    /// `fixed` or `exponential`
    pub backoff: String,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Messages kept per recipient in the delivery store (default: 200)
    pub retention_per_recipient: usize,
}

/// Scheduler trigger loop settings. A zero interval disables that rule's loop.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub daily_reminder_interval: Duration,
    pub streak_reminder_interval: Duration,
    pub weekly_recap_interval: Duration,
    pub inactivity_nudge_interval: Duration,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20)?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            http_port: env_or("HTTP_PORT", 8082)?,
            log_format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()),
            broker: BrokerConfig::from_env()?,
            outbox: OutboxConfig::from_env()?,
            consumer: ConsumerConfig {
                enabled: env_or("CONSUMER_ENABLED", true)?,
                backoff: std::env::var("CONSUMER_BACKOFF").unwrap_or_else(|_| "fixed".to_string()),
                reconnect_delay: Duration::from_millis(env_or("CONSUMER_RECONNECT_DELAY_MS", 5000)?),
                reconnect_max_delay: Duration::from_millis(env_or(
                    "CONSUMER_RECONNECT_MAX_DELAY_MS",
                    60_000,
                )?),
                retention_per_recipient: env_or("DELIVERY_RETENTION_PER_RECIPIENT", 200)?,
            },
            scheduler: SchedulerConfig {
                enabled: env_or("SCHEDULER_ENABLED", true)?,
                daily_reminder_interval: Duration::from_secs(env_or(
                    "SCHEDULER_DAILY_REMINDER_SECS",
                    300,
                )?),
                streak_reminder_interval: Duration::from_secs(env_or(
                    "SCHEDULER_STREAK_REMINDER_SECS",
                    300,
                )?),
                weekly_recap_interval: Duration::from_secs(env_or(
                    "SCHEDULER_WEEKLY_RECAP_SECS",
                    86_400,
                )?),
                inactivity_nudge_interval: Duration::from_secs(env_or(
                    "SCHEDULER_INACTIVITY_NUDGE_SECS",
                    21_600,
                )?),
            },
        })
    }
}

impl BrokerConfig {
    fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            topic: std::env::var("BROKER_TOPIC").unwrap_or_else(|_| "notifications".to_string()),
            partitions: env_or("BROKER_PARTITIONS", 8)?,
            acks: env_or("BROKER_PRODUCER_ACKS", Acks::All)?,
            min_insync_replicas: env_or("BROKER_MIN_INSYNC_REPLICAS", 0)?,
            retry_max: env_or("BROKER_PRODUCER_RETRY_MAX", 3)?,
            retry_backoff: Duration::from_millis(env_or("BROKER_PRODUCER_RETRY_BACKOFF_MS", 100)?),
            producer_timeout: Duration::from_millis(env_or("BROKER_PRODUCER_TIMEOUT_MS", 10_000)?),
            idempotent: env_or("BROKER_PRODUCER_IDEMPOTENT", true)?,
            compression: env_or("BROKER_COMPRESSION", Compression::Lz4)?,
            max_stream_len: env_or("BROKER_MAX_STREAM_LEN", 100_000)?,
            consumer_group: std::env::var("BROKER_CONSUMER_GROUP")
                .unwrap_or_else(|_| "notifications-group".to_string()),
            consumer_name: std::env::var("BROKER_CONSUMER_NAME")
                .unwrap_or_else(|_| "courier-0".to_string()),
            member_index: env_or("BROKER_MEMBER_INDEX", 0)?,
            member_count: env_or("BROKER_MEMBER_COUNT", 1)?,
            offset_reset: env_or("BROKER_OFFSET_RESET", OffsetReset::Latest)?,
            session_timeout: Duration::from_millis(env_or("BROKER_SESSION_TIMEOUT_MS", 30_000)?),
            heartbeat_interval: Duration::from_millis(env_or(
                "BROKER_HEARTBEAT_INTERVAL_MS",
                3_000,
            )?),
            auto_commit_interval: Duration::from_millis(env_or(
                "BROKER_AUTO_COMMIT_INTERVAL_MS",
                1_000,
            )?),
            poll_batch_size: env_or("BROKER_POLL_BATCH_SIZE", 100)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject topologies the partitioner and group assignment cannot serve.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.partitions == 0 {
            anyhow::bail!("BROKER_PARTITIONS must be at least 1");
        }
        if self.member_count == 0 || self.member_index >= self.member_count {
            anyhow::bail!(
                "BROKER_MEMBER_INDEX ({}) must be below BROKER_MEMBER_COUNT ({})",
                self.member_index,
                self.member_count
            );
        }
        Ok(())
    }
}

impl OutboxConfig {
    fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            interval: Duration::from_secs(env_or("OUTBOX_INTERVAL_SECS", 30)?),
            batch_size: env_or("OUTBOX_BATCH_SIZE", 100)?,
            immediate_publish: env_or("OUTBOX_IMMEDIATE_PUBLISH", false)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// The publisher ticks on `interval` and fetches `batch_size` rows per tick.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval.is_zero() {
            anyhow::bail!("OUTBOX_INTERVAL_SECS must be at least 1");
        }
        if self.batch_size < 1 {
            anyhow::bail!(
                "OUTBOX_BATCH_SIZE must be at least 1, got {}",
                self.batch_size
            );
        }
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic: "notifications".to_string(),
            partitions: 8,
            acks: Acks::All,
            min_insync_replicas: 0,
            retry_max: 3,
            retry_backoff: Duration::from_millis(100),
            producer_timeout: Duration::from_secs(10),
            idempotent: true,
            compression: Compression::Lz4,
            max_stream_len: 100_000,
            consumer_group: "notifications-group".to_string(),
            consumer_name: "courier-0".to_string(),
            member_index: 0,
            member_count: 1,
            offset_reset: OffsetReset::Latest,
            session_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(3),
            auto_commit_interval: Duration::from_secs(1),
            poll_batch_size: 100,
        }
    }
}

/// Read `key` and parse it, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}
