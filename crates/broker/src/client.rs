use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use courier_common::config::BrokerConfig;

use crate::consumer::{ConsumerSettings, RedisConsumerConnector};
use crate::producer::{ProducerSettings, RedisProducer};
use crate::{BrokerError, HealthCheck};

/// Upper bound for the health check round trip.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds producers and consumer connectors for one broker deployment.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    redis_url: String,
    config: BrokerConfig,
}

impl BrokerClient {
    pub fn new(redis_url: impl Into<String>, config: BrokerConfig) -> Self {
        Self {
            redis_url: redis_url.into(),
            config,
        }
    }

    /// Producer over an established connection manager.
    pub fn producer(&self, conn: ConnectionManager) -> RedisProducer {
        RedisProducer::new(conn, ProducerSettings::from(&self.config))
    }

    pub fn consumer_connector(&self) -> Result<RedisConsumerConnector, BrokerError> {
        RedisConsumerConnector::new(&self.redis_url, ConsumerSettings::from(&self.config))
    }
}

#[async_trait]
impl HealthCheck for BrokerClient {
    async fn health_check(&self) -> Result<(), BrokerError> {
        health_check(&self.redis_url).await
    }
}

/// Open a throwaway connection, `PING`, and drop it. Writes nothing.
pub async fn health_check(redis_url: &str) -> Result<(), BrokerError> {
    let client = redis::Client::open(redis_url)?;

    let ping = async {
        let mut conn = client.get_multiplexed_async_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok::<_, BrokerError>(pong)
    };

    let pong = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, ping)
        .await
        .map_err(|_| BrokerError::Timeout(HEALTH_CHECK_TIMEOUT))??;

    if pong != "PONG" {
        return Err(BrokerError::Unavailable(format!(
            "unexpected PING reply '{}'",
            pong
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check_rejects_bad_url() {
        let err = health_check("not-a-redis-url").await.unwrap_err();
        assert!(matches!(err, BrokerError::Redis(_)));
    }

    #[tokio::test]
    async fn test_health_check_fails_when_unreachable() {
        // Port 1 is reserved and refuses connections.
        assert!(health_check("redis://127.0.0.1:1").await.is_err());
    }
}
