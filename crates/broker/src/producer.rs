//! Redis Streams producer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use uuid::Uuid;

use courier_common::config::{Acks, BrokerConfig, Compression};

use crate::codec;
use crate::partition::{partition_for, stream_key};
use crate::{BrokerError, Producer, ProducerRecord, RecordMetadata};

/// How long a `(producer, sequence)` marker is kept for retry detection.
const SEQUENCE_MARKER_TTL_SECS: u64 = 3600;

/// Append once per `(producer_id, sequence)`; a retry returns the original id.
///
/// KEYS[1] stream, KEYS[2] sequence marker
/// ARGV[1] maxlen, ARGV[2] key, ARGV[3] codec, ARGV[4] value, ARGV[5] marker ttl
const IDEMPOTENT_APPEND: &str = r#"
local existing = redis.call('GET', KEYS[2])
if existing then
  return existing
end
local id = redis.call('XADD', KEYS[1], 'MAXLEN', '~', ARGV[1], '*',
  'key', ARGV[2], 'codec', ARGV[3], 'value', ARGV[4])
redis.call('SET', KEYS[2], id, 'EX', ARGV[5])
return id
"#;

/// Key recording the stream id written for one `(producer, sequence)` send.
pub fn sequence_marker(producer_id: &str, sequence: u64) -> String {
    format!("courier:producer:{}:{}", producer_id, sequence)
}

/// Producer settings taken from [`BrokerConfig`].
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub partitions: u32,
    pub acks: Acks,
    pub min_insync_replicas: u32,
    pub retry_max: u32,
    pub retry_backoff: Duration,
    pub timeout: Duration,
    pub idempotent: bool,
    pub compression: Compression,
    pub max_stream_len: usize,
}

impl From<&BrokerConfig> for ProducerSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            partitions: config.partitions,
            acks: config.acks,
            min_insync_replicas: config.min_insync_replicas,
            retry_max: config.retry_max,
            retry_backoff: config.retry_backoff,
            timeout: config.producer_timeout,
            idempotent: config.idempotent,
            compression: config.compression,
            max_stream_len: config.max_stream_len,
        }
    }
}

impl ProducerSettings {
    /// Retries allowed after the first attempt.
    fn retries(&self) -> u32 {
        match self.acks {
            Acks::None => 0,
            Acks::Leader | Acks::All => self.retry_max,
        }
    }
}

/// Producer writing to partition streams.
///
/// The connection sits behind an async mutex, so at most one request is in
/// flight per producer. With `idempotent` set, each `send` is tagged with
/// this producer's id and a sequence number, and retries of the same send
/// never append twice.
pub struct RedisProducer {
    conn: Mutex<ConnectionManager>,
    settings: ProducerSettings,
    producer_id: String,
    sequence: AtomicU64,
    append_script: Script,
}

impl RedisProducer {
    pub fn new(conn: ConnectionManager, settings: ProducerSettings) -> Self {
        let producer_id = Uuid::new_v4().simple().to_string();
        tracing::info!(
            producer_id = %producer_id,
            acks = ?settings.acks,
            idempotent = settings.idempotent,
            compression = ?settings.compression,
            "Producer created"
        );

        Self {
            conn: Mutex::new(conn),
            settings,
            producer_id,
            sequence: AtomicU64::new(0),
            append_script: Script::new(IDEMPOTENT_APPEND),
        }
    }

    /// Id tagging this producer's sequence markers.
    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    async fn append(
        &self,
        conn: &mut ConnectionManager,
        stream: &str,
        key: &str,
        codec: &str,
        payload: &[u8],
        sequence: u64,
    ) -> Result<String, BrokerError> {
        let offset: String = if self.settings.idempotent {
            let marker = sequence_marker(&self.producer_id, sequence);
            self.append_script
                .key(stream)
                .key(marker)
                .arg(self.settings.max_stream_len)
                .arg(key)
                .arg(codec)
                .arg(payload)
                .arg(SEQUENCE_MARKER_TTL_SECS)
                .invoke_async(conn)
                .await?
        } else {
            redis::cmd("XADD")
                .arg(stream)
                .arg("MAXLEN")
                .arg("~")
                .arg(self.settings.max_stream_len)
                .arg("*")
                .arg("key")
                .arg(key)
                .arg("codec")
                .arg(codec)
                .arg("value")
                .arg(payload)
                .query_async(conn)
                .await?
        };

        if self.settings.acks == Acks::All && self.settings.min_insync_replicas > 0 {
            let wait_ms = u64::try_from(self.settings.timeout.as_millis()).unwrap_or(u64::MAX);
            let acked: i64 = redis::cmd("WAIT")
                .arg(self.settings.min_insync_replicas)
                .arg(wait_ms)
                .query_async(conn)
                .await?;
            let acked = u32::try_from(acked).unwrap_or(0);
            if acked < self.settings.min_insync_replicas {
                return Err(BrokerError::NotEnoughReplicas {
                    required: self.settings.min_insync_replicas,
                    acked,
                });
            }
        }

        Ok(offset)
    }
}

#[async_trait]
impl Producer for RedisProducer {
    async fn send(&self, record: ProducerRecord) -> Result<RecordMetadata, BrokerError> {
        let partition = partition_for(record.key.as_bytes(), self.settings.partitions);
        let stream = stream_key(&record.topic, partition);
        let (codec, payload) = codec::compress(&record.value, self.settings.compression);
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        // Replica WAIT runs inside the same deadline.
        let deadline = self.settings.timeout * 2;

        let mut conn = self.conn.lock().await;
        let mut attempt = 0u32;

        loop {
            let result = match tokio::time::timeout(
                deadline,
                self.append(&mut conn, &stream, &record.key, codec, &payload, sequence),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(BrokerError::Timeout(deadline)),
            };

            match result {
                Ok(offset) => {
                    tracing::debug!(
                        stream = %stream,
                        partition,
                        offset = %offset,
                        attempt,
                        "Message produced"
                    );
                    return Ok(RecordMetadata {
                        topic: record.topic,
                        partition,
                        offset,
                    });
                }
                Err(e) if e.is_retriable() && attempt < self.settings.retries() => {
                    attempt += 1;
                    tracing::warn!(
                        stream = %stream,
                        attempt,
                        max_retries = self.settings.retries(),
                        error = %e,
                        "Produce failed, retrying"
                    );
                    tokio::time::sleep(self.settings.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
