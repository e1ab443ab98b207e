//! Redis Streams consumer-group sessions.
//!
//! Each session owns a dedicated multiplexed connection, so a dropped
//! connection surfaces as a poll error instead of being retried silently.
//! The runtime above decides when to reconnect.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};

use courier_common::config::{BrokerConfig, OffsetReset};

use crate::codec;
use crate::partition::{assigned_partitions, stream_key};
use crate::{BrokerError, ConsumedRecord, ConsumerConnector, ConsumerGroup, RecordPosition};

/// Consumer-group settings taken from [`BrokerConfig`].
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub topic: String,
    pub partitions: u32,
    pub group: String,
    pub consumer_name: String,
    pub member_index: u32,
    pub member_count: u32,
    pub offset_reset: OffsetReset,
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub batch_size: usize,
}

impl From<&BrokerConfig> for ConsumerSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            partitions: config.partitions,
            group: config.consumer_group.clone(),
            consumer_name: config.consumer_name.clone(),
            member_index: config.member_index,
            member_count: config.member_count,
            offset_reset: config.offset_reset,
            session_timeout: config.session_timeout,
            heartbeat_interval: config.heartbeat_interval,
            batch_size: config.poll_batch_size,
        }
    }
}

impl ConsumerSettings {
    /// `XGROUP CREATE` start id for a group that does not exist yet.
    fn start_id(&self) -> &'static str {
        match self.offset_reset {
            OffsetReset::Earliest => "0",
            OffsetReset::Latest => "$",
        }
    }
}

/// Opens consumer-group sessions against a Redis server.
pub struct RedisConsumerConnector {
    client: redis::Client,
    settings: ConsumerSettings,
}

impl RedisConsumerConnector {
    pub fn new(redis_url: &str, settings: ConsumerSettings) -> Result<Self, BrokerError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            settings,
        })
    }

    async fn ensure_group(
        &self,
        conn: &mut MultiplexedConnection,
        stream: &str,
    ) -> Result<(), BrokerError> {
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(stream, &self.settings.group, self.settings.start_id())
            .await;

        match created {
            Ok(()) => {
                tracing::info!(
                    stream = %stream,
                    group = %self.settings.group,
                    start = self.settings.start_id(),
                    "Consumer group created"
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ConsumerConnector for RedisConsumerConnector {
    async fn connect(&self) -> Result<Box<dyn ConsumerGroup>, BrokerError> {
        let mut conn = tokio::time::timeout(
            self.settings.session_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| BrokerError::Timeout(self.settings.session_timeout))??;

        let partitions = assigned_partitions(
            self.settings.partitions,
            self.settings.member_index,
            self.settings.member_count,
        );

        let mut streams = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let stream = stream_key(&self.settings.topic, partition);
            self.ensure_group(&mut conn, &stream).await?;
            streams.push(PartitionCursor {
                partition,
                stream,
                cursor: Cursor::Pending("0".to_string()),
            });
        }

        tracing::info!(
            group = %self.settings.group,
            consumer = %self.settings.consumer_name,
            partitions = ?streams.iter().map(|s| s.partition).collect::<Vec<_>>(),
            "Joined consumer group"
        );

        Ok(Box::new(RedisConsumerSession {
            conn,
            settings: self.settings.clone(),
            streams,
        }))
    }
}

/// Read position of one partition within a session.
#[derive(Debug, Clone, PartialEq)]
enum Cursor {
    /// Re-reading entries delivered to this consumer name but never
    /// acknowledged, starting after the given id.
    Pending(String),
    /// Reading entries never delivered to the group.
    New,
}

#[derive(Debug)]
struct PartitionCursor {
    partition: u32,
    stream: String,
    cursor: Cursor,
}

impl PartitionCursor {
    fn read_id(&self) -> &str {
        match &self.cursor {
            Cursor::Pending(id) => id,
            Cursor::New => ">",
        }
    }
}

struct RedisConsumerSession {
    conn: MultiplexedConnection,
    settings: ConsumerSettings,
    streams: Vec<PartitionCursor>,
}

impl RedisConsumerSession {
    fn draining(&self) -> bool {
        self.streams
            .iter()
            .any(|s| matches!(s.cursor, Cursor::Pending(_)))
    }

    fn to_record(&self, partition: u32, entry: &StreamId) -> Result<ConsumedRecord, BrokerError> {
        let codec_name: String = entry.get("codec").unwrap_or_else(|| codec::CODEC_NONE.into());
        let stored: Vec<u8> = entry
            .get("value")
            .ok_or_else(|| BrokerError::Codec(format!("entry {} has no value", entry.id)))?;

        Ok(ConsumedRecord {
            topic: self.settings.topic.clone(),
            partition,
            offset: entry.id.clone(),
            key: entry.get("key"),
            value: codec::decompress(&codec_name, &stored)?,
        })
    }
}

#[async_trait]
impl ConsumerGroup for RedisConsumerSession {
    async fn poll(&mut self) -> Result<Vec<ConsumedRecord>, BrokerError> {
        if self.streams.is_empty() {
            tokio::time::sleep(self.settings.heartbeat_interval).await;
            return Ok(Vec::new());
        }

        let keys: Vec<String> = self.streams.iter().map(|s| s.stream.clone()).collect();
        let ids: Vec<String> = self.streams.iter().map(|s| s.read_id().to_string()).collect();

        let mut options = StreamReadOptions::default()
            .group(&self.settings.group, &self.settings.consumer_name)
            .count(self.settings.batch_size);
        if !self.draining() {
            let block_ms =
                usize::try_from(self.settings.heartbeat_interval.as_millis()).unwrap_or(usize::MAX);
            options = options.block(block_ms);
        }

        let guard = self.settings.heartbeat_interval + self.settings.session_timeout;
        let reply: Option<StreamReadReply> =
            tokio::time::timeout(guard, self.conn.xread_options(&keys, &ids, &options))
                .await
                .map_err(|_| BrokerError::Timeout(guard))??;

        let mut by_stream: HashMap<String, Vec<StreamId>> = reply
            .map(|r| r.keys.into_iter().map(|k| (k.key, k.ids)).collect())
            .unwrap_or_default();

        let mut records = Vec::new();
        for index in 0..self.streams.len() {
            let entries = by_stream
                .remove(&self.streams[index].stream)
                .unwrap_or_default();
            let partition = self.streams[index].partition;

            if let Cursor::Pending(_) = self.streams[index].cursor {
                match entries.last() {
                    Some(last) => {
                        self.streams[index].cursor = Cursor::Pending(last.id.clone());
                    }
                    None => {
                        tracing::debug!(partition, "Pending entries drained");
                        self.streams[index].cursor = Cursor::New;
                    }
                }
            }

            for entry in &entries {
                match self.to_record(partition, entry) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        // Undecodable at the transport level; ack so it is not redelivered.
                        tracing::warn!(
                            partition,
                            offset = %entry.id,
                            error = %e,
                            "Dropping undecodable stream entry"
                        );
                        let stream = self.streams[index].stream.clone();
                        let _: i64 = self
                            .conn
                            .xack(&stream, &self.settings.group, &[&entry.id])
                            .await?;
                    }
                }
            }
        }

        Ok(records)
    }

    async fn commit(&mut self, positions: &[RecordPosition]) -> Result<(), BrokerError> {
        let mut by_partition: HashMap<u32, Vec<&str>> = HashMap::new();
        for position in positions {
            by_partition
                .entry(position.partition)
                .or_default()
                .push(position.offset.as_str());
        }

        for (partition, offsets) in by_partition {
            let stream = stream_key(&self.settings.topic, partition);
            let acked: i64 = self
                .conn
                .xack(&stream, &self.settings.group, &offsets)
                .await?;
            tracing::debug!(partition, acked, "Offsets committed");
        }

        Ok(())
    }

    async fn close(&mut self) {
        tracing::info!(
            group = %self.settings.group,
            consumer = %self.settings.consumer_name,
            "Left consumer group"
        );
    }
}
