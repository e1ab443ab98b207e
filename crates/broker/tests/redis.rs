//! Integration tests against a live Redis server.
//!
//! These tests require a running Redis instance:
//!
//! ```bash
//! REDIS_URL="redis://localhost:6379" \
//!   cargo test -p courier-broker --test redis -- --ignored --nocapture
//! ```

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::StreamPendingReply;
use uuid::Uuid;

use courier_broker::consumer::ConsumerSettings;
use courier_broker::partition::stream_key;
use courier_broker::producer::{ProducerSettings, sequence_marker};
use courier_broker::{
    BrokerError, ConsumedRecord, ConsumerConnector, ConsumerGroup, Producer, ProducerRecord,
    RecordPosition, RedisConsumerConnector, RedisProducer,
};
use courier_common::config::{Acks, BrokerConfig, Compression, OffsetReset};

// ============================================================
// Shared helpers
// ============================================================

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

/// Single-partition topic unique to one test.
fn test_config() -> BrokerConfig {
    let suffix = Uuid::new_v4().simple().to_string();
    BrokerConfig {
        topic: format!("courier-test-{}", suffix),
        partitions: 1,
        acks: Acks::Leader,
        retry_max: 0,
        producer_timeout: Duration::from_millis(200),
        compression: Compression::None,
        consumer_group: format!("courier-test-group-{}", suffix),
        consumer_name: "member-a".to_string(),
        offset_reset: OffsetReset::Earliest,
        session_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(100),
        poll_batch_size: 10,
        ..BrokerConfig::default()
    }
}

async fn conn() -> MultiplexedConnection {
    redis::Client::open(redis_url())
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap()
}

async fn producer(config: &BrokerConfig) -> RedisProducer {
    let client = redis::Client::open(redis_url()).unwrap();
    let manager = ConnectionManager::new(client).await.unwrap();
    RedisProducer::new(manager, ProducerSettings::from(config))
}

fn connector(config: &BrokerConfig) -> RedisConsumerConnector {
    RedisConsumerConnector::new(&redis_url(), ConsumerSettings::from(config)).unwrap()
}

fn record(config: &BrokerConfig, body: &str) -> ProducerRecord {
    ProducerRecord {
        topic: config.topic.clone(),
        key: "recipient-1".to_string(),
        value: body.as_bytes().to_vec(),
    }
}

/// Poll until `count` records arrived or the attempts ran out.
async fn poll_until(session: &mut Box<dyn ConsumerGroup>, count: usize) -> Vec<ConsumedRecord> {
    let mut records = Vec::new();
    for _ in 0..30 {
        records.extend(session.poll().await.unwrap());
        if records.len() >= count {
            break;
        }
    }
    records
}

async fn pending_count(config: &BrokerConfig) -> usize {
    let reply: StreamPendingReply = conn()
        .await
        .xpending(stream_key(&config.topic, 0), &config.consumer_group)
        .await
        .unwrap();
    reply.count()
}

async fn stream_len(config: &BrokerConfig) -> usize {
    conn()
        .await
        .xlen(stream_key(&config.topic, 0))
        .await
        .unwrap()
}

async fn cleanup(config: &BrokerConfig) {
    let _: () = conn()
        .await
        .del(stream_key(&config.topic, 0))
        .await
        .unwrap();
}

// ============================================================
// Producer
// ============================================================

#[tokio::test]
#[ignore]
async fn test_idempotent_send_reuses_marker_offset() {
    let config = test_config();
    let producer = producer(&config).await;

    let first = producer.send(record(&config, "one")).await.unwrap();
    let marker: String = conn()
        .await
        .get(sequence_marker(producer.producer_id(), 0))
        .await
        .unwrap();
    assert_eq!(marker, first.offset);

    // Sequence 1 already went through once but its reply was lost.
    let _: () = conn()
        .await
        .set(sequence_marker(producer.producer_id(), 1), &first.offset)
        .await
        .unwrap();
    let retried = producer.send(record(&config, "one")).await.unwrap();

    assert_eq!(retried.offset, first.offset);
    assert_eq!(stream_len(&config).await, 1);
    cleanup(&config).await;
}

#[tokio::test]
#[ignore]
async fn test_replica_shortfall_fails_send() {
    // A standalone server has no replicas to confirm the write.
    let config = BrokerConfig {
        acks: Acks::All,
        min_insync_replicas: 1,
        ..test_config()
    };
    let producer = producer(&config).await;

    let err = producer.send(record(&config, "lonely")).await.unwrap_err();
    assert!(matches!(
        err,
        BrokerError::NotEnoughReplicas {
            required: 1,
            acked: 0
        }
    ));
    cleanup(&config).await;
}

// ============================================================
// Consumer group
// ============================================================

#[tokio::test]
#[ignore]
async fn test_existing_group_is_joined() {
    let config = test_config();
    let members = connector(&config);

    let mut first = members.connect().await.unwrap();
    first.close().await;
    let mut second = members.connect().await.unwrap();
    second.close().await;
    let mut other = connector(&config).connect().await.unwrap();
    other.close().await;
    cleanup(&config).await;
}

#[tokio::test]
#[ignore]
async fn test_reconnect_reads_pending_before_new() {
    let config = test_config();
    let producer = producer(&config).await;
    let members = connector(&config);

    producer.send(record(&config, "a")).await.unwrap();
    producer.send(record(&config, "b")).await.unwrap();

    let mut session = members.connect().await.unwrap();
    let claimed = poll_until(&mut session, 2).await;
    assert_eq!(claimed.len(), 2);
    // Left without committing.
    session.close().await;
    drop(session);

    producer.send(record(&config, "c")).await.unwrap();

    let mut session = members.connect().await.unwrap();
    let redelivered = session.poll().await.unwrap();
    let offsets: Vec<&str> = redelivered.iter().map(|r| r.offset.as_str()).collect();
    let expected: Vec<&str> = claimed.iter().map(|r| r.offset.as_str()).collect();
    assert_eq!(offsets, expected);

    let fresh = poll_until(&mut session, 1).await;
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].value, b"c");

    let positions: Vec<RecordPosition> = redelivered
        .iter()
        .chain(fresh.iter())
        .map(ConsumedRecord::position)
        .collect();
    session.commit(&positions).await.unwrap();
    assert_eq!(pending_count(&config).await, 0);
    cleanup(&config).await;
}

#[tokio::test]
#[ignore]
async fn test_undecodable_entry_is_acked_and_skipped() {
    let config = test_config();
    let producer = producer(&config).await;
    let mut session = connector(&config).connect().await.unwrap();

    let _: String = conn()
        .await
        .xadd(
            stream_key(&config.topic, 0),
            "*",
            &[("key", "recipient-1"), ("codec", "zstd"), ("value", "???")],
        )
        .await
        .unwrap();
    producer.send(record(&config, "valid")).await.unwrap();

    let records = poll_until(&mut session, 1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].value, b"valid");
    // Only the valid entry is still waiting for a commit.
    assert_eq!(pending_count(&config).await, 1);

    session.commit(&[records[0].position()]).await.unwrap();
    assert_eq!(pending_count(&config).await, 0);
    cleanup(&config).await;
}
