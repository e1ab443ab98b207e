//! Broker client: producer and consumer-group runtime over Redis Streams.
//!
//! A topic is split into a fixed number of partitions, each one a Redis
//! stream named `{topic}:{partition}`. Messages are routed by key so that
//! equal keys (one recipient) always land in the same stream and keep their
//! relative order.
//!
//! The rest of the workspace only sees the [`Producer`],
//! [`ConsumerConnector`] and [`ConsumerGroup`] traits. [`InMemoryBroker`]
//! implements all three for tests.

pub mod client;
pub mod codec;
pub mod consumer;
pub mod memory;
pub mod partition;
pub mod producer;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use courier_common::error::AppError;

pub use client::{BrokerClient, health_check};
pub use consumer::RedisConsumerConnector;
pub use memory::InMemoryBroker;
pub use producer::RedisProducer;

/// A message handed to the producer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    /// Partition key; equal keys are delivered in order.
    pub key: String,
    pub value: Vec<u8>,
}

/// Where the broker stored a produced message.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: u32,
    pub offset: String,
}

/// A message claimed by a consumer-group member. `value` is already
/// decompressed.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: String,
    pub key: Option<String>,
    pub value: Vec<u8>,
}

impl ConsumedRecord {
    pub fn position(&self) -> RecordPosition {
        RecordPosition {
            partition: self.partition,
            offset: self.offset.clone(),
        }
    }
}

/// A processed message to acknowledge to the group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordPosition {
    pub partition: u32,
    pub offset: String,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("broker request timed out after {0:?}")]
    Timeout(Duration),

    #[error("not enough in-sync replicas: required {required}, acknowledged {acked}")]
    NotEnoughReplicas { required: u32, acked: u32 },

    #[error("record rejected: {0}")]
    Rejected(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl BrokerError {
    /// Whether a producer retry may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            BrokerError::Unavailable(_)
            | BrokerError::Timeout(_)
            | BrokerError::NotEnoughReplicas { .. } => true,
            BrokerError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            BrokerError::Rejected(_) | BrokerError::Codec(_) => false,
        }
    }
}

impl From<BrokerError> for AppError {
    fn from(err: BrokerError) -> Self {
        AppError::Broker(err.to_string())
    }
}

/// Synchronous producer: `send` resolves once the broker accepted the message.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, record: ProducerRecord) -> Result<RecordMetadata, BrokerError>;
}

/// Factory for consumer-group sessions.
#[async_trait]
pub trait ConsumerConnector: Send + Sync {
    /// Join the group and return a session over the assigned partitions.
    async fn connect(&self) -> Result<Box<dyn ConsumerGroup>, BrokerError>;
}

/// One live membership in a consumer group.
///
/// Any error means the session is broken; callers drop it and connect again.
/// Uncommitted records are delivered again to the next session.
#[async_trait]
pub trait ConsumerGroup: Send {
    /// Claim the next records, waiting at most one poll interval.
    async fn poll(&mut self) -> Result<Vec<ConsumedRecord>, BrokerError>;

    /// Acknowledge processed records.
    async fn commit(&mut self, positions: &[RecordPosition]) -> Result<(), BrokerError>;

    /// Leave the group. Uncommitted records stay pending.
    async fn close(&mut self);
}

/// Connectivity check with no side effects on topics.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn health_check(&self) -> Result<(), BrokerError>;
}
