//! In-process broker with per-partition logs and per-group committed offsets.
//!
//! Partition routing matches the Redis producer. Failure injection lets
//! tests take the broker down, or fail a specific send attempt, and watch
//! the publisher and the consumer runtime recover.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::partition::partition_for;
use crate::{
    BrokerError, ConsumedRecord, ConsumerConnector, ConsumerGroup, HealthCheck, Producer,
    ProducerRecord, RecordMetadata, RecordPosition,
};

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// A message as stored in a partition log.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Default)]
struct State {
    available: bool,
    /// Bumped whenever the broker goes down; older sessions are dead.
    generation: u64,
    logs: HashMap<(String, u32), Vec<StoredMessage>>,
    /// `(group, topic, partition)` -> next offset to deliver to a new session.
    committed: HashMap<(String, String, u32), u64>,
    send_attempts: u64,
    failing_attempts: HashSet<u64>,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    partitions: u32,
    poll_timeout: Duration,
}

/// Cloneable handle to one in-memory broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new(partitions: u32) -> Self {
        Self::with_poll_timeout(partitions, DEFAULT_POLL_TIMEOUT)
    }

    pub fn with_poll_timeout(partitions: u32, poll_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    available: true,
                    ..State::default()
                }),
                notify: Notify::new(),
                partitions: partitions.max(1),
                poll_timeout,
            }),
        }
    }

    /// Connector for a consumer group reading `topic`.
    pub fn connector(&self, group: impl Into<String>, topic: impl Into<String>) -> InMemoryConnector {
        InMemoryConnector {
            broker: self.clone(),
            group: group.into(),
            topic: topic.into(),
        }
    }

    /// Take the broker down or bring it back. Going down breaks every open
    /// consumer session.
    pub fn set_available(&self, available: bool) {
        {
            let mut state = self.shared.state.lock();
            if state.available && !available {
                state.generation += 1;
            }
            state.available = available;
        }
        tracing::debug!(available, "In-memory broker availability changed");
        self.shared.notify.notify_waiters();
    }

    /// Fail the `attempt`-th send (1-based, counted over the broker lifetime).
    pub fn fail_send_attempt(&self, attempt: u64) {
        self.shared.state.lock().failing_attempts.insert(attempt);
    }

    pub fn send_attempts(&self) -> u64 {
        self.shared.state.lock().send_attempts
    }

    /// Every message of `topic`, partition by partition in offset order.
    pub fn messages(&self, topic: &str) -> Vec<StoredMessage> {
        let state = self.shared.state.lock();
        (0..self.shared.partitions)
            .flat_map(|p| {
                state
                    .logs
                    .get(&(topic.to_string(), p))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Next offset a new session of `group` would read from `partition`.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> u64 {
        self.shared
            .state
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
            .unwrap_or(0)
    }

    pub fn partitions(&self) -> u32 {
        self.shared.partitions
    }
}

#[async_trait]
impl Producer for InMemoryBroker {
    async fn send(&self, record: ProducerRecord) -> Result<RecordMetadata, BrokerError> {
        let partition = partition_for(record.key.as_bytes(), self.shared.partitions);

        let offset = {
            let mut state = self.shared.state.lock();
            state.send_attempts += 1;
            let attempt = state.send_attempts;

            if !state.available {
                return Err(BrokerError::Unavailable("broker is down".into()));
            }
            if state.failing_attempts.remove(&attempt) {
                return Err(BrokerError::Unavailable(format!(
                    "injected failure on send attempt {}",
                    attempt
                )));
            }

            let log = state
                .logs
                .entry((record.topic.clone(), partition))
                .or_default();
            let offset = log.len() as u64;
            log.push(StoredMessage {
                partition,
                offset,
                key: record.key,
                value: record.value,
            });
            offset
        };

        self.shared.notify.notify_waiters();

        Ok(RecordMetadata {
            topic: record.topic,
            partition,
            offset: offset.to_string(),
        })
    }
}

#[async_trait]
impl HealthCheck for InMemoryBroker {
    async fn health_check(&self) -> Result<(), BrokerError> {
        if self.shared.state.lock().available {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("broker is down".into()))
        }
    }
}

/// Consumer-group factory over an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
    group: String,
    topic: String,
}

#[async_trait]
impl ConsumerConnector for InMemoryConnector {
    async fn connect(&self) -> Result<Box<dyn ConsumerGroup>, BrokerError> {
        let shared = &self.broker.shared;
        let state = shared.state.lock();
        if !state.available {
            return Err(BrokerError::Unavailable("broker is down".into()));
        }

        // Start after the last commit so nothing committed is redelivered and
        // nothing uncommitted is skipped.
        let positions = (0..shared.partitions)
            .map(|p| {
                state
                    .committed
                    .get(&(self.group.clone(), self.topic.clone(), p))
                    .copied()
                    .unwrap_or(0)
            })
            .collect();

        Ok(Box::new(InMemorySession {
            broker: self.broker.clone(),
            group: self.group.clone(),
            topic: self.topic.clone(),
            generation: state.generation,
            positions,
        }))
    }
}

struct InMemorySession {
    broker: InMemoryBroker,
    group: String,
    topic: String,
    generation: u64,
    /// Next offset to deliver, per partition.
    positions: Vec<u64>,
}

impl InMemorySession {
    fn check_alive(&self, state: &State) -> Result<(), BrokerError> {
        if !state.available || state.generation != self.generation {
            return Err(BrokerError::Unavailable("connection to broker lost".into()));
        }
        Ok(())
    }

    fn take_ready(&mut self) -> Result<Vec<ConsumedRecord>, BrokerError> {
        let state = self.broker.shared.state.lock();
        self.check_alive(&state)?;

        let mut records = Vec::new();
        for (partition, position) in self.positions.iter_mut().enumerate() {
            let partition = partition as u32;
            let Some(log) = state.logs.get(&(self.topic.clone(), partition)) else {
                continue;
            };
            for message in log.iter().skip(*position as usize) {
                records.push(ConsumedRecord {
                    topic: self.topic.clone(),
                    partition,
                    offset: message.offset.to_string(),
                    key: Some(message.key.clone()),
                    value: message.value.clone(),
                });
            }
            *position = log.len() as u64;
        }
        Ok(records)
    }
}

#[async_trait]
impl ConsumerGroup for InMemorySession {
    async fn poll(&mut self) -> Result<Vec<ConsumedRecord>, BrokerError> {
        let shared = Arc::clone(&self.broker.shared);
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let records = self.take_ready()?;
        if !records.is_empty() {
            return Ok(records);
        }

        let _ = tokio::time::timeout(shared.poll_timeout, notified).await;
        self.take_ready()
    }

    async fn commit(&mut self, positions: &[RecordPosition]) -> Result<(), BrokerError> {
        let mut state = self.broker.shared.state.lock();
        self.check_alive(&state)?;

        for position in positions {
            let offset: u64 = position
                .offset
                .parse()
                .map_err(|_| BrokerError::Rejected(format!("bad offset '{}'", position.offset)))?;
            let next = state
                .committed
                .entry((self.group.clone(), self.topic.clone(), position.partition))
                .or_insert(0);
            *next = (*next).max(offset + 1);
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, value: &str) -> ProducerRecord {
        ProducerRecord {
            topic: "notifications".into(),
            key: key.into(),
            value: value.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_send_routes_equal_keys_to_one_partition() {
        let broker = InMemoryBroker::new(4);
        let a = broker.send(record("user-a", "1")).await.unwrap();
        let b = broker.send(record("user-a", "2")).await.unwrap();

        assert_eq!(a.partition, b.partition);
        assert_eq!(a.offset, "0");
        assert_eq!(b.offset, "1");
        assert_eq!(broker.messages("notifications").len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure_hits_only_that_attempt() {
        let broker = InMemoryBroker::new(1);
        broker.fail_send_attempt(2);

        assert!(broker.send(record("k", "1")).await.is_ok());
        assert!(broker.send(record("k", "2")).await.is_err());
        assert!(broker.send(record("k", "2")).await.is_ok());
        assert_eq!(broker.send_attempts(), 3);
        assert_eq!(broker.messages("notifications").len(), 2);
    }

    #[tokio::test]
    async fn test_new_session_resumes_after_commit() {
        let broker = InMemoryBroker::new(1);
        for i in 0..3 {
            broker.send(record("k", &i.to_string())).await.unwrap();
        }

        let connector = broker.connector("g", "notifications");
        let mut session = connector.connect().await.unwrap();
        let first = session.poll().await.unwrap();
        assert_eq!(first.len(), 3);

        // Only the first record is acknowledged before the session ends.
        session.commit(&[first[0].position()]).await.unwrap();
        session.close().await;

        let mut session = connector.connect().await.unwrap();
        let again = session.poll().await.unwrap();
        let offsets: Vec<&str> = again.iter().map(|r| r.offset.as_str()).collect();
        assert_eq!(offsets, vec!["1", "2"]);
        assert_eq!(broker.committed_offset("g", "notifications", 0), 1);
    }

    #[tokio::test]
    async fn test_outage_breaks_open_sessions() {
        let broker = InMemoryBroker::new(1);
        let connector = broker.connector("g", "notifications");
        let mut session = connector.connect().await.unwrap();

        broker.set_available(false);
        assert!(session.poll().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(broker.send(record("k", "v")).await.is_err());

        broker.set_available(true);
        // The old session stays dead; a new one works.
        assert!(session.poll().await.is_err());
        let mut session = connector.connect().await.unwrap();
        assert!(session.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_poll_wakes_on_send() {
        let broker = InMemoryBroker::with_poll_timeout(1, Duration::from_secs(5));
        let mut session = broker.connector("g", "notifications").connect().await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.send(record("k", "late")).await.unwrap();
        });

        let records = tokio::time::timeout(Duration::from_secs(1), session.poll())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, b"late");
    }
}
