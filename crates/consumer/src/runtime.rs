//! Consumer group runtime.
//!
//! ```text
//!   Disconnected ──▶ Connecting ──▶ Consuming
//!        ▲               │              │
//!        └──── backoff ◀─┴── error ◀────┘
//! ```
//!
//! Any state moves to `Stopped` on shutdown. Records are decoded and
//! upserted into the [`DeliveryStore`] before their positions are committed;
//! commits are batched per `commit_interval` and flushed on shutdown.
//! Positions not yet committed when a session breaks are delivered again to
//! the next session.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use courier_broker::codec::decode_message;
use courier_broker::{BrokerError, ConsumedRecord, ConsumerConnector, ConsumerGroup, RecordPosition};
use courier_common::shutdown::Shutdown;

use crate::backoff::Backoff;
use crate::delivery_store::{DeliveryStore, UpsertOutcome};

const STATUS_HISTORY_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
    Stopped,
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerState::Disconnected => write!(f, "disconnected"),
            ConsumerState::Connecting => write!(f, "connecting"),
            ConsumerState::Consuming => write!(f, "consuming"),
            ConsumerState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub state: ConsumerState,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of the runtime for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: ConsumerState,
    pub since: DateTime<Utc>,
    pub reconnects: u64,
    pub consumed: u64,
    pub malformed: u64,
    pub last_error: Option<String>,
}

struct StatusInner {
    history: VecDeque<StateChange>,
    reconnects: u64,
    consumed: u64,
    malformed: u64,
    last_error: Option<String>,
}

/// Shared, read-mostly view of the runtime state.
#[derive(Clone)]
pub struct ConsumerStatus {
    inner: Arc<RwLock<StatusInner>>,
}

impl ConsumerStatus {
    pub fn new() -> Self {
        let mut history = VecDeque::with_capacity(STATUS_HISTORY_LEN);
        history.push_back(StateChange {
            state: ConsumerState::Disconnected,
            at: Utc::now(),
        });
        Self {
            inner: Arc::new(RwLock::new(StatusInner {
                history,
                reconnects: 0,
                consumed: 0,
                malformed: 0,
                last_error: None,
            })),
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.inner
            .read()
            .history
            .back()
            .map(|c| c.state)
            .unwrap_or(ConsumerState::Disconnected)
    }

    /// Recent states, oldest first.
    pub fn history(&self) -> Vec<ConsumerState> {
        self.inner.read().history.iter().map(|c| c.state).collect()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.read();
        let current = inner.history.back().cloned().unwrap_or(StateChange {
            state: ConsumerState::Disconnected,
            at: Utc::now(),
        });
        StatusSnapshot {
            state: current.state,
            since: current.at,
            reconnects: inner.reconnects,
            consumed: inner.consumed,
            malformed: inner.malformed,
            last_error: inner.last_error.clone(),
        }
    }

    fn set(&self, state: ConsumerState) {
        let mut inner = self.inner.write();
        if inner.history.back().map(|c| c.state) == Some(state) {
            return;
        }
        if state == ConsumerState::Connecting
            && inner.history.iter().any(|c| c.state == ConsumerState::Consuming)
        {
            inner.reconnects += 1;
        }
        if inner.history.len() == STATUS_HISTORY_LEN {
            inner.history.pop_front();
        }
        inner.history.push_back(StateChange {
            state,
            at: Utc::now(),
        });
        drop(inner);
        tracing::info!(state = %state, "Consumer state changed");
    }

    fn record_error(&self, error: &BrokerError) {
        self.inner.write().last_error = Some(error.to_string());
    }

    fn record_consumed(&self, malformed: bool) {
        let mut inner = self.inner.write();
        inner.consumed += 1;
        if malformed {
            inner.malformed += 1;
        }
    }
}

impl Default for ConsumerStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConsumerRuntime {
    connector: Arc<dyn ConsumerConnector>,
    store: Arc<DeliveryStore>,
    backoff: Backoff,
    commit_interval: Duration,
    status: ConsumerStatus,
}

impl ConsumerRuntime {
    pub fn new(
        connector: Arc<dyn ConsumerConnector>,
        store: Arc<DeliveryStore>,
        backoff: Backoff,
        commit_interval: Duration,
    ) -> Self {
        Self {
            connector,
            store,
            backoff,
            commit_interval,
            status: ConsumerStatus::new(),
        }
    }

    pub fn status(&self) -> ConsumerStatus {
        self.status.clone()
    }

    /// Connect, consume and reconnect until shutdown.
    pub async fn run(&self, mut shutdown: Shutdown) {
        let mut failures = 0u32;

        while !shutdown.is_triggered() {
            self.status.set(ConsumerState::Connecting);

            let connected = tokio::select! {
                _ = shutdown.wait() => break,
                connected = self.connector.connect() => connected,
            };

            match connected {
                Ok(mut session) => {
                    failures = 0;
                    self.status.set(ConsumerState::Consuming);
                    let outcome = self.consume(session.as_mut(), &mut shutdown).await;
                    session.close().await;
                    match outcome {
                        Ok(()) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "Consumer session lost");
                            self.status.record_error(&e);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Consumer connect failed");
                    self.status.record_error(&e);
                }
            }

            self.status.set(ConsumerState::Disconnected);
            failures = failures.saturating_add(1);
            let delay = self.backoff.delay(failures);
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt = failures,
                "Reconnecting consumer"
            );

            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.status.set(ConsumerState::Stopped);
    }

    /// Consume from one session. Returns `Ok` on shutdown and `Err` when the
    /// session broke.
    async fn consume(
        &self,
        session: &mut dyn ConsumerGroup,
        shutdown: &mut Shutdown,
    ) -> Result<(), BrokerError> {
        let mut uncommitted: Vec<RecordPosition> = Vec::new();
        let mut last_commit = Instant::now();

        loop {
            let polled = tokio::select! {
                _ = shutdown.wait() => {
                    Self::flush(session, &mut uncommitted).await;
                    return Ok(());
                }
                polled = session.poll() => polled?,
            };

            for record in &polled {
                self.handle(record);
                uncommitted.push(record.position());
            }

            if !uncommitted.is_empty() && last_commit.elapsed() >= self.commit_interval {
                session.commit(&uncommitted).await?;
                uncommitted.clear();
                last_commit = Instant::now();
            }
        }
    }

    /// Decode one record into the delivery store. Malformed payloads are
    /// dropped; their position is still committed.
    fn handle(&self, record: &ConsumedRecord) {
        match decode_message(&record.value) {
            Ok(message) => {
                let event_id = message.id;
                let recipient_id = message.recipient_id;
                let outcome = self.store.upsert(message);
                self.status.record_consumed(false);
                tracing::debug!(
                    event_id = %event_id,
                    recipient_id = %recipient_id,
                    partition = record.partition,
                    offset = %record.offset,
                    duplicate = outcome == UpsertOutcome::Duplicate,
                    "Message delivered"
                );
            }
            Err(e) => {
                self.status.record_consumed(true);
                tracing::warn!(
                    partition = record.partition,
                    offset = %record.offset,
                    error = %e,
                    "Dropping malformed message"
                );
            }
        }
    }

    async fn flush(session: &mut dyn ConsumerGroup, uncommitted: &mut Vec<RecordPosition>) {
        if uncommitted.is_empty() {
            return;
        }
        match session.commit(uncommitted).await {
            Ok(()) => {
                tracing::debug!(count = uncommitted.len(), "Final commit flushed");
                uncommitted.clear();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Final commit failed, records will be redelivered");
            }
        }
    }
}
