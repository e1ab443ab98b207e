//! Outbox publisher: moves unpublished outbox rows onto the broker.
//!
//! Each tick fetches the oldest unpublished rows, publishes them in order and
//! flags each one published after the broker accepted it. The first failure
//! ends the batch; the failed row and everything behind it wait for the next
//! tick, so rows never overtake each other.
//!
//! Publish and flag are two separate writes. A crash between them republishes
//! the row on the next tick; delivery is at-least-once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use courier_broker::{Producer, ProducerRecord};
use courier_common::error::AppError;
use courier_common::shutdown::Shutdown;
use courier_common::types::OutboxEntry;
use courier_store::EventStore;

/// Result of one publisher batch.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct BatchReport {
    /// Rows fetched from the store.
    pub fetched: usize,
    /// Rows published and flagged.
    pub published: usize,
    /// Outbox id of the row that stopped the batch.
    pub stopped_at: Option<i64>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.stopped_at.is_none()
    }
}

pub struct OutboxPublisher {
    store: Arc<dyn EventStore>,
    producer: Arc<dyn Producer>,
    batch_size: i64,
    interval: Duration,
    /// Serializes ticks with on-demand batches from the HTTP path.
    batch_lock: Mutex<()>,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn EventStore>,
        producer: Arc<dyn Producer>,
        batch_size: i64,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            producer,
            batch_size,
            interval,
            batch_lock: Mutex::new(()),
        }
    }

    /// Run one batch per interval until shutdown. Errors are logged and the
    /// loop continues; a batch already started runs to completion.
    pub async fn run(&self, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Outbox publisher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    match self.process_batch().await {
                        Ok(report) if report.fetched > 0 => {
                            tracing::info!(
                                fetched = report.fetched,
                                published = report.published,
                                stopped_at = ?report.stopped_at,
                                "Outbox batch processed"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "Outbox batch failed, retrying next tick");
                        }
                    }
                }
            }
        }

        tracing::info!("Outbox publisher stopped");
    }

    /// Publish up to `batch_size` of the oldest unpublished rows.
    ///
    /// Returns `Err` only when the batch could not be fetched. A publish or
    /// flag failure stops the batch and is reported in [`BatchReport`].
    pub async fn process_batch(&self) -> Result<BatchReport, AppError> {
        let _guard = self.batch_lock.lock().await;

        let entries = self.store.fetch_unpublished_outbox(self.batch_size).await?;
        let mut report = BatchReport {
            fetched: entries.len(),
            ..BatchReport::default()
        };

        for entry in &entries {
            if let Err(e) = self.publish_entry(entry).await {
                tracing::warn!(
                    outbox_id = entry.id,
                    event_id = %entry.event_id,
                    error = %e,
                    remaining = entries.len() - report.published,
                    "Publish failed, stopping batch"
                );
                report.stopped_at = Some(entry.id);
                break;
            }
            report.published += 1;
        }

        Ok(report)
    }

    async fn publish_entry(&self, entry: &OutboxEntry) -> Result<(), AppError> {
        let key = match entry.partition_key() {
            Some(key) => key.to_string(),
            None => {
                tracing::warn!(
                    outbox_id = entry.id,
                    "Outbox payload has no recipient_id, keying by event id"
                );
                entry.event_id.to_string()
            }
        };

        let record = ProducerRecord {
            topic: entry.topic.clone(),
            key,
            value: serde_json::to_vec(&entry.payload)?,
        };

        let metadata = self.producer.send(record).await?;

        // The broker already has the message; a failure here means a duplicate
        // publish on the next tick.
        self.store.mark_outbox_published(entry.id).await?;

        tracing::debug!(
            outbox_id = entry.id,
            event_id = %entry.event_id,
            partition = metadata.partition,
            offset = %metadata.offset,
            "Outbox entry published"
        );

        Ok(())
    }
}
