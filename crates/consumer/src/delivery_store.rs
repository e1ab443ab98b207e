//! Per-recipient mailbox of messages seen on the broker.
//!
//! Not authoritative: it lives for the process lifetime and is rebuilt by
//! replay. The consumer runtime is the only writer; the read path takes the
//! shared side of the lock.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use uuid::Uuid;

use courier_common::types::NotificationMessage;

pub const DEFAULT_RETENTION_PER_RECIPIENT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// The mailbox already holds a message with this event id.
    Duplicate,
}

/// Mailboxes keyed by recipient.
///
/// Retention bounds each mailbox, but mailboxes are never removed, so memory
/// grows with the number of distinct recipients seen since startup.
pub struct DeliveryStore {
    mailboxes: RwLock<HashMap<Uuid, VecDeque<NotificationMessage>>>,
    retention: usize,
}

impl DeliveryStore {
    pub fn new(retention_per_recipient: usize) -> Self {
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            retention: retention_per_recipient.max(1),
        }
    }

    /// Append `message` to its recipient's mailbox unless a message with the
    /// same id is already retained. Evicts the oldest message past the
    /// retention limit.
    pub fn upsert(&self, message: NotificationMessage) -> UpsertOutcome {
        let mut mailboxes = self.mailboxes.write();
        let mailbox = mailboxes.entry(message.recipient_id).or_default();

        if mailbox.iter().any(|m| m.id == message.id) {
            return UpsertOutcome::Duplicate;
        }

        mailbox.push_back(message);
        while mailbox.len() > self.retention {
            mailbox.pop_front();
        }
        UpsertOutcome::Inserted
    }

    /// Messages for `recipient` in arrival order.
    pub fn get(&self, recipient: Uuid) -> Vec<NotificationMessage> {
        self.mailboxes
            .read()
            .get(&recipient)
            .map(|mailbox| mailbox.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn recipient_count(&self) -> usize {
        self.mailboxes.read().len()
    }

    pub fn total_len(&self) -> usize {
        self.mailboxes.read().values().map(VecDeque::len).sum()
    }
}

impl Default for DeliveryStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_PER_RECIPIENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_common::types::{Channel, NotificationType, Priority};

    fn message(recipient: Uuid, text: &str) -> NotificationMessage {
        NotificationMessage {
            id: Uuid::new_v4(),
            recipient_id: recipient,
            notification_type: NotificationType::LeagueUpdate,
            channel: Channel::InApp,
            priority: Priority::Low,
            title: None,
            message: text.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_arrival_order_per_recipient() {
        let store = DeliveryStore::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.upsert(message(a, "a1"));
        store.upsert(message(b, "b1"));
        store.upsert(message(a, "a2"));

        let texts: Vec<String> = store.get(a).into_iter().map(|m| m.message).collect();
        assert_eq!(texts, vec!["a1", "a2"]);
        assert_eq!(store.recipient_count(), 2);
        assert_eq!(store.total_len(), 3);
        assert!(store.get(Uuid::new_v4()).is_empty());
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let store = DeliveryStore::default();
        let m = message(Uuid::new_v4(), "once");

        assert_eq!(store.upsert(m.clone()), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(m.clone()), UpsertOutcome::Duplicate);
        assert_eq!(store.get(m.recipient_id).len(), 1);
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let store = DeliveryStore::new(2);
        let r = Uuid::new_v4();
        for text in ["m1", "m2", "m3"] {
            store.upsert(message(r, text));
        }

        let texts: Vec<String> = store.get(r).into_iter().map(|m| m.message).collect();
        assert_eq!(texts, vec!["m2", "m3"]);
    }

    #[test]
    fn test_memory_bounded_per_recipient() {
        let store = DeliveryStore::new(3);
        for _ in 0..50 {
            let r = Uuid::new_v4();
            for i in 0..5 {
                store.upsert(message(r, &format!("m{}", i)));
            }
        }

        assert_eq!(store.recipient_count(), 50);
        assert_eq!(store.total_len(), 50 * 3);
    }
}
