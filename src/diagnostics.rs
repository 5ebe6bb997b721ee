//! Delivery log: bounded in-memory ring of recent delivery summaries.
//!
//! Holds summaries only, never message bodies. Oldest entries are evicted
//! once the capacity is reached; a capacity of zero records nothing.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// Slots allocated up front; the ring grows on demand up to its capacity.
const INITIAL_SLOTS: usize = 64;

/// What happened to one DATA transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Persisted; carries the record id.
    Stored { record_id: String },
    /// Accepted from the peer but the store was unavailable.
    StoreFailed,
    /// Rejected because the message could not be parsed.
    ParseRejected,
}

/// Summary of one delivery attempt.
#[derive(Debug, Clone, Serialize)]
pub struct DeliverySummary {
    pub external_ref: String,
    pub tenant_id: Option<String>,
    pub sender: String,
    pub recipient: String,
    pub subject: Option<String>,
    pub outcome: DeliveryOutcome,
    pub at: DateTime<Utc>,
}

/// Fixed-capacity ring of [`DeliverySummary`] entries.
pub struct DeliveryLog {
    capacity: usize,
    entries: RwLock<VecDeque<DeliverySummary>>,
}

impl DeliveryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(INITIAL_SLOTS))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a summary, evicting the oldest entry when full.
    pub async fn record(&self, summary: DeliverySummary) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.write().await;
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(summary);
    }

    /// Snapshot of the retained entries, oldest first.
    pub async fn recent(&self) -> Vec<DeliverySummary> {
        self.entries.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(external_ref: &str) -> DeliverySummary {
        DeliverySummary {
            external_ref: external_ref.into(),
            tenant_id: Some("acme".into()),
            sender: "a@x.tld".into(),
            recipient: "mail-acme@x.tld".into(),
            subject: Some("s".into()),
            outcome: DeliveryOutcome::StoreFailed,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn keeps_entries_in_order() {
        let log = DeliveryLog::new(4);
        log.record(summary("a")).await;
        log.record(summary("b")).await;

        let refs: Vec<_> = log.recent().await.into_iter().map(|s| s.external_ref).collect();
        assert_eq!(refs, ["a", "b"]);
    }

    #[tokio::test]
    async fn evicts_oldest_past_capacity() {
        let log = DeliveryLog::new(3);
        for r in ["a", "b", "c", "d", "e"] {
            log.record(summary(r)).await;
        }

        assert_eq!(log.len().await, 3);
        let refs: Vec<_> = log.recent().await.into_iter().map(|s| s.external_ref).collect();
        assert_eq!(refs, ["c", "d", "e"]);
    }

    #[tokio::test]
    async fn zero_capacity_records_nothing() {
        let log = DeliveryLog::new(0);
        log.record(summary("a")).await;
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn huge_capacity_does_not_preallocate() {
        let log = DeliveryLog::new(usize::MAX);
        log.record(summary("a")).await;
        assert_eq!(log.len().await, 1);
        assert_eq!(log.capacity(), usize::MAX);
    }

    #[tokio::test]
    async fn clear_empties_the_log() {
        let log = DeliveryLog::new(2);
        log.record(summary("a")).await;
        log.clear().await;
        assert!(log.is_empty().await);
        assert_eq!(log.capacity(), 2);
    }
}
