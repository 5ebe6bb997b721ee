//! `MailboxStore` trait: the async interface for mailbox persistence.
//!
//! The listener only calls [`MailboxStore::persist`]. The listing and
//! read-state operations are the query surface used by the dashboard.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::parser::NormalizedMessage;

/// Read state of a mailbox record. Moves only from `Unread` to `Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailStatus {
    Unread,
    Read,
}

impl MailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailStatus::Unread => "unread",
            MailStatus::Read => "read",
        }
    }
}

impl fmt::Display for MailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MailStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unread" => Ok(MailStatus::Unread),
            "read" => Ok(MailStatus::Read),
            other => Err(StoreError::Serialization(format!(
                "unknown mail status {other:?}"
            ))),
        }
    }
}

/// A persisted message in a tenant's mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxRecord {
    pub id: String,
    pub tenant_id: String,
    /// Correlates the record with the SMTP transaction that produced it.
    pub external_ref: String,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    /// Subject and body joined by [`format_body_text`].
    pub body_text: String,
    pub status: MailStatus,
    pub received_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    /// Envelope details as a JSON object.
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to insert a new record.
#[derive(Debug, Clone)]
pub struct NewMailboxRecord {
    pub tenant_id: String,
    pub external_ref: String,
    pub message: NormalizedMessage,
    pub received_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// Display text stored for a record: the subject line, a blank line, then the body.
pub fn format_body_text(subject: &str, body: &str) -> String {
    if body.is_empty() {
        format!("📧 **{subject}**")
    } else {
        format!("📧 **{subject}**\n\n{body}")
    }
}

/// Backend-agnostic mailbox persistence.
#[async_trait]
pub trait MailboxStore: Send + Sync {
    /// Insert a full record description. Status starts as `Unread`.
    async fn insert_record(&self, record: NewMailboxRecord) -> Result<MailboxRecord, StoreError>;

    /// Persist a parsed message under `tenant_id`, received now.
    async fn persist(
        &self,
        tenant_id: &str,
        message: NormalizedMessage,
        external_ref: &str,
    ) -> Result<MailboxRecord, StoreError> {
        self.insert_record(NewMailboxRecord {
            tenant_id: tenant_id.to_string(),
            external_ref: external_ref.to_string(),
            message,
            received_at: Utc::now(),
            metadata: None,
        })
        .await
    }

    /// All records for a tenant, oldest first. Equal timestamps keep insertion order.
    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<MailboxRecord>, StoreError>;

    /// Unread records for a tenant, same order as [`MailboxStore::list_by_tenant`].
    async fn list_unread(&self, tenant_id: &str) -> Result<Vec<MailboxRecord>, StoreError>;

    /// Mark a record read. Already-read records are left untouched.
    /// Fails with `NotFound` when the id does not exist.
    async fn mark_read(&self, record_id: &str) -> Result<(), StoreError>;

    /// Get a record by ID.
    async fn get_record(&self, record_id: &str) -> Result<Option<MailboxRecord>, StoreError>;

    /// Look up a record by its transaction reference.
    async fn get_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<MailboxRecord>, StoreError>;

    /// Number of unread records for a tenant.
    async fn count_unread(&self, tenant_id: &str) -> Result<usize, StoreError>;
}
