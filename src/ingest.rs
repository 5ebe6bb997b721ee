//! Ingestion pipeline: parse, route and persist one received message.
//!
//! The router, store and delivery log are handed in at construction time;
//! the listener owns an `Arc<Ingestor>` and calls [`Ingestor::deliver`] once
//! per DATA transaction.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::diagnostics::{DeliveryLog, DeliveryOutcome, DeliverySummary};
use crate::error::ParseError;
use crate::parser;
use crate::routing::TenantRouter;
use crate::store::{MailboxRecord, MailboxStore, NewMailboxRecord};

/// Envelope of one SMTP transaction.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub mail_from: String,
    pub rcpt_to: String,
    pub peer: Option<SocketAddr>,
}

/// Result of a delivery whose message parsed.
#[derive(Debug, Clone)]
pub enum DeliveryStatus {
    Stored(MailboxRecord),
    /// The store failed. The message is still acknowledged to the peer.
    StoreUnavailable,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub external_ref: String,
    pub tenant_id: String,
    pub status: DeliveryStatus,
}

/// Parser → router → store, with the shared dependencies injected.
pub struct Ingestor {
    router: TenantRouter,
    store: Arc<dyn MailboxStore>,
    log: Arc<DeliveryLog>,
}

impl Ingestor {
    pub fn new(router: TenantRouter, store: Arc<dyn MailboxStore>, log: Arc<DeliveryLog>) -> Self {
        Self { router, store, log }
    }

    pub fn store(&self) -> &Arc<dyn MailboxStore> {
        &self.store
    }

    pub fn delivery_log(&self) -> &Arc<DeliveryLog> {
        &self.log
    }

    /// Deliver one raw message.
    ///
    /// A parse failure is returned to the caller so the transaction can be
    /// rejected. A store failure is logged and reported as
    /// [`DeliveryStatus::StoreUnavailable`]; it never fails the call.
    pub async fn deliver(&self, envelope: &Envelope, raw: Vec<u8>) -> Result<Delivery, ParseError> {
        let external_ref = new_external_ref();

        let message = match parser::parse_owned(raw).await {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    external_ref = %external_ref,
                    mail_from = %envelope.mail_from,
                    rcpt_to = %envelope.rcpt_to,
                    "Rejecting unparseable message: {e}"
                );
                self.log
                    .record(DeliverySummary {
                        external_ref,
                        tenant_id: None,
                        sender: envelope.mail_from.clone(),
                        recipient: envelope.rcpt_to.clone(),
                        subject: None,
                        outcome: DeliveryOutcome::ParseRejected,
                        at: Utc::now(),
                    })
                    .await;
                return Err(e);
            }
        };

        let tenant_id = self.router.resolve_tenant(&envelope.rcpt_to);
        let mut summary = DeliverySummary {
            external_ref: external_ref.clone(),
            tenant_id: Some(tenant_id.clone()),
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            subject: Some(message.subject.clone()),
            outcome: DeliveryOutcome::StoreFailed,
            at: Utc::now(),
        };

        let metadata = serde_json::json!({
            "mail_from": envelope.mail_from,
            "rcpt_to": envelope.rcpt_to,
            "message_id": message.message_id,
            "peer": envelope.peer.map(|p| p.to_string()),
        });

        let status = match self
            .store
            .insert_record(NewMailboxRecord {
                tenant_id: tenant_id.clone(),
                external_ref: external_ref.clone(),
                message,
                received_at: Utc::now(),
                metadata: Some(metadata),
            })
            .await
        {
            Ok(record) => {
                info!(
                    record_id = %record.id,
                    tenant = %tenant_id,
                    sender = %record.sender,
                    "📧 Mail stored"
                );
                summary.outcome = DeliveryOutcome::Stored {
                    record_id: record.id.clone(),
                };
                DeliveryStatus::Stored(record)
            }
            Err(e) => {
                error!(
                    external_ref = %external_ref,
                    tenant = %tenant_id,
                    "Failed to store mail, acknowledging anyway: {e}"
                );
                DeliveryStatus::StoreUnavailable
            }
        };

        self.log.record(summary).await;

        Ok(Delivery {
            external_ref,
            tenant_id,
            status,
        })
    }
}

/// `smtp_<unix-millis>_<uuid>`, unique per transaction.
fn new_external_ref() -> String {
    format!(
        "smtp_{}_{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::StoreError;
    use crate::store::{LibSqlBackend, MailStatus};

    /// Store whose backend is always down.
    struct DownStore;

    #[async_trait]
    impl MailboxStore for DownStore {
        async fn insert_record(&self, _: NewMailboxRecord) -> Result<MailboxRecord, StoreError> {
            Err(StoreError::Pool("backend offline".into()))
        }
        async fn list_by_tenant(&self, _: &str) -> Result<Vec<MailboxRecord>, StoreError> {
            Err(StoreError::Pool("backend offline".into()))
        }
        async fn list_unread(&self, _: &str) -> Result<Vec<MailboxRecord>, StoreError> {
            Err(StoreError::Pool("backend offline".into()))
        }
        async fn mark_read(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Pool("backend offline".into()))
        }
        async fn get_record(&self, _: &str) -> Result<Option<MailboxRecord>, StoreError> {
            Err(StoreError::Pool("backend offline".into()))
        }
        async fn get_by_external_ref(&self, _: &str) -> Result<Option<MailboxRecord>, StoreError> {
            Err(StoreError::Pool("backend offline".into()))
        }
        async fn count_unread(&self, _: &str) -> Result<usize, StoreError> {
            Err(StoreError::Pool("backend offline".into()))
        }
    }

    fn envelope(rcpt: &str) -> Envelope {
        Envelope {
            mail_from: "alice@example.com".into(),
            rcpt_to: rcpt.into(),
            peer: None,
        }
    }

    const RAW: &str = "From: alice@example.com\r\nTo: someone@x.tld\r\nSubject: Invoice\r\n\r\nPlease review\r\n";

    async fn memory_ingestor() -> (Ingestor, Arc<LibSqlBackend>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let ingestor = Ingestor::new(
            TenantRouter::default(),
            store.clone(),
            Arc::new(DeliveryLog::new(10)),
        );
        (ingestor, store)
    }

    #[tokio::test]
    async fn routes_by_envelope_recipient() {
        let (ingestor, store) = memory_ingestor().await;
        let delivery = ingestor
            .deliver(&envelope("mail-acme@x.tld"), RAW.as_bytes().to_vec())
            .await
            .unwrap();

        assert_eq!(delivery.tenant_id, "acme");
        assert!(delivery.external_ref.starts_with("smtp_"));

        let records = store.list_by_tenant("acme").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, MailStatus::Unread);
        assert_eq!(records[0].external_ref, delivery.external_ref);
        assert!(records[0].body_text.contains("Invoice"));
        assert!(records[0].body_text.contains("Please review"));

        let meta = records[0].metadata.as_ref().unwrap();
        assert_eq!(meta["rcpt_to"], "mail-acme@x.tld");
        assert_eq!(meta["mail_from"], "alice@example.com");
    }

    #[tokio::test]
    async fn unmatched_recipient_goes_to_default() {
        let (ingestor, store) = memory_ingestor().await;
        ingestor
            .deliver(&envelope("bad-address-no-marker@x.tld"), RAW.as_bytes().to_vec())
            .await
            .unwrap();
        assert_eq!(store.list_by_tenant("default").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn parse_failure_stores_nothing() {
        let (ingestor, store) = memory_ingestor().await;
        let result = ingestor
            .deliver(&envelope("mail-acme@x.tld"), b"\x00\x01\x02garbage".to_vec())
            .await;
        assert!(result.is_err());
        assert!(store.list_by_tenant("acme").await.unwrap().is_empty());

        let log = ingestor.delivery_log().recent().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, DeliveryOutcome::ParseRejected);
    }

    #[tokio::test]
    async fn store_failure_degrades_to_acknowledged() {
        let ingestor = Ingestor::new(
            TenantRouter::default(),
            Arc::new(DownStore),
            Arc::new(DeliveryLog::new(10)),
        );
        let delivery = ingestor
            .deliver(&envelope("mail-acme@x.tld"), RAW.as_bytes().to_vec())
            .await
            .unwrap();
        assert!(matches!(delivery.status, DeliveryStatus::StoreUnavailable));

        let log = ingestor.delivery_log().recent().await;
        assert_eq!(log[0].outcome, DeliveryOutcome::StoreFailed);
        assert_eq!(log[0].tenant_id.as_deref(), Some("acme"));
    }

    #[test]
    fn external_refs_are_unique() {
        assert_ne!(new_external_ref(), new_external_ref());
    }
}
