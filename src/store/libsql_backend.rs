//! libSQL backend: async `MailboxStore` implementation.
//!
//! Supports local file and in-memory databases. SQLite serializes writes,
//! so connection tasks share one handle without any lock of their own.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{
    MailStatus, MailboxRecord, MailboxStore, NewMailboxRecord, format_body_text,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Run all pending schema migrations.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_records(
        &self,
        op: &str,
        sql: &str,
        args: impl libsql::params::IntoParams,
    ) -> Result<Vec<MailboxRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| StoreError::Query(format!("{op}: {e}")))?;

        let mut records = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => match row_to_record(&row) {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!("Skipping mailbox row: {e}"),
                },
                Ok(None) => break,
                Err(e) => return Err(StoreError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(records)
    }

    async fn query_one(
        &self,
        op: &str,
        sql: &str,
        args: impl libsql::params::IntoParams,
    ) -> Result<Option<MailboxRecord>, StoreError> {
        Ok(self.query_records(op, sql, args).await?.into_iter().next())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn map_insert_error(e: libsql::Error) -> StoreError {
    let message = e.to_string();
    if message.contains("UNIQUE") {
        StoreError::Constraint(format!("insert_record: {message}"))
    } else {
        StoreError::Query(format!("insert_record: {message}"))
    }
}

const RECORD_COLUMNS: &str = "id, tenant_id, external_ref, sender, recipient, subject, body_text, status, received_at, read_at, metadata, created_at, updated_at";

/// Map a libsql Row to a MailboxRecord. Column order matches `RECORD_COLUMNS`.
fn row_to_record(row: &libsql::Row) -> Result<MailboxRecord, StoreError> {
    let get_text = |idx: i32| -> Result<String, StoreError> {
        row.get::<String>(idx)
            .map_err(|e| StoreError::Serialization(format!("column {idx}: {e}")))
    };

    let status: MailStatus = get_text(7)?.parse()?;
    let read_at: Option<String> = row.get::<String>(9).ok();
    let metadata = row
        .get::<String>(10)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok());

    Ok(MailboxRecord {
        id: get_text(0)?,
        tenant_id: get_text(1)?,
        external_ref: get_text(2)?,
        sender: get_text(3)?,
        recipient: get_text(4)?,
        subject: get_text(5)?,
        body_text: get_text(6)?,
        status,
        received_at: parse_datetime(&get_text(8)?),
        read_at: parse_optional_datetime(&read_at),
        metadata,
        created_at: parse_datetime(&get_text(11)?),
        updated_at: parse_datetime(&get_text(12)?),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl MailboxStore for LibSqlBackend {
    async fn insert_record(&self, new: NewMailboxRecord) -> Result<MailboxRecord, StoreError> {
        let now = Utc::now();
        let record = MailboxRecord {
            id: Uuid::new_v4().to_string(),
            body_text: format_body_text(&new.message.subject, &new.message.body_text),
            tenant_id: new.tenant_id,
            external_ref: new.external_ref,
            sender: new.message.sender,
            recipient: new.message.recipient,
            subject: new.message.subject,
            status: MailStatus::Unread,
            received_at: new.received_at,
            read_at: None,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };

        let metadata = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO mailbox_records ({RECORD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10, ?11, ?11)"
                ),
                params![
                    record.id.clone(),
                    record.tenant_id.clone(),
                    record.external_ref.clone(),
                    record.sender.clone(),
                    record.recipient.clone(),
                    record.subject.clone(),
                    record.body_text.clone(),
                    record.status.as_str(),
                    format_datetime(&record.received_at),
                    opt_text_owned(metadata),
                    format_datetime(&now),
                ],
            )
            .await
            .map_err(map_insert_error)?;

        debug!(
            id = %record.id,
            tenant = %record.tenant_id,
            external_ref = %record.external_ref,
            "Mailbox record inserted"
        );
        Ok(record)
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<MailboxRecord>, StoreError> {
        self.query_records(
            "list_by_tenant",
            &format!(
                "SELECT {RECORD_COLUMNS} FROM mailbox_records
                 WHERE tenant_id = ?1 ORDER BY received_at ASC, rowid ASC"
            ),
            params![tenant_id],
        )
        .await
    }

    async fn list_unread(&self, tenant_id: &str) -> Result<Vec<MailboxRecord>, StoreError> {
        self.query_records(
            "list_unread",
            &format!(
                "SELECT {RECORD_COLUMNS} FROM mailbox_records
                 WHERE tenant_id = ?1 AND status = 'unread'
                 ORDER BY received_at ASC, rowid ASC"
            ),
            params![tenant_id],
        )
        .await
    }

    async fn mark_read(&self, record_id: &str) -> Result<(), StoreError> {
        let now = format_datetime(&Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE mailbox_records SET status = 'read', read_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'unread'",
                params![now, record_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark_read: {e}")))?;

        if changed == 0 {
            if self.get_record(record_id).await?.is_none() {
                return Err(StoreError::NotFound {
                    entity: "mailbox_record".into(),
                    id: record_id.to_string(),
                });
            }
            debug!(id = record_id, "Mailbox record already read");
            return Ok(());
        }

        debug!(id = record_id, "Mailbox record marked read");
        Ok(())
    }

    async fn get_record(&self, record_id: &str) -> Result<Option<MailboxRecord>, StoreError> {
        self.query_one(
            "get_record",
            &format!("SELECT {RECORD_COLUMNS} FROM mailbox_records WHERE id = ?1"),
            params![record_id],
        )
        .await
    }

    async fn get_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<MailboxRecord>, StoreError> {
        self.query_one(
            "get_by_external_ref",
            &format!("SELECT {RECORD_COLUMNS} FROM mailbox_records WHERE external_ref = ?1"),
            params![external_ref],
        )
        .await
    }

    async fn count_unread(&self, tenant_id: &str) -> Result<usize, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM mailbox_records WHERE tenant_id = ?1 AND status = 'unread'",
                params![tenant_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("count_unread: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("count_unread: {e}")))?;
                Ok(count as usize)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(StoreError::Query(format!("count_unread: {e}"))),
        }
    }
}
