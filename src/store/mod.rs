//! Persistence layer: libSQL-backed tenant mailboxes.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{MailStatus, MailboxRecord, MailboxStore, NewMailboxRecord, format_body_text};
