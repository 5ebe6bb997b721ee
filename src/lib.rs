//! Mailbox ingest: receives mail over SMTP and files it into per-tenant
//! mailboxes.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod ingest;
pub mod parser;
pub mod routing;
pub mod smtp;
pub mod store;
