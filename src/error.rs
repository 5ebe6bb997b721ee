//! Error types for the mailbox ingestion service.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mailbox persistence errors.
///
/// Everything except `NotFound` means the backend could not do its job.
/// The listener logs those and still acknowledges the message.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// True when the error means "no such record" rather than an unavailable backend.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// The raw message stream could not be decoded at all.
///
/// Missing optional headers are never a parse error; these variants cover
/// input that is not a mail message in the first place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Message is empty")]
    Empty,

    #[error("Message ends in the middle of the header section")]
    Truncated,

    #[error("Control character in header line {line}")]
    ControlCharacter { line: usize },

    #[error("Malformed header at line {line}")]
    MalformedHeader { line: usize },

    #[error("MIME structure could not be decoded")]
    Undecodable,
}

/// Per-connection listener failures. None of these escape the connection task.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Connection idle for more than {0:?}")]
    Timeout(Duration),

    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
