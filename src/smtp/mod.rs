//! Inbound SMTP listener.
//!
//! Plain-text ESMTP only. STARTTLS and AUTH are answered with 502; one
//! recipient per transaction.

pub mod command;
pub mod data;
pub mod reply;
pub mod server;
pub mod session;

pub use command::{Command, CommandError, parse_command};
pub use reply::Reply;
pub use server::SmtpServer;
pub use session::{Session, SessionState};
