//! Per-connection SMTP state machine.
//!
//! Pure and synchronous: it maps commands to replies and state transitions
//! and leaves all I/O to the server loop.
//!
//! ```text
//! Connected ──MAIL──▶ MailFromReceived ──RCPT──▶ RecipientAccepted ──DATA──▶ DataReceiving
//!     ▲                                                                        │
//!     └──────────── MAIL starts a new transaction ◀── Completed / Rejected ◀───┘
//! ```

use std::fmt;
use std::net::SocketAddr;

use super::command::{Command, parse_command};
use super::reply::Reply;
use crate::ingest::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    MailFromReceived,
    RecipientAccepted,
    DataReceiving,
    Completed,
    Rejected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::MailFromReceived => "mail_from_received",
            Self::RecipientAccepted => "recipient_accepted",
            Self::DataReceiving => "data_receiving",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    /// States from which a new transaction may start.
    fn is_idle(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed | Self::Rejected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the server loop must do after sending the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Continue,
    /// Switch to reading the message body.
    ReadData,
    /// Peer asked to quit.
    Close,
    /// Protocol violation; close the connection.
    Abort(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub reply: Reply,
    pub next: Next,
}

impl Action {
    fn reply(reply: Reply) -> Self {
        Self {
            reply,
            next: Next::Continue,
        }
    }
}

/// How the DATA phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// Parsed and handed to the store (stored or not).
    Accepted,
    ParseRejected,
    TooLarge,
}

pub struct Session {
    hostname: String,
    max_message_bytes: usize,
    state: SessionState,
    mail_from: Option<String>,
    rcpt_to: Option<String>,
}

impl Session {
    pub fn new(hostname: impl Into<String>, max_message_bytes: usize) -> Self {
        Self {
            hostname: hostname.into(),
            max_message_bytes,
            state: SessionState::Connected,
            mail_from: None,
            rcpt_to: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn greeting(&self) -> Reply {
        Reply::greeting(&self.hostname)
    }

    pub fn idle_timeout(&self) -> Reply {
        Reply::idle_timeout(&self.hostname)
    }

    /// Envelope of the current transaction, if a recipient was accepted.
    pub fn envelope(&self, peer: Option<SocketAddr>) -> Option<Envelope> {
        Some(Envelope {
            mail_from: self.mail_from.clone()?,
            rcpt_to: self.rcpt_to.clone()?,
            peer,
        })
    }

    /// Parse and apply one command line.
    pub fn handle_line(&mut self, line: &str) -> Action {
        match parse_command(line) {
            Ok(command) => self.handle(command),
            Err(e) => {
                // Malformed envelope command: the transaction is over but
                // the connection stays usable.
                self.reset_transaction(SessionState::Rejected);
                Action::reply(Reply::syntax_error(&e.to_string()))
            }
        }
    }

    pub fn handle(&mut self, command: Command) -> Action {
        if self.state == SessionState::DataReceiving {
            // The server loop reads the body itself; any command seen here
            // means the loop skipped `finish_data`.
            return self.violation("command during DATA");
        }

        match command {
            Command::Helo(client) => {
                self.reset_transaction(SessionState::Connected);
                Action::reply(Reply::helo(&self.hostname, &client))
            }
            Command::Ehlo(client) => {
                self.reset_transaction(SessionState::Connected);
                Action::reply(Reply::ehlo(&self.hostname, &client, self.max_message_bytes))
            }
            Command::MailFrom(sender) => {
                if !self.state.is_idle() {
                    return self.violation("nested MAIL command");
                }
                self.mail_from = Some(sender);
                self.rcpt_to = None;
                self.state = SessionState::MailFromReceived;
                Action::reply(Reply::sender_ok())
            }
            Command::RcptTo(recipient) => match self.state {
                SessionState::MailFromReceived => {
                    self.rcpt_to = Some(recipient);
                    self.state = SessionState::RecipientAccepted;
                    Action::reply(Reply::recipient_ok())
                }
                // One recipient per transaction.
                SessionState::RecipientAccepted => Action::reply(Reply::too_many_recipients()),
                _ => self.violation("RCPT before MAIL"),
            },
            Command::Data => {
                if self.state != SessionState::RecipientAccepted {
                    return self.violation("DATA before RCPT");
                }
                self.state = SessionState::DataReceiving;
                Action {
                    reply: Reply::start_data(),
                    next: Next::ReadData,
                }
            }
            Command::Rset => {
                self.reset_transaction(SessionState::Connected);
                Action::reply(Reply::ok())
            }
            Command::Noop => Action::reply(Reply::ok()),
            Command::Quit => Action {
                reply: Reply::closing(&self.hostname),
                next: Next::Close,
            },
            Command::NotImplemented(verb) => Action::reply(Reply::not_implemented(&verb)),
            Command::Unknown(verb) => Action::reply(Reply::unrecognized(&verb)),
        }
    }

    /// Close the DATA phase and produce the final reply for the transaction.
    pub fn finish_data(&mut self, outcome: DataOutcome) -> Reply {
        let (state, reply) = match outcome {
            DataOutcome::Accepted => (SessionState::Completed, Reply::accepted()),
            DataOutcome::ParseRejected => (SessionState::Rejected, Reply::unparseable()),
            DataOutcome::TooLarge => (
                SessionState::Rejected,
                Reply::message_too_large(self.max_message_bytes),
            ),
        };
        self.reset_transaction(state);
        reply
    }

    fn reset_transaction(&mut self, state: SessionState) {
        self.mail_from = None;
        self.rcpt_to = None;
        self.state = state;
    }

    fn violation(&mut self, detail: &str) -> Action {
        self.reset_transaction(SessionState::Rejected);
        Action {
            reply: Reply::bad_sequence(detail),
            next: Next::Abort(detail.to_string()),
        }
    }
}
