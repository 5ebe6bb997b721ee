//! TCP accept loop and per-connection driver.
//!
//! Each accepted socket gets its own task. A semaphore caps concurrent
//! connections; sockets over the cap are dropped before any SMTP bytes are
//! written. A `watch` channel stops the accept loop, after which the loop
//! waits for in-flight connections to finish.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use super::data::{DataBody, read_command_line, read_data};
use super::reply::Reply;
use super::session::{DataOutcome, Next, Session};
use crate::config::ListenerConfig;
use crate::error::ListenerError;
use crate::ingest::Ingestor;

/// Pause after a failed `accept()` (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct SmtpServer {
    config: ListenerConfig,
    ingestor: Arc<Ingestor>,
    connections: Arc<Semaphore>,
}

impl SmtpServer {
    pub fn new(mut config: ListenerConfig, ingestor: Arc<Ingestor>) -> Arc<Self> {
        config.max_connections = config.max_connections.min(Semaphore::MAX_PERMITS);
        let connections = Arc::new(Semaphore::new(config.max_connections));
        Arc::new(Self {
            config,
            ingestor,
            connections,
        })
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.config
            .max_connections
            .saturating_sub(self.connections.available_permits())
    }

    /// Bind the configured address, falling back to `fallback_port` when the
    /// configured port needs privileges we don't have.
    pub async fn bind(&self) -> Result<TcpListener, ListenerError> {
        let primary = format!("{}:{}", self.config.bind, self.config.port);
        match TcpListener::bind(&primary).await {
            Ok(listener) => Ok(listener),
            Err(e) => match fallback_port(e.kind(), self.config.port, self.config.fallback_port) {
                Some(port) => {
                    let fallback = format!("{}:{}", self.config.bind, port);
                    warn!(
                        "Cannot listen on {primary} ({e}), falling back to {fallback}"
                    );
                    TcpListener::bind(&fallback)
                        .await
                        .map_err(|e| ListenerError::Bind {
                            addr: fallback,
                            reason: e.to_string(),
                        })
                }
                None => Err(ListenerError::Bind {
                    addr: primary,
                    reason: e.to_string(),
                }),
            },
        }
    }

    /// Bind and serve until `must_exit` flips to `true`.
    pub async fn run(self: &Arc<Self>, must_exit: watch::Receiver<bool>) -> Result<(), ListenerError> {
        let listener = self.bind().await?;
        self.serve(listener, must_exit).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        mut must_exit: watch::Receiver<bool>,
    ) -> Result<(), ListenerError> {
        let local = listener.local_addr()?;
        info!(
            addr = %local,
            max_connections = self.config.max_connections,
            "📬 SMTP listener started"
        );

        let mut connections = FuturesUnordered::new();

        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };

            let (socket, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
                _ = wait_conn_finished => continue,
                changed = must_exit.changed() => {
                    if changed.is_err() {
                        // Sender gone; nobody can ask us to stop anymore.
                        break;
                    }
                    continue;
                }
            };

            let permit = match Arc::clone(&self.connections).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(%peer, "Connection limit reached, refusing connection");
                    drop(socket);
                    continue;
                }
            };

            debug!(%peer, "Accepted SMTP connection");
            let server = Arc::clone(self);
            connections.push(tokio::spawn(async move {
                server.handle_connection(socket, peer).await;
                drop(permit);
            }));
        }
        drop(listener);

        info!(
            in_flight = connections.len(),
            "SMTP listener stopping, waiting for open connections"
        );
        while connections.next().await.is_some() {}
        info!("SMTP listener stopped");
        Ok(())
    }

    async fn handle_connection(&self, socket: TcpStream, peer: SocketAddr) {
        match self.converse(socket, peer).await {
            Ok(()) => debug!(%peer, "SMTP connection closed"),
            Err(ListenerError::Transport(e)) => {
                debug!(%peer, "SMTP connection dropped: {e}")
            }
            Err(e) => info!(%peer, "SMTP connection terminated: {e}"),
        }
    }

    async fn converse(&self, socket: TcpStream, peer: SocketAddr) -> Result<(), ListenerError> {
        let idle = self.config.idle_timeout;
        let (read_half, write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);
        let mut session = Session::new(self.config.hostname.clone(), self.config.max_message_bytes);

        write_reply(&mut writer, &session.greeting()).await?;

        loop {
            let line = match read_command_line(&mut reader, idle).await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(ListenerError::Timeout(d)) => {
                    let _ = write_reply(&mut writer, &session.idle_timeout()).await;
                    return Err(ListenerError::Timeout(d));
                }
                Err(ListenerError::ProtocolViolation(reason)) => {
                    let _ = write_reply(&mut writer, &Reply::line_too_long()).await;
                    return Err(ListenerError::ProtocolViolation(reason));
                }
                Err(e) => return Err(e),
            };

            let action = session.handle_line(&line);
            write_reply(&mut writer, &action.reply).await?;

            match action.next {
                Next::Continue => {}
                Next::Close => return Ok(()),
                Next::Abort(reason) => {
                    debug!(%peer, state = %session.state(), command = %line, "Closing after protocol violation");
                    return Err(ListenerError::ProtocolViolation(reason));
                }
                Next::ReadData => {
                    let body = match read_data(&mut reader, self.config.max_message_bytes, idle).await {
                        Ok(body) => body,
                        Err(ListenerError::Timeout(d)) => {
                            let _ = write_reply(&mut writer, &session.idle_timeout()).await;
                            return Err(ListenerError::Timeout(d));
                        }
                        // Disconnect mid-DATA: the partial body is dropped here.
                        Err(e) => return Err(e),
                    };
                    let outcome = self.complete_transaction(&session, peer, body).await;
                    let reply = session.finish_data(outcome);
                    write_reply(&mut writer, &reply).await?;
                }
            }
        }
    }

    async fn complete_transaction(
        &self,
        session: &Session,
        peer: SocketAddr,
        body: DataBody,
    ) -> DataOutcome {
        let raw = match body {
            DataBody::Complete(raw) => raw,
            DataBody::TooLarge => {
                info!(%peer, "Message exceeded size limit, rejected");
                return DataOutcome::TooLarge;
            }
        };
        let Some(envelope) = session.envelope(Some(peer)) else {
            return DataOutcome::ParseRejected;
        };
        match self.ingestor.deliver(&envelope, raw).await {
            Ok(_) => DataOutcome::Accepted,
            Err(_) => DataOutcome::ParseRejected,
        }
    }
}

/// Port to retry on after binding `port` failed with `kind`.
///
/// Only a permission failure on a port different from the fallback warrants
/// a retry.
pub fn fallback_port(kind: io::ErrorKind, port: u16, fallback: Option<u16>) -> Option<u16> {
    match (kind, fallback) {
        (io::ErrorKind::PermissionDenied, Some(fb)) if fb != port => Some(fb),
        _ => None,
    }
}

async fn write_reply<W>(writer: &mut W, reply: &Reply) -> Result<(), ListenerError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(reply.to_wire().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
