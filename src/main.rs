use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use mailbox_ingest::config::IngestConfig;
use mailbox_ingest::diagnostics::DeliveryLog;
use mailbox_ingest::ingest::Ingestor;
use mailbox_ingest::routing::TenantRouter;
use mailbox_ingest::smtp::SmtpServer;
use mailbox_ingest::store::LibSqlBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = IngestConfig::from_env().context("Invalid configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📬 Mailbox ingest v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   SMTP: {}:{} (max {} connections)",
        config.listener.bind, config.listener.port, config.listener.max_connections
    );
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Address marker: {}-<tenant>@…", config.address_marker);

    // ── Database ─────────────────────────────────────────────────────────
    let store = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Pipeline ─────────────────────────────────────────────────────────
    let router = TenantRouter::new(&config.address_marker)?;
    let delivery_log = Arc::new(DeliveryLog::new(config.diagnostics_capacity));
    let ingestor = Arc::new(Ingestor::new(router, store, delivery_log));

    // ── SMTP listener ────────────────────────────────────────────────────
    let server = SmtpServer::new(config.listener.clone(), ingestor);
    let listener = server.bind().await?;
    if let Ok(addr) = listener.local_addr() {
        eprintln!("   Listening on {addr}\n");
    }

    let (exit_tx, exit_rx) = watch::channel(false);
    let mut listener_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener, exit_rx).await })
    };

    tokio::select! {
        finished = &mut listener_task => return Ok(finished??),
        signal = tokio::signal::ctrl_c() => signal.context("Failed to listen for ctrl-c")?,
    }

    tracing::info!(
        open_connections = server.active_connections(),
        "Shutdown requested"
    );
    let _ = exit_tx.send(true);
    eprintln!("   Waiting for open connections, press Ctrl-C again to force exit");

    tokio::select! {
        finished = &mut listener_task => finished??,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            tracing::warn!(
                open_connections = server.active_connections(),
                "Second interrupt, dropping open connections"
            );
            listener_task.abort();
        }
    }
    Ok(())
}

/// Stderr logging, plus a daily-rotated file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mailbox-ingest.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}
