use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use honeytrap::config::{Config, LoggingConfig};
use honeytrap::db::{self, Database, EventStore};
use honeytrap::{handlers, shutdown};

/// How long to wait for queued events to reach the database on shutdown
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    init_logging(&config.logging)?;

    info!("Starting honeytrap...");

    let db = Database::new(&config.database)
        .await
        .with_context(|| format!("cannot open event store at {}", config.database.path))?;
    db.ensure_schema()
        .await
        .context("cannot create events table")?;
    info!("Event store ready ({} events recorded so far)", db.count().await?);

    let (writer, writer_task) = db::start_write_buffer(db.clone(), &config.writer);
    let store: Arc<dyn EventStore> = Arc::new(writer);
    let (trigger, shutdown) = shutdown::channel();

    let supervisor = handlers::start_all(&config, store, shutdown);
    tokio::pin!(supervisor);

    let stopped_on_its_own = tokio::select! {
        _ = &mut supervisor => true,
        _ = wait_for_signal() => false,
    };
    if stopped_on_its_own {
        warn!("All listeners have stopped");
    } else {
        info!("Shutdown signal received, closing listeners and sessions");
        trigger.trigger();
        supervisor.await;
    }

    // The writer task ends once the last session drops its handle
    match tokio::time::timeout(FLUSH_TIMEOUT, writer_task).await {
        Ok(Ok(())) => info!("Pending events flushed"),
        Ok(Err(e)) => error!("Write buffer task failed: {}", e),
        Err(_) => warn!("Timed out waiting for pending events to flush"),
    }
    db.close().await;

    Ok(())
}

/// Set up the operator log.
///
/// Plain text appended to `logging.file`, or structured GCP Cloud Logging
/// on stdout when LOG_FORMAT=gcp.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_lowercase()));

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.file)
            .with_context(|| format!("cannot open log file {}", config.file))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    }
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
