//! Write buffer for async batch inserts
//!
//! Sessions never touch the database directly. Events are sent to a channel
//! and a single task flushes them in batches, so SQLite sees one writer and
//! each session's events keep the order they were queued in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Database, EventStore, PendingEvent, StoreError};
use crate::config::WriterConfig;

/// Cloneable handle that queues events for the writer task
#[derive(Clone)]
pub struct EventWriter {
    tx: mpsc::UnboundedSender<PendingEvent>,
}

#[async_trait]
impl EventStore for EventWriter {
    async fn record(&self, timestamp: DateTime<Utc>, source_ip: &str, payload: &str) -> Result<(), StoreError> {
        self.tx
            .send(PendingEvent {
                timestamp,
                source_ip: source_ip.to_string(),
                payload: payload.to_string(),
            })
            .map_err(|_| StoreError::WriterClosed)
    }
}

/// Start the write buffer background task.
///
/// The task exits once every [`EventWriter`] clone is dropped, after
/// flushing whatever is still queued; await the handle to know it is done.
pub fn start_write_buffer(db: Database, settings: &WriterConfig) -> (EventWriter, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(write_buffer_task(db, rx, settings.batch_size, settings.flush_interval_ms));
    (EventWriter { tx }, handle)
}

async fn write_buffer_task(
    db: Database,
    mut rx: mpsc::UnboundedReceiver<PendingEvent>,
    batch_size: usize,
    flush_interval_ms: u64,
) {
    let mut pending: Vec<PendingEvent> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(Duration::from_millis(flush_interval_ms.max(1)));

    info!("Write buffer started (batch_size={}, flush_interval={}ms)", batch_size, flush_interval_ms);

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(event) = received else { break };
                pending.push(event);
                if pending.len() >= batch_size {
                    flush(&db, &mut pending).await;
                }
            }
            _ = ticker.tick(), if !pending.is_empty() => {
                flush(&db, &mut pending).await;
            }
        }
    }

    // Every EventWriter is gone
    if !pending.is_empty() {
        flush(&db, &mut pending).await;
    }
    info!("Write buffer shutting down");
}

/// Write `pending` in one transaction. If the transaction fails, fall back
/// to one insert per event so a bad event only loses itself.
async fn flush(db: &Database, pending: &mut Vec<PendingEvent>) {
    debug!("Flushing {} events", pending.len());

    if let Err(e) = db.batch_insert_events(pending).await {
        warn!("Batch of {} events failed ({}), inserting one at a time", pending.len(), e);
        for event in pending.iter() {
            if let Err(e) = db.insert_event(event).await {
                error!("Dropping event from {}: {}", event.source_ip, e);
            }
        }
    }

    pending.clear();
}
