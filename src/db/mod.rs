//! Event store
//!
//! Every observed interaction is appended to the `events` table and never
//! touched again. Concurrent writers are funneled through
//! [`write_buffer`] so SQLite only ever sees one writer.

mod schema;
pub mod write_buffer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

use crate::config::DatabaseConfig;

pub use write_buffer::{start_write_buffer, EventWriter};

/// Payload recorded when a connection is accepted
pub const CONNECTION_OPENED: &str = "Connection attempt";
/// Payload recorded when a session ends
pub const CONNECTION_CLOSED: &str = "Connection closed";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("event writer is no longer running")]
    WriterClosed,
}

/// A stored interaction, as read back from the `events` table
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub payload: String,
}

/// An interaction waiting to be written; the id is assigned on insert
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub payload: String,
}

/// Append-only sink shared by every session
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn record(&self, timestamp: DateTime<Utc>, source_ip: &str, payload: &str) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database. Pinned to a single connection, since
    /// every SQLite connection to `:memory:` gets its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Create the events table and indexes if they are missing
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(schema::CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(schema::CREATE_INDEX_SOURCE_IP)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_TIMESTAMP)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_event(&self, event: &PendingEvent) -> Result<i64, StoreError> {
        let result = sqlx::query(schema::INSERT_EVENT)
            .bind(event.timestamp)
            .bind(&event.source_ip)
            .bind(&event.payload)
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    /// Insert events in order inside one transaction
    pub async fn batch_insert_events(&self, events: &[PendingEvent]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(schema::INSERT_EVENT)
                .bind(event.timestamp)
                .bind(&event.source_ip)
                .bind(&event.payload)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// All events from one remote endpoint, oldest first
    pub async fn events_from(&self, source_ip: &str) -> Result<Vec<Event>, StoreError> {
        let rows: Vec<(i64, DateTime<Utc>, String, String)> = sqlx::query_as(
            "SELECT id, timestamp, source_ip, command FROM events WHERE source_ip = ? ORDER BY id ASC",
        )
        .bind(source_ip)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Event::from_row).collect())
    }

    /// Most recent events, newest first
    pub async fn recent_events(&self, limit: i64) -> Result<Vec<Event>, StoreError> {
        let rows: Vec<(i64, DateTime<Utc>, String, String)> = sqlx::query_as(
            "SELECT id, timestamp, source_ip, command FROM events ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Event::from_row).collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl Event {
    fn from_row((id, timestamp, source_ip, payload): (i64, DateTime<Utc>, String, String)) -> Self {
        Self {
            id,
            timestamp,
            source_ip,
            payload,
        }
    }
}

#[async_trait]
impl EventStore for Database {
    async fn record(&self, timestamp: DateTime<Utc>, source_ip: &str, payload: &str) -> Result<(), StoreError> {
        let event = PendingEvent {
            timestamp,
            source_ip: source_ip.to_string(),
            payload: payload.to_string(),
        };
        self.insert_event(&event).await.map(|_| ())
    }
}
