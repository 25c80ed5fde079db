//! Database schema definitions

// AUTOINCREMENT keeps ids from being reused after deletes or restarts
pub const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp DATETIME NOT NULL,
    source_ip TEXT NOT NULL,
    command TEXT NOT NULL
)
"#;

// For correlating one peer's sessions
pub const CREATE_INDEX_SOURCE_IP: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_source_ip ON events(source_ip, id)";

pub const CREATE_INDEX_TIMESTAMP: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)";

pub const INSERT_EVENT: &str =
    "INSERT INTO events (timestamp, source_ip, command) VALUES (?, ?, ?)";
