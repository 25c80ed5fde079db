//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub session: SessionConfig,
    pub emulation: EmulationConfig,
    pub writer: WriterConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Ports to monitor; every port speaks the same protocol
    pub ports: Vec<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            ports: vec![21, 80],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "honeypot.db".to_string(),
            max_connections: 4,
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Operator diagnostics go here, not into the event store
    pub file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: "honeypot.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub read_buffer_size: usize,
    /// 0 disables the idle timeout
    pub idle_timeout_secs: u64,
    /// 0 means unbounded fan-out
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            idle_timeout_secs: 0,
            max_sessions: 0,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmulationConfig {
    pub banner: String,
    /// Accept commands regardless of case and line terminator
    pub relaxed_commands: bool,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            banner: "220 Welcome to the honeypot server".to_string(),
            relaxed_commands: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 250,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("HONEYPOT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.ports")
                    .try_parsing(true),
            );

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate server config
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }
        if self.server.ports.is_empty() {
            anyhow::bail!("At least one port must be configured");
        }
        if self.server.ports.contains(&0) {
            anyhow::bail!("Invalid port: 0 is not allowed");
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.server.ports.iter().find(|p| !seen.insert(**p)) {
            anyhow::bail!("Port {} is configured more than once", dup);
        }

        // Validate database config
        if self.database.path.is_empty() {
            anyhow::bail!("Database path cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be at least 1");
        }

        if self.session.read_buffer_size == 0 {
            anyhow::bail!("session.read_buffer_size must be at least 1");
        }
        if self.writer.batch_size == 0 {
            anyhow::bail!("writer.batch_size must be at least 1");
        }

        // Validate logging level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid logging level '{}'. Must be one of: {:?}", self.logging.level, valid_levels);
        }
        if self.logging.file.is_empty() {
            anyhow::bail!("Log file path cannot be empty");
        }

        Ok(())
    }
}
