//! Connection handling: the supervisor, port listeners and sessions

pub mod ftp;
pub mod listener;
pub mod session;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::config::Config;
use crate::db::EventStore;
use crate::shutdown::Shutdown;

/// Session behavior shared by every listener
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub banner: String,
    pub read_buffer_size: usize,
    pub idle_timeout: Option<Duration>,
    pub relaxed_commands: bool,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            banner: config.emulation.banner.clone(),
            read_buffer_size: config.session.read_buffer_size,
            idle_timeout: config.session.idle_timeout(),
            relaxed_commands: config.emulation.relaxed_commands,
        }
    }
}

/// Everything a listener hands down to its sessions
#[derive(Clone)]
pub struct HandlerContext {
    pub store: Arc<dyn EventStore>,
    pub settings: Arc<SessionSettings>,
    /// Global cap on concurrent sessions, if configured
    pub admission: Option<Arc<Semaphore>>,
    pub shutdown: Shutdown,
}

impl HandlerContext {
    pub fn new(config: &Config, store: Arc<dyn EventStore>, shutdown: Shutdown) -> Self {
        let max_sessions = config.session.max_sessions;
        Self {
            store,
            settings: Arc::new(SessionSettings::from_config(config)),
            admission: (max_sessions > 0).then(|| Arc::new(Semaphore::new(max_sessions))),
            shutdown,
        }
    }
}

/// Start one listener per configured port and wait for all of them.
///
/// Returns only after every listener has stopped, either on shutdown or
/// because its port could not be bound.
pub async fn start_all(config: &Config, store: Arc<dyn EventStore>, shutdown: Shutdown) {
    let ctx = HandlerContext::new(config, store, shutdown);

    let listeners: Vec<_> = config
        .server
        .ports
        .iter()
        .map(|&port| {
            let host = config.server.host.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { listener::serve(&host, port, ctx).await })
        })
        .collect();
    drop(ctx);

    info!("Started {} port listeners", listeners.len());

    for result in futures::future::join_all(listeners).await {
        if let Err(e) = result {
            error!("Listener task failed: {}", e);
        }
    }
}
