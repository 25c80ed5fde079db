//! Port listener: accepts connections on one port and spawns a session each

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::session::handle_session;
use super::HandlerContext;
use crate::shutdown::Shutdown;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

pub async fn bind(host: &str, port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind((host, port)).await
}

/// Bind `port` and serve it until shutdown. A bind failure only takes this
/// port out of service.
pub async fn serve(host: &str, port: u16, ctx: HandlerContext) {
    let listener = match bind(host, port).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Cannot bind to {}:{}: {} - skipping", host, port, e);
            return;
        }
    };

    info!("Honeypot listening on port {}", port);
    serve_listener(listener, ctx).await;
}

/// Accept loop over an already bound listener
pub async fn serve_listener(listener: TcpListener, ctx: HandlerContext) {
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    let mut shutdown = ctx.shutdown.clone();
    let mut backoff = ACCEPT_BACKOFF_MIN;

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.wait() => {
                info!("Listener on port {} stopping", port);
                return;
            }
        };

        match accepted {
            Ok((socket, peer_addr)) => {
                backoff = ACCEPT_BACKOFF_MIN;
                spawn_session(socket, peer_addr, port, &ctx);
            }
            Err(e) => {
                // Persistent errors such as fd exhaustion would otherwise spin
                warn!("Accept error on port {}: {} (retrying in {:?})", port, e, backoff);
                if !back_off(backoff, &mut shutdown).await {
                    info!("Listener on port {} stopping", port);
                    return;
                }
                backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
            }
        }
    }
}

/// Sleep for `delay`; false if shutdown fired first
async fn back_off(delay: Duration, shutdown: &mut Shutdown) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.wait() => false,
    }
}

fn spawn_session(socket: TcpStream, peer_addr: SocketAddr, port: u16, ctx: &HandlerContext) {
    // accept() can win the race against an already fired shutdown
    if ctx.shutdown.is_triggered() {
        debug!("Shutting down, dropping connection from {} on port {}", peer_addr, port);
        return;
    }

    let permit = match &ctx.admission {
        Some(limit) => match limit.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                warn!("Session limit reached, dropping connection from {} on port {}", peer_addr, port);
                return;
            }
        },
        None => None,
    };

    let source_ip = peer_addr.to_string();
    let span = info_span!("session", id = %Uuid::new_v4(), peer = %source_ip, port);
    let ctx = ctx.clone();

    tokio::spawn(
        async move {
            handle_session(socket, source_ip, ctx).await;
            drop(permit);
        }
        .instrument(span),
    );
}
