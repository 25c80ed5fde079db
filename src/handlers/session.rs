//! Per-connection interaction loop
//!
//! A session records an "opened" event, sends the banner, then records and
//! answers every chunk it reads until the peer goes away. The "closed"
//! event is always the last thing a session records.

use chrono::Utc;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::{ftp, HandlerContext, SessionSettings};
use crate::db::{EventStore, CONNECTION_CLOSED, CONNECTION_OPENED};
use crate::shutdown::Shutdown;

/// Why a session ended; only logged, never sent to the peer
#[derive(Debug)]
pub enum CloseReason {
    PeerClosed,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
    IdleTimeout,
    Shutdown,
}

/// Drive one accepted connection until it closes.
///
/// `source_ip` is the remote endpoint as `ip:port`.
pub async fn handle_session<S>(mut stream: S, source_ip: String, ctx: HandlerContext)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let HandlerContext {
        store,
        settings,
        mut shutdown,
        ..
    } = ctx;

    record(store.as_ref(), &source_ip, CONNECTION_OPENED).await;

    let reason = exchange(&mut stream, &source_ip, store.as_ref(), &settings, &mut shutdown).await;
    debug!("Session with {} closed: {:?}", source_ip, reason);

    record(store.as_ref(), &source_ip, CONNECTION_CLOSED).await;
}

async fn exchange<S>(
    stream: &mut S,
    source_ip: &str,
    store: &dyn EventStore,
    settings: &SessionSettings,
    shutdown: &mut Shutdown,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(reason) = send_line(stream, &settings.banner, settings.idle_timeout, shutdown).await {
        return reason;
    }

    let mut buf = vec![0u8; settings.read_buffer_size];
    loop {
        let read = tokio::select! {
            read = read_chunk(stream, &mut buf, settings.idle_timeout) => read,
            _ = shutdown.wait() => return CloseReason::Shutdown,
        };

        let n = match read {
            Ok(0) => return CloseReason::PeerClosed,
            Ok(n) => n,
            Err(reason) => return reason,
        };

        let input = String::from_utf8_lossy(&buf[..n]);
        record(store, source_ip, &input).await;

        let reply = ftp::reply_for(&input, settings.relaxed_commands);
        if let Err(reason) = send_line(stream, reply, settings.idle_timeout, shutdown).await {
            return reason;
        }
    }
}

async fn read_chunk<S>(stream: &mut S, buf: &mut [u8], idle_timeout: Option<Duration>) -> Result<usize, CloseReason>
where
    S: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, stream.read(buf)).await {
            Ok(read) => read.map_err(CloseReason::ReadFailed),
            Err(_) => Err(CloseReason::IdleTimeout),
        },
        None => stream.read(buf).await.map_err(CloseReason::ReadFailed),
    }
}

/// Write one line, giving up on shutdown or when a peer that stopped
/// reading keeps the write blocked past the idle timeout
async fn send_line<S>(
    stream: &mut S,
    line: &str,
    idle_timeout: Option<Duration>,
    shutdown: &mut Shutdown,
) -> Result<(), CloseReason>
where
    S: AsyncWrite + Unpin,
{
    let write = async {
        match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, write_line(stream, line)).await {
                Ok(written) => written.map_err(CloseReason::WriteFailed),
                Err(_) => Err(CloseReason::IdleTimeout),
            },
            None => write_line(stream, line).await.map_err(CloseReason::WriteFailed),
        }
    };

    tokio::select! {
        written = write => written,
        _ = shutdown.wait() => Err(CloseReason::Shutdown),
    }
}

async fn write_line<S>(stream: &mut S, line: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(format!("{}\n", line).as_bytes()).await?;
    stream.flush().await
}

async fn record(store: &dyn EventStore, source_ip: &str, payload: &str) {
    if let Err(e) = store.record(Utc::now(), source_ip, payload).await {
        warn!("Failed to record event from {}: {}", source_ip, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::StoreError;
    use crate::shutdown;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::{Arc, Mutex};
    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream};

    /// Store that remembers payloads in memory, optionally failing every write
    #[derive(Default)]
    struct MemoryStore {
        payloads: Mutex<Vec<String>>,
        failing: bool,
    }

    #[async_trait]
    impl EventStore for MemoryStore {
        async fn record(&self, _timestamp: DateTime<Utc>, _source_ip: &str, payload: &str) -> Result<(), StoreError> {
            if self.failing {
                return Err(StoreError::WriterClosed);
            }
            self.payloads.lock().unwrap().push(payload.to_string());
            Ok(())
        }
    }

    impl MemoryStore {
        fn payloads(&self) -> Vec<String> {
            self.payloads.lock().unwrap().clone()
        }
    }

    fn context(store: Arc<MemoryStore>, config: &Config) -> (shutdown::ShutdownTrigger, HandlerContext) {
        let (trigger, shutdown) = shutdown::channel();
        (trigger, HandlerContext::new(config, store, shutdown))
    }

    async fn read_line(reader: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn login_exchange_is_recorded_in_order() {
        let store = Arc::new(MemoryStore::default());
        let (_trigger, ctx) = context(store.clone(), &Config::default());
        let (client, server) = duplex(4096);
        let session = tokio::spawn(handle_session(server, "203.0.113.5:40000".to_string(), ctx));

        let mut client = BufReader::new(client);
        assert_eq!(read_line(&mut client).await, "220 Welcome to the honeypot server\n");

        client.get_mut().write_all(b"USER anonymous\r\n").await.unwrap();
        assert_eq!(read_line(&mut client).await, "331 Please specify the password.\n");

        client.get_mut().write_all(b"PASS password\r\n").await.unwrap();
        assert_eq!(read_line(&mut client).await, "230 Login successful.\n");

        client.get_mut().write_all(b"LIST\r\n").await.unwrap();
        assert_eq!(read_line(&mut client).await, "500 Unknown command.\n");

        drop(client);
        session.await.unwrap();

        assert_eq!(
            store.payloads(),
            vec![
                CONNECTION_OPENED,
                "USER anonymous\r\n",
                "PASS password\r\n",
                "LIST\r\n",
                CONNECTION_CLOSED,
            ]
        );
    }

    #[tokio::test]
    async fn oversized_input_is_recorded_per_read() {
        let store = Arc::new(MemoryStore::default());
        let mut config = Config::default();
        config.session.read_buffer_size = 8;
        let (_trigger, ctx) = context(store.clone(), &config);
        let (client, server) = duplex(4096);
        let session = tokio::spawn(handle_session(server, "203.0.113.6:1".to_string(), ctx));

        let mut client = BufReader::new(client);
        read_line(&mut client).await;
        client.get_mut().write_all(b"0123456789abcdef").await.unwrap();
        assert_eq!(read_line(&mut client).await, "500 Unknown command.\n");
        assert_eq!(read_line(&mut client).await, "500 Unknown command.\n");

        drop(client);
        session.await.unwrap();

        let payloads = store.payloads();
        assert_eq!(payloads.len(), 4);
        assert_eq!(payloads[1], "01234567");
        assert_eq!(payloads[2], "89abcdef");
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_rejected() {
        let store = Arc::new(MemoryStore::default());
        let (_trigger, ctx) = context(store.clone(), &Config::default());
        let (client, server) = duplex(4096);
        let session = tokio::spawn(handle_session(server, "203.0.113.7:1".to_string(), ctx));

        let mut client = BufReader::new(client);
        read_line(&mut client).await;
        client.get_mut().write_all(&[0xff, 0xfe, b'A', 0x00]).await.unwrap();
        assert_eq!(read_line(&mut client).await, "500 Unknown command.\n");

        drop(client);
        session.await.unwrap();
        assert_eq!(store.payloads()[1], "\u{fffd}\u{fffd}A\u{0}");
    }

    #[tokio::test]
    async fn store_failures_do_not_end_the_session() {
        let store = Arc::new(MemoryStore {
            failing: true,
            ..MemoryStore::default()
        });
        let (_trigger, ctx) = context(store, &Config::default());
        let (client, server) = duplex(4096);
        let session = tokio::spawn(handle_session(server, "203.0.113.8:1".to_string(), ctx));

        let mut client = BufReader::new(client);
        read_line(&mut client).await;
        client.get_mut().write_all(b"USER anonymous\r\n").await.unwrap();
        assert_eq!(read_line(&mut client).await, "331 Please specify the password.\n");

        drop(client);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn relaxed_matching_accepts_bare_newlines() {
        let store = Arc::new(MemoryStore::default());
        let mut config = Config::default();
        config.emulation.relaxed_commands = true;
        let (_trigger, ctx) = context(store.clone(), &config);
        let (client, server) = duplex(4096);
        let session = tokio::spawn(handle_session(server, "203.0.113.9:1".to_string(), ctx));

        let mut client = BufReader::new(client);
        read_line(&mut client).await;
        client.get_mut().write_all(b"user anonymous\n").await.unwrap();
        assert_eq!(read_line(&mut client).await, "331 Please specify the password.\n");

        drop(client);
        session.await.unwrap();
        assert_eq!(store.payloads()[1], "user anonymous\n");
    }

    #[tokio::test]
    async fn idle_peer_is_disconnected() {
        let store = Arc::new(MemoryStore::default());
        let mut config = Config::default();
        config.session.idle_timeout_secs = 1;
        let (_trigger, ctx) = context(store.clone(), &config);
        let (client, server) = duplex(4096);
        let session = tokio::spawn(handle_session(server, "203.0.113.10:1".to_string(), ctx));

        let mut client = BufReader::new(client);
        read_line(&mut client).await;
        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.payloads(), vec![CONNECTION_OPENED, CONNECTION_CLOSED]);
        // Server side is gone, so the client sees EOF
        assert_eq!(read_line(&mut client).await, "");
    }

    #[tokio::test]
    async fn shutdown_closes_open_sessions() {
        let store = Arc::new(MemoryStore::default());
        let (trigger, ctx) = context(store.clone(), &Config::default());
        let (client, server) = duplex(4096);
        let session = tokio::spawn(handle_session(server, "203.0.113.11:1".to_string(), ctx));

        let mut client = BufReader::new(client);
        read_line(&mut client).await;
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.payloads().last().map(String::as_str), Some(CONNECTION_CLOSED));
    }

    /// Sends `count` lines without ever reading a reply
    fn flood(mut client: DuplexStream, count: usize) -> tokio::task::JoinHandle<DuplexStream> {
        tokio::spawn(async move {
            for _ in 0..count {
                if client.write_all(b"X\r\n").await.is_err() {
                    break;
                }
            }
            client
        })
    }

    #[tokio::test]
    async fn shutdown_ends_session_stuck_writing_to_non_reader() {
        let store = Arc::new(MemoryStore::default());
        let (trigger, ctx) = context(store.clone(), &Config::default());
        let (client, server) = duplex(64);
        let session = tokio::spawn(handle_session(server, "203.0.113.12:1".to_string(), ctx));

        let sender = flood(client, 200);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!session.is_finished());

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(3), session)
            .await
            .unwrap()
            .unwrap();
        sender.abort();

        let payloads = store.payloads();
        assert_eq!(payloads.first().map(String::as_str), Some(CONNECTION_OPENED));
        assert_eq!(payloads.last().map(String::as_str), Some(CONNECTION_CLOSED));
    }

    #[tokio::test]
    async fn idle_timeout_covers_blocked_writes() {
        let store = Arc::new(MemoryStore::default());
        let mut config = Config::default();
        config.session.idle_timeout_secs = 1;
        let (_trigger, ctx) = context(store.clone(), &config);
        let (client, server) = duplex(64);
        let session = tokio::spawn(handle_session(server, "203.0.113.13:1".to_string(), ctx));

        let sender = flood(client, 200);
        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();
        sender.abort();

        assert_eq!(store.payloads().last().map(String::as_str), Some(CONNECTION_CLOSED));
    }
}
