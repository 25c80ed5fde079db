//! Honeytrap - a low-interaction TCP honeypot
//!
//! Listens on a fixed set of ports commonly probed by scanners, greets every
//! connection with an FTP-style banner, answers a couple of canned commands
//! and appends everything it sees to an SQLite event log.

pub mod config;
pub mod db;
pub mod handlers;
pub mod shutdown;
