//! # veilsocks
//!
//! A tunneling SOCKS5 proxy pair. The client accepts SOCKS5 requests from
//! local applications and forwards them, wrapped in a configurable
//! obfuscating transport, to a cooperating server that unwraps the carrier
//! and dials the real target.
//!
//! ## Architecture
//!
//! ```text
//! app ──socks5──► client ──┬─ tcp ──────────┐
//!                          ├─ tls ──────────┤
//!                          ├─ http connect ─┼──► server ──socks5──► target
//!                          ├─ websocket ────┤
//!                          └─ ssh channel ──┘
//! ```
//!
//! A per-destination rule engine decides whether a request is tunneled,
//! connected directly from the client, or refused.

#![warn(rust_2018_idioms)]

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod relay;
pub mod rules;
pub mod server;
pub mod socks;
pub mod transport;

pub use error::{Error, Result};

use std::time::Duration;

/// Deadline for transport and SOCKS5 handshakes.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for outbound target connections.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay teardown after this long with no bytes in either direction.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Chunk size per relay direction; nothing beyond one chunk is buffered.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;
