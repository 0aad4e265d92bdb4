//! Line-oriented and netstring TCP protocol servers and clients.
//!
//! A [`Server`] hands every decoded frame to a handler as a [`Request`]; the handler answers
//! through the request, and the [`connection`] takes care of framing, flushing and keep-alive.
//! Everything runs on a single thread inside a [`tokio::task::LocalSet`].

pub mod client;
pub mod codec;
pub mod connection;
pub mod request;
pub mod server;
pub mod stream;

pub use client::{Client, Receive};
pub use codec::Protocol;
pub use request::{Request, RequestError};
pub use server::Server;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

/// Remote address reported for peers that have none, such as Unix socket clients.
pub const UNKNOWN_PEER: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`, falling back to `default_level`.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));
}
