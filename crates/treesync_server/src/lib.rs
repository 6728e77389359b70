//! # treesync Server
//!
//! Server sync coordinator for treesync.
//!
//! This crate provides:
//! - A connection registry with a connection limit
//! - Value and key subscriptions answered with snapshots, then deltas
//! - Fan-out of applied updates, scoped to each subscriber's path
//! - Keep-alive pings with goodbye-and-close for silent connections
//! - A WebSocket listener over `tokio-tungstenite`
//!
//! # Architecture
//!
//! The server owns one shared store and one subscription ledger. Every
//! connection registers listeners in the ledger; an applied update is
//! collected under the store write lock and delivered after it is released,
//! onto each connection's batching outbox.
//!
//! # Protocol
//!
//! 1. A client subscribes with `data:subscribe` or `data:subscribeKeys`
//! 2. The server answers with a snapshot (`data:<path>` or `data:<path>/*`)
//! 3. `data:update` from any client is applied and fanned out to the others
//! 4. `keep-alive:ping` every interval; no `keep-alive:pong` by the next
//!    tick ends the connection with `connection:goodbye`

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod connection;
mod error;
mod fanout;
mod server;
mod websocket;

pub use config::ServerConfig;
pub use connection::ConnectionId;
pub use error::{ServerError, ServerResult};
pub use fanout::Fanout;
pub use server::{SyncServer, UpdateOutcome};
pub use websocket::{serve, serve_listener};
