//! # treesync core
//!
//! The moving parts shared by treesync clients and servers.
//!
//! This crate provides:
//! - A path-addressed tree store with structural diff and merge
//! - A time-windowed batching queue, and the outbox built on it that turns
//!   each window's events and coalesced mutations into one envelope
//! - A subscription manager that consolidates listeners into a minimal set
//!   of wire subscriptions and fans notifications up and down the tree
//! - Typed hook chains and a diagnostics sink
//! - The transport trait, an in-memory transport pair and a WebSocket
//!   transport
//!
//! ## Key Invariants
//!
//! - `put` returns exactly what changed; merging the same diff twice changes
//!   nothing the second time
//! - No two wire subscriptions cover one another, and every listener is
//!   covered by one
//! - Deletes of a batched update are applied before its change
//! - Callbacks never run while a manager lock is held

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batcher;
mod error;
mod hooks;
mod outbox;
mod queue;
mod store;
mod subscriptions;
mod transport;
mod websocket;

pub use batcher::{PendingUpdate, UpdateOp};
pub use error::{CoreError, CoreResult, TransportError, TransportResult};
pub use hooks::{
    Diagnostic, HookChain, HookError, HookFailure, HookFuture, HookName, Hooks, SetRequest,
};
pub use outbox::{EventOutbox, Outbound, OutboxWindow};
pub use queue::BatchingQueue;
pub use store::{diff, merge, SharedStore, Store};
pub use subscriptions::{
    Callback, DetachedLink, Dispatch, ListenerId, NotifyOptions, SubscriptionManager, Unsubscribe,
    WireLink,
};
pub use transport::{
    send_envelope, EventReceiver, EventSender, MemoryTransport, Transport, TransportEvent,
};
pub use websocket::WsTransport;
