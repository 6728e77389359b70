//! # treesync client
//!
//! Client sync coordinator for treesync.
//!
//! This crate provides:
//! - `SyncClient`: optimistic writes into a local cache, batched upstream
//! - Path subscriptions (`on`, `once`) consolidated into few wire
//!   subscriptions, restored after every reconnect
//! - Key-membership subscriptions (`each`) reporting each new child key once
//! - Keep-alive answering through the pong hook chain
//!
//! ## Connection model
//!
//! The client is offline until its transport reports `Connected`. Writes
//! made while offline are dropped rather than queued. On every connect the
//! wire subscriptions are re-sent, and the first message for each of them
//! replaces the cached sub-tree.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;
mod keys;
mod link;

pub use client::{ConnectionState, SetOutcome, Subscription, SyncClient};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use keys::{KeyChange, KeyTracker, Notification};
