//! # treesync protocol
//!
//! Wire types for path-addressed tree synchronization.
//!
//! This crate provides:
//! - `Path`, the validated path algebra (normalization, wildcards, ancestry)
//! - `Node`, the recursive value model and its JSON wire form
//! - `BatchedUpdate` and `KeyDelta`, the coalesced mutation payloads
//! - Direction-aware protocol messages and the `{events: […]}` envelope
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod node;
mod path;
mod update;

pub use error::{PathError, ProtocolError, ProtocolResult};
pub use messages::{
    event, ClientBound, Envelope, ServerBound, SubscribeRequest, WireEvent, KEEP_ALIVE_FAILED,
};
pub use node::{Located, Meta, Node, NodeValue};
pub use path::{Path, WILDCARD};
pub use update::{BatchedUpdate, KeyDelta};
