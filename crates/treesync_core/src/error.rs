//! Error types for the sync core.

use thiserror::Error;
use treesync_protocol::{PathError, ProtocolError};

use crate::hooks::HookFailure;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised by transports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport is not connected.
    #[error("not connected")]
    NotConnected,

    /// The peer or the local side closed the transport.
    #[error("transport closed")]
    Closed,

    /// Underlying I/O or socket error.
    #[error("transport i/o error: {0}")]
    Io(String),
}

impl TransportError {
    /// Returns true if a later reconnect may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::NotConnected | TransportError::Io(_))
    }
}

/// Errors raised by core components.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Invalid path or wildcard misuse.
    #[error(transparent)]
    Path(#[from] PathError),

    /// Malformed wire data.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A hook rejected the operation.
    #[error(transparent)]
    Hook(#[from] HookFailure),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CoreError {
    /// Returns true for errors caused by the caller, such as a wildcard path
    /// passed to a store operation.
    pub fn is_programmer_error(&self) -> bool {
        match self {
            CoreError::Path(_) => true,
            CoreError::Protocol(err) => err.is_programmer_error(),
            CoreError::Hook(_) | CoreError::Transport(_) => false,
        }
    }
}
