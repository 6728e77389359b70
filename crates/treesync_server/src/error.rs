//! Error types for the sync server.

use crate::connection::ConnectionId;
use thiserror::Error;
use treesync_core::{CoreError, TransportError};
use treesync_protocol::PathError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid path argument.
    #[error(transparent)]
    Path(#[from] PathError),

    /// The connection limit is reached.
    #[error("connection limit reached ({max})")]
    ConnectionLimit {
        /// Configured maximum.
        max: usize,
    },

    /// No connection with this id is registered.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Core failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if the caller passed an invalid argument.
    pub fn is_programmer_error(&self) -> bool {
        match self {
            ServerError::Path(_) => true,
            ServerError::Core(err) => err.is_programmer_error(),
            _ => false,
        }
    }

    /// Returns true if the error is caused by load rather than a fault.
    pub fn is_capacity_error(&self) -> bool {
        matches!(self, ServerError::ConnectionLimit { .. })
    }
}
