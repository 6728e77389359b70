//! Error types for the client coordinator.

use thiserror::Error;
use treesync_core::{CoreError, TransportError};
use treesync_protocol::PathError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors returned to callers of the client API.
///
/// Hook rejections and transport trouble are not errors here: the former
/// surface as [`SetOutcome::Rejected`](crate::SetOutcome::Rejected) plus a
/// diagnostic, the latter as [`SetOutcome::Offline`](crate::SetOutcome::Offline).
#[derive(Error, Debug)]
pub enum ClientError {
    /// Invalid path, wildcard misuse or an unusable object key.
    #[error(transparent)]
    Path(#[from] PathError),

    /// The transport could not be established.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Core failure.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ClientError {
    /// Returns true for errors caused by the caller.
    pub fn is_programmer_error(&self) -> bool {
        match self {
            ClientError::Path(_) => true,
            ClientError::Transport(_) => false,
            ClientError::Core(err) => err.is_programmer_error(),
        }
    }
}
