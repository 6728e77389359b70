//! Error types for the sync protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Misuse of the path algebra.
///
/// These are programmer errors: they are returned synchronously and never
/// swallowed by the coordinators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// A `*` segment appeared somewhere other than the final position.
    #[error("wildcard segment must be last in path {path:?}")]
    MisplacedWildcard {
        /// The offending input.
        path: String,
    },

    /// A wildcard path was used where a literal path is required.
    #[error("wildcard path {path:?} cannot address a value")]
    WildcardLiteral {
        /// The offending path.
        path: String,
    },

    /// A key is not usable as a single path segment.
    #[error("invalid path key {key:?}")]
    InvalidKey {
        /// The offending key.
        key: String,
    },
}

/// Errors raised while encoding or decoding wire traffic.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Path misuse.
    #[error(transparent)]
    Path(#[from] PathError),

    /// A node payload violated the node shape.
    #[error("invalid node: {0}")]
    InvalidNode(String),

    /// An event name is not part of the protocol for this direction.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// An event payload did not match its schema.
    #[error("invalid payload for {event}: {source}")]
    Payload {
        /// Event name.
        event: String,
        /// Decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// The frame was not valid JSON or not an envelope.
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Returns true if this error stems from misuse by the caller rather than
    /// from bad input received over the wire.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, ProtocolError::Path(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = PathError::MisplacedWildcard {
            path: "a/*/b".into(),
        };
        assert!(err.to_string().contains("a/*/b"));

        let err = ProtocolError::UnknownEvent("data-ish".into());
        assert_eq!(err.to_string(), "unknown event: data-ish");
    }

    #[test]
    fn programmer_error_classification() {
        let err: ProtocolError = PathError::InvalidKey { key: "".into() }.into();
        assert!(err.is_programmer_error());
        assert!(!ProtocolError::InvalidNode("x".into()).is_programmer_error());
    }
}
