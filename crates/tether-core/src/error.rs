//! Crate-wide error type
//!
//! Each concern keeps its own `thiserror` enum ([`TransportError`],
//! [`FeatureError`]); [`ConsoleError`] aggregates them for callers that
//! drive the whole console.

use thiserror::Error;

use crate::connection::ConnectionId;
use crate::features::FeatureError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Feature(#[from] FeatureError),

    /// No connection with this id is held by the console
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ConsoleError>;

impl From<std::io::Error> for ConsoleError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ConsoleError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_errors_pass_through() {
        let err: ConsoleError = FeatureError::RequestPending.into();
        assert_eq!(err.to_string(), "A request for this target is already pending");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ConsoleError = io.into();
        assert!(matches!(err, ConsoleError::Io(ref m) if m == "missing"));
    }
}
