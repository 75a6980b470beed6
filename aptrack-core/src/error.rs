//! Error types for aptrack-core

use thiserror::Error;

/// Main error type for the aptrack-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Connect, send or receive failure on the websocket
    #[error("transport error: {0}")]
    Transport(String),

    /// Server address could not be turned into a websocket request
    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    /// Frame that is not a JSON array of command objects
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Server answered the handshake with `ConnectionRefused`
    #[error("connection refused: {}", .0.join(", "))]
    ConnectionRejected(Vec<String>),

    /// Save or multidata file that cannot be decompressed or decoded
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Session registry error (duplicate or unknown listener)
    #[error("registry error: {0}")]
    Registry(String),

    /// Object storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Game server process error
    #[error("process error: {0}")]
    Process(String),
}

impl Error {
    /// Whether the retry state machine may reconnect after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Url(e) => Error::InvalidAddress(e.to_string()),
            WsError::HttpFormat(e) => Error::InvalidAddress(e.to_string()),
            other => Error::Transport(other.to_string()),
        }
    }
}

/// Result type alias for aptrack-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(Error::Transport("reset by peer".into()).is_retryable());
        assert!(!Error::InvalidAddress("nope".into()).is_retryable());
        assert!(!Error::ConnectionRejected(vec!["InvalidSlot".into()]).is_retryable());
        assert!(!Error::CorruptSnapshot("bad zlib".into()).is_retryable());
    }

    #[test]
    fn test_rejection_message_lists_reasons() {
        let err = Error::ConnectionRejected(vec!["InvalidSlot".into(), "InvalidGame".into()]);
        assert_eq!(
            err.to_string(),
            "connection refused: InvalidSlot, InvalidGame"
        );
    }
}
