use crate::config::ConfigError;
use crate::protocol::CloseCode;
use std::time::Duration;
use thiserror::Error;

/// Categorizes errors for handler decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be passed to handler callbacks and carried in shard events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol or transport error
    WebSocket,
    /// Socket could not be opened
    ConnectionFailed,
    /// Session did not become ready in time
    Timeout,
    /// Gateway closed the connection with a recoverable code
    Gateway,
    /// Gateway closed the connection with a non-recoverable code
    Fatal,
    /// Compressed frame could not be inflated
    Decompress,
    /// Payload could not be encoded or decoded
    Decode,
    /// Queued operation was cancelled by a session reset
    Cancelled,
    /// API misuse (double connect, double spawn, send while closed)
    Usage,
    /// REST call returned a non-success status
    Http,
    /// REST call failed before a response was received
    Request,
    /// Invalid configuration
    Config,
}

/// Errors that can occur in shardline
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Socket could not be opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Shard did not reach ready before its connect timeout fired
    #[error("Shard {shard_id} did not become ready within {timeout:?}")]
    ConnectTimeout { shard_id: u32, timeout: Duration },

    /// Gateway closed the connection with a code that allows reconnecting
    #[error("Gateway closed the connection: {code}")]
    GatewayClosed { code: u16 },

    /// Gateway closed the connection with a code that forbids reconnecting
    #[error("Gateway closed the connection: {code}")]
    Fatal { code: CloseCode },

    /// Compressed gateway frame could not be inflated
    #[error("Decompression failed: {0}")]
    Decompress(String),

    /// Payload encoding or decoding failed
    #[error("Invalid payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// Queued operation was released by a session reset instead of admitted
    #[error("Operation cancelled by session reset")]
    Cancelled,

    /// Shard is already connecting or connected
    #[error("Shard {0} is already connecting or connected")]
    AlreadyConnecting(u32),

    /// Shard id is already tracked by the manager
    #[error("Shard {0} has already been spawned")]
    ShardAlreadySpawned(u32),

    /// Shard has no open connection to send on
    #[error("Shard {0} has no open connection")]
    NotConnected(u32),

    /// Manager lifecycle misuse
    #[error("Shard manager error: {0}")]
    Manager(String),

    /// REST call returned a non-success status
    #[error("HTTP error {status}: {reason}")]
    Http { status: u16, reason: String },

    /// REST call failed before a response was received
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// A header value could not be built
    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Error::ConnectTimeout { .. } => ErrorKind::Timeout,
            Error::GatewayClosed { .. } => ErrorKind::Gateway,
            Error::Fatal { .. } => ErrorKind::Fatal,
            Error::Decompress(_) => ErrorKind::Decompress,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::AlreadyConnecting(_)
            | Error::ShardAlreadySpawned(_)
            | Error::NotConnected(_)
            | Error::Manager(_) => ErrorKind::Usage,
            Error::Http { .. } => ErrorKind::Http,
            Error::Request(_) | Error::InvalidHeader(_) => ErrorKind::Request,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether this error ends the shard's lifecycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::AlreadyConnecting(0).kind(), ErrorKind::Usage);
        assert_eq!(Error::ShardAlreadySpawned(1).kind(), ErrorKind::Usage);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            Error::Http {
                status: 500,
                reason: "Internal Server Error".to_string()
            }
            .kind(),
            ErrorKind::Http
        );
    }

    #[test]
    fn test_fatal_classification() {
        let fatal = Error::Fatal {
            code: CloseCode::AuthenticationFailed,
        };
        assert!(fatal.is_fatal());
        assert_eq!(fatal.kind(), ErrorKind::Fatal);
        assert!(!Error::GatewayClosed { code: 4000 }.is_fatal());
    }

    #[test]
    fn test_http_error_message() {
        let err = Error::Http {
            status: 404,
            reason: "Not Found".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP error 404: Not Found");
    }
}
