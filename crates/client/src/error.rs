//! Error types for the client crate.

use protocol::ProtocolError;
use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The endpoint could not be parsed or has an unsupported scheme.
    #[error("invalid endpoint {0}: expected http://host:port or https://host:port")]
    InvalidEndpoint(String),

    /// The ping did not answer 204 No Content.
    #[error("ping failed with {status}: {body}")]
    PingFailed { status: u16, body: String },

    /// An HTTP request failed before a response arrived.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The WebSocket handshake failed.
    #[error("WebSocket connection failed: {0}")]
    Connect(String),

    /// TLS setup or the handshake failed, including a rejected certificate.
    #[error("TLS failed: {0}")]
    Tls(String),

    /// The input line is not a command.
    #[error("Could not interpret input [{0}]")]
    UnknownCommand(String),

    /// The session outlived its maximum duration.
    #[error("session exceeded its maximum duration of {0} seconds")]
    SessionExpired(u64),

    /// A protocol failure; usually fatal to the session.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Local I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_command_message() {
        assert_eq!(
            ClientError::UnknownCommand("rm -rf".into()).to_string(),
            "Could not interpret input [rm -rf]"
        );
    }

    #[test]
    fn test_ping_failed_message() {
        let err = ClientError::PingFailed {
            status: 401,
            body: "Invalid token found.".into(),
        };
        assert_eq!(err.to_string(), "ping failed with 401: Invalid token found.");
    }
}
