//! Error types for the protocol crate.

use thiserror::Error;

use crate::channel::{CloseCode, CloseFrame};

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A text message could not be decoded into a known shape.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A text message exceeded the receive buffer.
    #[error("message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // Session errors
    /// A binary message arrived while no transfer was in progress.
    #[error("binary message received outside of a file transfer")]
    UnexpectedBinary,

    /// A message arrived that does not fit the current exchange.
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        /// What the receiver was waiting for.
        expected: &'static str,
        /// What actually arrived.
        got: String,
    },

    /// A transferred name would resolve outside the destination directory.
    #[error("path escapes confined directory: {0}")]
    PathOutsideRoot(String),

    // Transfer errors
    /// The receiver's digest did not match the sender's trailer.
    #[error("integrity check failed for {name}: expected {expected}, got {actual}")]
    IntegrityFailure {
        /// Relative name of the file.
        name: String,
        /// Digest announced by the sender.
        expected: String,
        /// Digest computed by the receiver.
        actual: String,
    },

    /// File or data transfer failed.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    // Connection errors
    /// Connection was closed, by the peer or the transport.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// The close frame to send to the peer when this error ends a session.
    ///
    /// Returns `None` when the connection is already gone.
    pub fn close_frame(&self) -> Option<CloseFrame> {
        match self {
            ProtocolError::MalformedMessage(_) | ProtocolError::UnexpectedMessage { .. } => Some(
                CloseFrame::new(CloseCode::PolicyViolation, "Malformed message."),
            ),
            ProtocolError::MessageTooLarge { .. } => Some(CloseFrame::new(
                CloseCode::PolicyViolation,
                "Text message not sent in full.",
            )),
            ProtocolError::UnexpectedBinary => Some(CloseFrame::new(
                CloseCode::PolicyViolation,
                "Binary message sent without first establishing file transfer information.",
            )),
            ProtocolError::PathOutsideRoot(_) => Some(CloseFrame::new(
                CloseCode::PolicyViolation,
                "File name escapes the working directory.",
            )),
            ProtocolError::IntegrityFailure { .. } => Some(CloseFrame::new(
                CloseCode::InvalidPayload,
                "Did not receive correct data.",
            )),
            ProtocolError::ConnectionClosed(_) => None,
            ProtocolError::Serialization(_)
            | ProtocolError::TransferFailed(_)
            | ProtocolError::Timeout(_) => Some(CloseFrame::new(
                CloseCode::InternalError,
                "Transfer aborted.",
            )),
        }
    }
}

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::MalformedMessage(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::TransferFailed(err.to_string()),
        }
    }
}
