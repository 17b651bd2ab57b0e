//! Message-framed duplex channel abstraction.
//!
//! Both endpoints speak the protocol over a transport that delivers whole
//! logical messages in order: a WebSocket on the wire, or an in-memory pair in
//! tests. The [`MessageChannel`] trait is the seam between the session logic
//! and whichever transport is underneath.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{ProtocolError, Result};

/// Capacity of each direction of a [`MemoryChannel`] pair.
const MEMORY_CHANNEL_CAPACITY: usize = 256;

/// Close status codes used by the protocol (RFC 6455 section 7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: the session ended normally.
    Normal,
    /// 1007: a transferred file failed its integrity check.
    InvalidPayload,
    /// 1008: the peer broke the message protocol.
    PolicyViolation,
    /// 1011: the endpoint hit an unexpected local failure.
    InternalError,
    /// Any other status code.
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::InternalError => 1011,
            CloseCode::Other(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1011 => CloseCode::InternalError,
            other => CloseCode::Other(other),
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseCode::Normal => "NormalClosure",
            CloseCode::InvalidPayload => "InvalidPayloadData",
            CloseCode::PolicyViolation => "PolicyViolation",
            CloseCode::InternalError => "InternalServerError",
            CloseCode::Other(_) => "Other",
        };
        write!(f, "{} ({})", name, self.as_u16())
    }
}

/// A close handshake frame: status code plus a short human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// A normal closure with no reason text.
    pub fn normal() -> Self {
        Self::new(CloseCode::Normal, "")
    }
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.reason)
        }
    }
}

/// One logical message as seen by the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// A JSON command message.
    Text(String),
    /// A chunk of file bytes.
    Binary(Vec<u8>),
    /// The peer closed the connection. `None` when the transport ended
    /// without a close frame.
    Close(Option<CloseFrame>),
}

impl WireMessage {
    /// Short label used in logs and protocol errors.
    pub fn label(&self) -> String {
        match self {
            WireMessage::Text(_) => "text message".to_string(),
            WireMessage::Binary(data) => format!("binary message ({} bytes)", data.len()),
            WireMessage::Close(_) => "close".to_string(),
        }
    }
}

/// A duplex, ordered, message-framed connection.
///
/// Implementations hide control frames (ping/pong) and reassemble fragmented
/// frames, so every call to [`recv`](MessageChannel::recv) yields one whole
/// logical message.
pub trait MessageChannel: Send {
    /// Sends one logical message.
    fn send<'a>(
        &'a mut self,
        message: WireMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Receives the next logical message.
    ///
    /// Returns [`WireMessage::Close`] once the peer has closed; the channel
    /// must not be used afterwards.
    fn recv<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<WireMessage>> + Send + 'a>>;

    /// Starts the close handshake with the given status.
    fn close<'a>(
        &'a mut self,
        frame: CloseFrame,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Serializes `message` as JSON and sends it as a text message.
pub async fn send_json<C, M>(channel: &mut C, message: &M) -> Result<()>
where
    C: MessageChannel + ?Sized,
    M: Serialize,
{
    let text = serde_json::to_string(message)
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    channel.send(WireMessage::Text(text)).await
}

/// In-process [`MessageChannel`] backed by a pair of tokio mpsc queues.
///
/// Used to drive the dispatch loop and the transfer engine without sockets.
#[derive(Debug)]
pub struct MemoryChannel {
    tx: mpsc::Sender<WireMessage>,
    rx: mpsc::Receiver<WireMessage>,
    closed: bool,
}

impl MemoryChannel {
    /// Creates two connected endpoints.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(MEMORY_CHANNEL_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(MEMORY_CHANNEL_CAPACITY);
        (
            Self {
                tx: a_tx,
                rx: a_rx,
                closed: false,
            },
            Self {
                tx: b_tx,
                rx: b_rx,
                closed: false,
            },
        )
    }
}

impl MessageChannel for MemoryChannel {
    fn send<'a>(
        &'a mut self,
        message: WireMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.closed {
                return Err(ProtocolError::ConnectionClosed(
                    "send after close".to_string(),
                ));
            }
            self.tx
                .send(message)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed("peer dropped".to_string()))
        })
    }

    fn recv<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<WireMessage>> + Send + 'a>> {
        Box::pin(async move { Ok(self.rx.recv().await.unwrap_or(WireMessage::Close(None))) })
    }

    fn close<'a>(
        &'a mut self,
        frame: CloseFrame,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.closed {
                return Ok(());
            }
            self.closed = true;
            // The peer may already be gone; closing is still complete locally.
            let _ = self.tx.send(WireMessage::Close(Some(frame))).await;
            Ok(())
        })
    }
}
