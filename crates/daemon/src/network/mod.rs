//! Network module for client connections.
//!
//! This module adapts an upgraded axum WebSocket to the protocol's
//! [`MessageChannel`] so the dispatch loop never sees transport details.
//! Ping and pong frames are answered by the WebSocket layer and skipped here.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use axum::extract::ws::{self, Message, WebSocket};
use protocol::{CloseCode, CloseFrame, MessageChannel, ProtocolError, Result, WireMessage};
use tracing::debug;

/// How long to wait for the peer to acknowledge a close.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A [`MessageChannel`] over a server-side WebSocket.
pub struct WebSocketChannel {
    socket: WebSocket,
}

impl WebSocketChannel {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }

    pub fn into_inner(self) -> WebSocket {
        self.socket
    }
}

fn to_ws_frame(frame: CloseFrame) -> ws::CloseFrame<'static> {
    ws::CloseFrame {
        code: frame.code.as_u16(),
        reason: frame.reason.into(),
    }
}

fn from_ws_frame(frame: ws::CloseFrame<'static>) -> CloseFrame {
    CloseFrame::new(CloseCode::from(frame.code), frame.reason.into_owned())
}

fn transport_error(e: axum::Error) -> ProtocolError {
    ProtocolError::ConnectionClosed(e.to_string())
}

impl MessageChannel for WebSocketChannel {
    fn send<'a>(
        &'a mut self,
        message: WireMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let message = match message {
                WireMessage::Text(text) => Message::Text(text),
                WireMessage::Binary(data) => Message::Binary(data),
                WireMessage::Close(frame) => Message::Close(frame.map(to_ws_frame)),
            };
            self.socket.send(message).await.map_err(transport_error)
        })
    }

    fn recv<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<WireMessage>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                let message = match self.socket.recv().await {
                    Some(message) => message.map_err(transport_error)?,
                    None => return Ok(WireMessage::Close(None)),
                };
                return Ok(match message {
                    Message::Text(text) => WireMessage::Text(text),
                    Message::Binary(data) => WireMessage::Binary(data),
                    Message::Close(frame) => WireMessage::Close(frame.map(from_ws_frame)),
                    Message::Ping(_) | Message::Pong(_) => continue,
                });
            }
        })
    }

    fn close<'a>(
        &'a mut self,
        frame: CloseFrame,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            debug!(%frame, "Closing WebSocket");
            self.socket
                .send(Message::Close(Some(to_ws_frame(frame))))
                .await
                .map_err(transport_error)?;

            // Read until the peer echoes the close so the handshake completes.
            let drain = async {
                while let Some(Ok(message)) = self.socket.recv().await {
                    if matches!(message, Message::Close(_)) {
                        break;
                    }
                }
            };
            if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, drain).await.is_err() {
                debug!("Peer did not acknowledge close");
            }
            Ok(())
        })
    }
}
