//! Connection setup: liveness check and WebSocket upgrade.
//!
//! Both steps present the token as `Authorization: Token <t>` over a stream
//! opened here, plain TCP or TLS through [`crate::tls`]. Servers whose
//! certificate fails normal validation are reachable with a [`CertificatePin`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Empty};
use hyper::header::{AUTHORIZATION, HOST};
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use protocol::{CloseCode, CloseFrame, MessageChannel, ProtocolError, WireMessage};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::either::Either;
use tracing::debug;
use url::Url;

use crate::error::{ClientError, Result};
use crate::tls::{self, CertificatePin};

/// Default timeout for the ping and the upgrade.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the server to acknowledge a close.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub const PING_PATH: &str = "/ws/ping";
pub const CONNECT_PATH: &str = "/ws/connect";

/// Plain or TLS transport under both requests.
pub type ClientStream = Either<TcpStream, TlsStream<TcpStream>>;

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    endpoint: Url,
    token: String,
    pub pin: CertificatePin,
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    /// Parses an `http://` or `https://` endpoint.
    pub fn new(endpoint: &str, token: impl Into<String>) -> Result<Self> {
        let invalid = || ClientError::InvalidEndpoint(endpoint.to_string());
        let url = Url::parse(endpoint).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(invalid());
        }

        Ok(Self {
            endpoint: url,
            token: token.into(),
            pin: CertificatePin::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn is_tls(&self) -> bool {
        self.endpoint.scheme() == "https"
    }

    pub fn ping_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.set_path(PING_PATH);
        url
    }

    /// The upgrade URL, with the scheme switched to `ws`/`wss`.
    pub fn connect_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.set_path(CONNECT_PATH);
        let scheme = if self.is_tls() { "wss" } else { "ws" };
        // Switching between special schemes always succeeds.
        let _ = url.set_scheme(scheme);
        url
    }

    fn authorization(&self) -> String {
        format!("Token {}", self.token)
    }

    fn host(&self) -> &str {
        self.endpoint.host_str().unwrap_or_default()
    }

    /// `host[:port]` as sent in the `Host` header.
    fn host_header(&self) -> String {
        match self.endpoint.port() {
            Some(port) => format!("{}:{port}", self.host()),
            None => self.host().to_string(),
        }
    }
}

/// Opens the transport, running the TLS handshake for `https` endpoints.
async fn open_stream(config: &ConnectionConfig) -> Result<ClientStream> {
    let host = config.host();
    let port = config
        .endpoint
        .port_or_known_default()
        .ok_or_else(|| ClientError::InvalidEndpoint(config.endpoint.to_string()))?;
    let tcp = TcpStream::connect((host.trim_start_matches('[').trim_end_matches(']'), port)).await?;
    if !config.is_tls() {
        return Ok(Either::Left(tcp));
    }

    let connector = TlsConnector::from(Arc::new(tls::client_config(&config.pin)?));
    let stream = connector
        .connect(tls::server_name(host)?, tcp)
        .await
        .map_err(|e| ClientError::Tls(e.to_string()))?;
    Ok(Either::Right(stream))
}

fn http_error(e: impl std::fmt::Display) -> ClientError {
    ClientError::Http(e.to_string())
}

/// Checks that the server is up and accepts the token.
pub async fn ping(config: &ConnectionConfig) -> Result<()> {
    let exchange = async {
        let stream = open_stream(config).await?;
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream))
                .await
                .map_err(http_error)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Ping connection ended");
            }
        });

        let request = hyper::Request::get(PING_PATH)
            .header(HOST, config.host_header())
            .header(AUTHORIZATION, config.authorization())
            .body(Empty::<Bytes>::new())
            .map_err(http_error)?;
        let response = sender.send_request(request).await.map_err(http_error)?;

        let status = response.status();
        if status != StatusCode::NO_CONTENT {
            let body = match response.into_body().collect().await {
                Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
                Err(_) => String::new(),
            };
            return Err(ClientError::PingFailed {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    };

    tokio::time::timeout(config.connect_timeout, exchange)
        .await
        .map_err(|_| http_error("timed out"))??;
    debug!(url = %config.ping_url(), "Ping succeeded");
    Ok(())
}

/// Opens the WebSocket session.
pub async fn connect(config: &ConnectionConfig) -> Result<WebSocketChannel> {
    let mut request = config
        .connect_url()
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::Connect(e.to_string()))?;
    let authorization = HeaderValue::from_str(&config.authorization())
        .map_err(|e| ClientError::Connect(e.to_string()))?;
    request.headers_mut().insert("Authorization", authorization);

    let handshake = async {
        let stream = open_stream(config).await?;
        tokio_tungstenite::client_async_with_config(request, stream, None)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))
    };
    let (stream, response) = tokio::time::timeout(config.connect_timeout, handshake)
        .await
        .map_err(|_| ClientError::Connect("timed out".to_string()))??;

    debug!(status = %response.status(), url = %config.connect_url(), "WebSocket connected");
    Ok(WebSocketChannel::new(stream))
}

/// A [`MessageChannel`] over a client-side WebSocket.
pub struct WebSocketChannel {
    stream: WebSocketStream<ClientStream>,
}

impl WebSocketChannel {
    pub fn new(stream: WebSocketStream<ClientStream>) -> Self {
        Self { stream }
    }
}

fn to_ws_frame(frame: CloseFrame) -> WsCloseFrame<'static> {
    WsCloseFrame {
        code: WsCloseCode::from(frame.code.as_u16()),
        reason: frame.reason.into(),
    }
}

fn from_ws_frame(frame: WsCloseFrame<'static>) -> CloseFrame {
    CloseFrame::new(CloseCode::from(u16::from(frame.code)), frame.reason.into_owned())
}

fn transport_error(e: tokio_tungstenite::tungstenite::Error) -> ProtocolError {
    ProtocolError::ConnectionClosed(e.to_string())
}

impl MessageChannel for WebSocketChannel {
    fn send<'a>(
        &'a mut self,
        message: WireMessage,
    ) -> Pin<Box<dyn Future<Output = protocol::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let message = match message {
                WireMessage::Text(text) => Message::Text(text),
                WireMessage::Binary(data) => Message::Binary(data),
                WireMessage::Close(frame) => Message::Close(frame.map(to_ws_frame)),
            };
            self.stream.send(message).await.map_err(transport_error)
        })
    }

    fn recv<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = protocol::Result<WireMessage>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                let message = match self.stream.next().await {
                    Some(message) => message.map_err(transport_error)?,
                    None => return Ok(WireMessage::Close(None)),
                };
                return Ok(match message {
                    Message::Text(text) => WireMessage::Text(text),
                    Message::Binary(data) => WireMessage::Binary(data),
                    Message::Close(frame) => WireMessage::Close(frame.map(from_ws_frame)),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                });
            }
        })
    }

    fn close<'a>(
        &'a mut self,
        frame: CloseFrame,
    ) -> Pin<Box<dyn Future<Output = protocol::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            debug!(%frame, "Closing WebSocket");
            self.stream
                .close(Some(to_ws_frame(frame)))
                .await
                .map_err(transport_error)?;

            let drain = async {
                while let Some(Ok(message)) = self.stream.next().await {
                    if matches!(message, Message::Close(_)) {
                        break;
                    }
                }
            };
            if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, drain).await.is_err() {
                debug!("Server did not acknowledge close");
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_follow_scheme() {
        let plain = ConnectionConfig::new("http://127.0.0.1:50000", "t").unwrap();
        assert_eq!(plain.ping_url().as_str(), "http://127.0.0.1:50000/ws/ping");
        assert_eq!(plain.connect_url().as_str(), "ws://127.0.0.1:50000/ws/connect");
        assert!(!plain.is_tls());

        let tls = ConnectionConfig::new("https://files.example.com:8443/", "t").unwrap();
        assert_eq!(tls.ping_url().as_str(), "https://files.example.com:8443/ws/ping");
        assert_eq!(
            tls.connect_url().as_str(),
            "wss://files.example.com:8443/ws/connect"
        );
        assert!(tls.is_tls());
    }

    #[test]
    fn test_rejects_unsupported_endpoints() {
        for endpoint in ["ftp://host", "not a url", "ws://host:1", "file:///tmp"] {
            assert!(
                matches!(
                    ConnectionConfig::new(endpoint, "t"),
                    Err(ClientError::InvalidEndpoint(_))
                ),
                "{endpoint}"
            );
        }
    }

    #[test]
    fn test_authorization_header() {
        let config = ConnectionConfig::new("http://localhost:1", "abc").unwrap();
        assert_eq!(config.authorization(), "Token abc");
    }

    #[test]
    fn test_host_header_keeps_explicit_port() {
        let config = ConnectionConfig::new("http://127.0.0.1:50000", "t").unwrap();
        assert_eq!(config.host_header(), "127.0.0.1:50000");
        let config = ConnectionConfig::new("https://files.example.com/", "t").unwrap();
        assert_eq!(config.host_header(), "files.example.com");
        let config = ConnectionConfig::new("http://[::1]:8080", "t").unwrap();
        assert_eq!(config.host_header(), "[::1]:8080");
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_fast() {
        // Bind then drop to find a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ConnectionConfig::new(&format!("http://127.0.0.1:{port}"), "t").unwrap();
        assert!(matches!(ping(&config).await, Err(ClientError::Io(_))));
        assert!(matches!(connect(&config).await, Err(ClientError::Io(_))));
    }
}
