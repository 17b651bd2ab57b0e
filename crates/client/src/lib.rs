//! # Ferry Client
//!
//! Interactive client for a Ferry daemon: pings the server, opens the
//! WebSocket session and turns typed commands into protocol requests.
//!
//! ## Modules
//!
//! - [`connection`]: ping and WebSocket upgrade (plain or TLS)
//! - [`tls`]: certificate verification with subject or thumbprint pins
//! - [`orchestrator`]: command parsing and the session loop
//! - [`display`]: terminal rendering and progress bars
//! - [`error`]: Error types

pub mod connection;
pub mod display;
pub mod error;
pub mod orchestrator;
pub mod tls;

pub use connection::{connect, ping, ConnectionConfig, WebSocketChannel};
pub use error::{ClientError, Result};
pub use orchestrator::{ClientCommand, Orchestrator, Outcome, DEFAULT_MAX_SESSION_DURATION};
pub use tls::CertificatePin;
