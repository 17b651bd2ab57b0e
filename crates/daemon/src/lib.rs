//! # Ferry Daemon Library
//!
//! This crate provides the server side of Ferry: it serves one directory
//! tree over a token-authenticated WebSocket and moves files in and out of
//! it with verified, optionally throttled transfers.
//!
//! ## Overview
//!
//! - **Authentication**: a random token generated at startup gates every request
//! - **Sessions**: each connection browses the tree without leaving the root
//! - **Dispatch**: one command at a time per connection, transfers included
//! - **Status**: process-wide traffic counters reported by `motd` and `/ws/debug`
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  axum router: /ws/ping  /ws/connect  /ws/debug   │
//! │          token middleware, TraceLayer            │
//! ├──────────────────────────────────────────────────┤
//! │   WebSocketChannel  →  MessageRouter (per conn)  │
//! │                          │                       │
//! │        Session (cwd) ────┼──── Transfer Engine   │
//! │                          │                       │
//! │                   Status counters                │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{auth::generate_token, Config, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let server = Server::bind(config, generate_token()).await?;
//!     println!("listening on {}", server.endpoint()?);
//!
//!     server.serve(CancellationToken::new()).await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`auth`]: Token generation and the request middleware
//! - [`files`]: Confined directory browsing
//! - [`session`]: Per-connection state and the `cd` rule
//! - [`router`]: The dispatch loop
//! - [`network`]: WebSocket adapter
//! - [`server`]: HTTP endpoints and the listener
//! - [`tls`]: rustls setup for `https`/`wss`
//! - [`motd`]: Greeting text
//! - [`status`]: Traffic counters

pub mod auth;
pub mod config;
pub mod files;
pub mod motd;
pub mod network;
pub mod router;
pub mod server;
pub mod session;
pub mod status;
pub mod tls;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use files::{BrowserError, SessionRoot};
pub use router::{DispatchContext, MessageRouter};
pub use server::{create_router, AppState, Server};
pub use session::{Session, SessionPhase};
pub use status::Status;
