//! # Ferry Protocol Library
//!
//! This crate provides the wire protocol shared by the Ferry daemon and
//! client: a token-authenticated WebSocket session for browsing a confined
//! directory tree and moving files in both directions.
//!
//! ## Overview
//!
//! - **Message Definitions**: `Type`-tagged JSON requests and responses
//! - **Message Channel**: the transport seam, with an in-memory pair for tests
//! - **Rate Limiting**: a throttled stream wrapper for file I/O
//! - **Transfer Engine**: chunked send/receive with SHA-256 trailers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Commands (motd/cd/ls/get/put)      │  JSON text messages
//! ├─────────────────────────────────────────┤
//! │            Transfer Engine              │  binary chunks + hash trailer
//! ├─────────────────────────────────────────┤
//! │       Throttled file streams            │  bytes/second cap
//! ├─────────────────────────────────────────┤
//! │       Transport (WebSocket / TLS)       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::messages::{decode, encode, CdRequest, Inbound, Request};
//!
//! let text = encode(&Request::Cd(CdRequest { target: "docs".into() })).unwrap();
//! assert_eq!(text, r#"{"Type":"cd","Target":"docs"}"#);
//!
//! match decode::<Request>(&text).unwrap() {
//!     Inbound::Known(Request::Cd(cd)) => assert_eq!(cd.target, "docs"),
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`channel`]: Message channel trait and close codes
//! - [`throttle`]: Bandwidth shaping for file streams
//! - [`transfer`]: File planning, sending and receiving
//! - [`error`]: Error types

pub mod channel;
pub mod error;
pub mod messages;
pub mod throttle;
pub mod transfer;

pub use channel::{send_json, CloseCode, CloseFrame, MemoryChannel, MessageChannel, WireMessage};
pub use error::{ProtocolError, Result};
pub use messages::{
    FileEntry, FileKind, Inbound, Request, Response, StatusSnapshot, MAX_TEXT_MESSAGE,
};
pub use throttle::{Throttle, ThrottledStream};
pub use transfer::{
    Direction, FileOutcome, NoopObserver, PlannedFile, TransferObserver, TransferOptions,
    TransferSummary, DEFAULT_CHUNK_SIZE,
};
