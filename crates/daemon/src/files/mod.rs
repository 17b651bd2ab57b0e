//! File system access for sessions.
//!
//! # Security
//!
//! Every path a session touches is derived from the canonical
//! [`SessionRoot`]: `cd` only moves between real child directories or back
//! up to (never above) the root, and uploads are resolved by the transfer
//! engine, which refuses names that escape the current directory.

pub mod browser;

pub use browser::{directory_size, list_directory, BrowserError, SessionRoot};
