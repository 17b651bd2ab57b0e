//! Process-wide traffic counters.
//!
//! One [`Status`] is created at startup and shared by `Arc` with every
//! connection. Counters only ever grow and are updated with relaxed atomic
//! increments; readers take a [`StatusSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use protocol::StatusSnapshot;

#[derive(Debug)]
pub struct Status {
    start_time: DateTime<Utc>,
    binary_bytes_sent: AtomicU64,
    binary_bytes_received: AtomicU64,
    text_messages_sent: AtomicU64,
    text_messages_received: AtomicU64,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            binary_bytes_sent: AtomicU64::new(0),
            binary_bytes_received: AtomicU64::new(0),
            text_messages_sent: AtomicU64::new(0),
            text_messages_received: AtomicU64::new(0),
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn record_binary_sent(&self, bytes: u64) {
        self.binary_bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_binary_received(&self, bytes: u64) {
        self.binary_bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_text_sent(&self) {
        self.text_messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_text_received(&self) {
        self.text_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters. Individual values are exact; the set is not
    /// taken atomically as a whole.
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot::new(
            self.start_time,
            Utc::now(),
            self.binary_bytes_sent.load(Ordering::Relaxed),
            self.binary_bytes_received.load(Ordering::Relaxed),
            self.text_messages_sent.load(Ordering::Relaxed),
            self.text_messages_received.load(Ordering::Relaxed),
        )
    }
}
