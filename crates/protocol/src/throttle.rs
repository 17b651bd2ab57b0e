//! Bandwidth shaping for file streams.
//!
//! [`ThrottledStream`] wraps the *file* side of a transfer (never the
//! network connection) so control messages are never delayed. Accounting
//! lives in [`Throttle`], which is pure and driven by explicit instants so it
//! can be tested without sleeping.
//!
//! The stream charges bytes after each read or write completes and pays the
//! resulting delay before the next operation, at end of file, and before a
//! flush or shutdown finishes.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Overshoot below this is not worth a sleep.
const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Accounting history older than this is discarded to bound drift.
const WINDOW: Duration = Duration::from_secs(1);

/// Converts a megabit-per-second cap into bytes per second (0 stays 0).
pub fn bytes_per_second_from_mbps(mbps: f64) -> u64 {
    if mbps.is_finite() && mbps > 0.0 {
        (mbps * 1_000_000.0 / 8.0) as u64
    } else {
        0
    }
}

/// Converts a bytes-per-second cap into megabits per second.
pub fn mbps_from_bytes_per_second(bytes_per_second: u64) -> f64 {
    bytes_per_second as f64 / 1_000_000.0 * 8.0
}

/// Byte accounting for one direction of one transfer.
#[derive(Debug, Clone)]
pub struct Throttle {
    max_bytes_per_second: u64,
    byte_count: u64,
    window_start: Instant,
}

impl Throttle {
    /// Creates a throttle capped at `max_bytes_per_second` (0 = unlimited).
    pub fn new(max_bytes_per_second: u64) -> Self {
        Self {
            max_bytes_per_second,
            byte_count: 0,
            window_start: Instant::now(),
        }
    }

    pub fn max_bytes_per_second(&self) -> u64 {
        self.max_bytes_per_second
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_bytes_per_second == 0
    }

    /// Changes the cap and starts a fresh window.
    pub fn set_max_bytes_per_second(&mut self, max_bytes_per_second: u64) {
        if self.max_bytes_per_second != max_bytes_per_second {
            self.max_bytes_per_second = max_bytes_per_second;
            self.reset(Instant::now());
        }
    }

    /// Records `bytes` moved at `now` and returns how long the caller must
    /// wait to bring the window back under the cap, if at all.
    pub fn record(&mut self, bytes: usize, now: Instant) -> Option<Duration> {
        if self.is_unlimited() || bytes == 0 {
            return None;
        }

        self.byte_count += bytes as u64;
        let elapsed = now.saturating_duration_since(self.window_start);

        // Time the accumulated bytes are allowed to take at the cap. Being
        // ahead of it is the same as the observed rate exceeding the cap.
        let budget =
            Duration::from_secs_f64(self.byte_count as f64 / self.max_bytes_per_second as f64);
        let delay = budget.saturating_sub(elapsed);

        if delay > MIN_SLEEP {
            self.reset(now + delay);
            Some(delay)
        } else {
            if elapsed > WINDOW {
                self.reset(now);
            }
            None
        }
    }

    fn reset(&mut self, at: Instant) {
        self.byte_count = 0;
        self.window_start = at;
    }
}

/// An [`AsyncRead`]/[`AsyncWrite`] decorator enforcing a [`Throttle`].
#[derive(Debug)]
pub struct ThrottledStream<S> {
    inner: S,
    throttle: Throttle,
    pending: Option<Pin<Box<Sleep>>>,
}

impl<S> ThrottledStream<S> {
    pub fn new(inner: S, max_bytes_per_second: u64) -> Self {
        Self {
            inner,
            throttle: Throttle::new(max_bytes_per_second),
            pending: None,
        }
    }

    pub fn max_bytes_per_second(&self) -> u64 {
        self.throttle.max_bytes_per_second()
    }

    pub fn set_max_bytes_per_second(&mut self, max_bytes_per_second: u64) {
        self.throttle.set_max_bytes_per_second(max_bytes_per_second);
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn poll_pending(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(sleep) = self.pending.as_mut() {
            ready!(sleep.as_mut().poll(cx));
            self.pending = None;
        }
        Poll::Ready(())
    }

    fn charge(&mut self, bytes: usize) {
        if let Some(delay) = self.throttle.record(bytes, Instant::now()) {
            self.pending = Some(Box::pin(tokio::time::sleep(delay)));
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ThrottledStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending(cx));

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let read = buf.filled().len() - before;

        this.charge(read);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ThrottledStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_pending(cx));

        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.charge(written);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending(cx));
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending(cx));
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const EPSILON: Duration = Duration::from_millis(5);

    #[test]
    fn test_mbps_conversions() {
        assert_eq!(bytes_per_second_from_mbps(8.0), 1_000_000);
        assert_eq!(bytes_per_second_from_mbps(0.0), 0);
        assert_eq!(bytes_per_second_from_mbps(-3.0), 0);
        assert_eq!(bytes_per_second_from_mbps(f64::NAN), 0);
        assert!((mbps_from_bytes_per_second(1_000_000) - 8.0).abs() < f64::EPSILON);
        assert_eq!(mbps_from_bytes_per_second(0), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_delays() {
        let mut throttle = Throttle::new(0);
        let now = Instant::now();
        assert_eq!(throttle.record(usize::MAX / 2, now), None);
        assert!(throttle.is_unlimited());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_over_cap_is_delayed() {
        let mut throttle = Throttle::new(1000);
        let start = throttle.window_start;

        let delay = throttle.record(1000, start).unwrap();
        assert_eq!(delay, Duration::from_secs(1));

        // Window restarts once the sleep is over.
        assert_eq!(throttle.byte_count, 0);
        assert_eq!(throttle.window_start, start + delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_millisecond_overshoot_is_ignored() {
        let mut throttle = Throttle::new(1_000_000);
        let start = throttle.window_start;

        assert_eq!(throttle.record(500, start), None);
        // Bytes still count toward the window.
        assert_eq!(throttle.byte_count, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_under_cap_is_not_delayed() {
        let mut throttle = Throttle::new(1000);
        let start = throttle.window_start;
        assert_eq!(throttle.record(100, start + Duration::from_millis(500)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_window_resets() {
        let mut throttle = Throttle::new(1000);
        let start = throttle.window_start;

        assert_eq!(throttle.record(10, start + Duration::from_secs(2)), None);
        assert_eq!(throttle.byte_count, 0);
        assert_eq!(throttle.window_start, start + Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_changing_cap_resets_window() {
        let mut throttle = Throttle::new(1_000_000);
        let start = throttle.window_start;
        throttle.record(500, start);
        assert_eq!(throttle.byte_count, 500);

        tokio::time::advance(Duration::from_millis(10)).await;
        throttle.set_max_bytes_per_second(2000);

        assert_eq!(throttle.byte_count, 0);
        assert_eq!(throttle.max_bytes_per_second(), 2000);
        assert!(throttle.window_start > start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_takes_at_least_n_over_c() {
        let data = vec![7u8; 64 * 1024];
        let mut stream = ThrottledStream::new(&data[..], 16 * 1024);

        let started = Instant::now();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, data);
        assert!(started.elapsed() >= Duration::from_secs(4) - EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_takes_at_least_n_over_c() {
        let mut stream = ThrottledStream::new(Vec::new(), 8 * 1024);

        let started = Instant::now();
        stream.write_all(&[1u8; 32 * 1024]).await.unwrap();
        stream.flush().await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(4) - EPSILON);
        assert_eq!(stream.into_inner().len(), 32 * 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_stream_adds_no_delay() {
        let data = vec![1u8; 1024 * 1024];
        let mut stream = ThrottledStream::new(&data[..], 0);

        let started = Instant::now();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();

        assert_eq!(out.len(), data.len());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
