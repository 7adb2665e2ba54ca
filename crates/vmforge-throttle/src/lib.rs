//! Throttled transfer: a token-bucket-limited [`std::io::Read`] wrapper
//! composable with any byte stream.
//!
//! Each `read` call blocks until enough tokens are available for the
//! caller-requested buffer, or returns early if the transfer has been
//! cancelled. When `bytes_per_second <= 0` the wrapper is identity — no
//! bucket bookkeeping, no sleeping — so an unthrottled transfer pays no
//! overhead.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation flag shared between a throttled reader and
/// whatever is driving the transfer loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Returned when a throttled read was interrupted by cancellation before
/// any bytes were transferred for this call.
#[derive(Debug, thiserror::Error)]
#[error("transfer cancelled")]
pub struct CancelledError;

/// Token-bucket rate limiter. `bytes_per_second <= 0` disables limiting.
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(bytes_per_second: f64, burst_bytes: f64) -> Self {
        Self {
            rate: bytes_per_second.max(0.0),
            burst: burst_bytes.max(0.0),
            tokens: burst_bytes.max(0.0),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
    }

    /// Block (via sleep) until `n` tokens are available or cancellation
    /// fires. Returns `false` if cancelled before enough tokens accrued.
    fn acquire(&mut self, n: f64, cancel: &CancelToken) -> bool {
        loop {
            self.refill();
            if self.tokens >= n {
                self.tokens -= n;
                return true;
            }
            if cancel.is_cancelled() {
                return false;
            }
            let deficit = n - self.tokens;
            let wait_s = if self.rate > 0.0 { deficit / self.rate } else { 0.0 };
            std::thread::sleep(Duration::from_secs_f64(wait_s.clamp(0.0, 0.25)));
        }
    }
}

/// Default burst size when unspecified: `max(rate/10, 64 KiB)`.
pub fn default_burst(bytes_per_second: f64) -> f64 {
    (bytes_per_second / 10.0).max(64.0 * 1024.0)
}

/// A byte-stream wrapper that rate-limits reads through an inner reader
/// using a token bucket. Rate and burst are mutable at runtime.
pub struct ThrottledReader<R> {
    inner: R,
    bucket: Option<TokenBucket>,
    cancel: CancelToken,
}

impl<R: Read> ThrottledReader<R> {
    /// `bytes_per_second <= 0` makes this wrapper an identity pass-through.
    pub fn new(inner: R, bytes_per_second: f64, burst_bytes: f64, cancel: CancelToken) -> Self {
        let bucket = if bytes_per_second > 0.0 {
            Some(TokenBucket::new(bytes_per_second, burst_bytes))
        } else {
            None
        };
        Self { inner, bucket, cancel }
    }

    pub fn unthrottled(inner: R, cancel: CancelToken) -> Self {
        Self { inner, bucket: None, cancel }
    }

    /// Update the rate at runtime. Passing `<= 0` disables throttling.
    pub fn set_rate(&mut self, bytes_per_second: f64, burst_bytes: f64) {
        if bytes_per_second > 0.0 {
            match &mut self.bucket {
                Some(b) => {
                    b.rate = bytes_per_second;
                    b.burst = burst_bytes.max(0.0);
                }
                None => self.bucket = Some(TokenBucket::new(bytes_per_second, burst_bytes)),
            }
        } else {
            self.bucket = None;
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ThrottledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(bucket) = &mut self.bucket else {
            return self.inner.read(buf);
        };
        if buf.is_empty() {
            return Ok(0);
        }
        if !bucket.acquire(buf.len() as f64, &self.cancel) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, CancelledError));
        }
        self.inner.read(buf)
    }
}
