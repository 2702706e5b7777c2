//! Per-(target, mode) rate limiting
//!
//! Each bucket holds `capacity` tokens and refills to full at the end of
//! every `refill_interval` window. A send that finds the bucket empty is
//! deferred until the next refill, never dropped.

use dashmap::DashMap;
use iris_core::Mode;
use std::time::Duration;
use tokio::time::Instant;

/// Result of asking for a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Token taken; send now
    Granted,
    /// Bucket empty; retry after the delay
    Deferred(Duration),
}

impl Admission {
    /// Whether a token was taken
    #[inline]
    #[must_use]
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u32,
    window_start: Instant,
}

/// Token buckets keyed by target and mode
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    interval: Duration,
    buckets: DashMap<(String, Mode), Bucket>,
}

impl RateLimiter {
    /// Create limiter; zero capacity disables limiting
    #[must_use]
    pub fn new(capacity: u32, interval: Duration) -> Self {
        Self {
            capacity,
            interval,
            buckets: DashMap::new(),
        }
    }

    /// Whether limiting is in effect
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.capacity > 0 && !self.interval.is_zero()
    }

    /// Take a token for a send
    pub fn try_acquire(&self, target: &str, mode: &Mode) -> Admission {
        if !self.is_enabled() {
            return Admission::Granted;
        }
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry((target.to_owned(), mode.clone()))
            .or_insert(Bucket {
                tokens: self.capacity,
                window_start: now,
            });
        self.refill(&mut bucket, now);

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            Admission::Granted
        } else {
            let retry_after = (bucket.window_start + self.interval).saturating_duration_since(now);
            metrics::counter!("iris_messages_rate_limited_total", "mode" => mode.to_string())
                .increment(1);
            tracing::debug!(
                target_user = target,
                mode = %mode,
                retry_after_ms = retry_after.as_millis() as u64,
                "rate limited"
            );
            Admission::Deferred(retry_after)
        }
    }

    /// Return a token taken for a send that never happened
    pub fn refund(&self, target: &str, mode: &Mode) {
        if let Some(mut bucket) = self.buckets.get_mut(&(target.to_owned(), mode.clone())) {
            bucket.tokens = (bucket.tokens + 1).min(self.capacity);
        }
    }

    /// Tokens currently available
    #[must_use]
    pub fn available(&self, target: &str, mode: &Mode) -> u32 {
        if !self.is_enabled() {
            return u32::MAX;
        }
        let now = Instant::now();
        self.buckets
            .get(&(target.to_owned(), mode.clone()))
            .map_or(self.capacity, |bucket| {
                let mut bucket = *bucket;
                self.refill(&mut bucket, now);
                bucket.tokens
            })
    }

    /// Drop buckets that would be full anyway
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.window_start) < self.interval);
        before.saturating_sub(self.buckets.len())
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.duration_since(bucket.window_start);
        if elapsed < self.interval {
            return;
        }
        let interval_nanos = self.interval.as_nanos();
        let into_window = elapsed.as_nanos() % interval_nanos;
        bucket.window_start = now - Duration::from_nanos(u64::try_from(into_window).unwrap_or(0));
        bucket.tokens = self.capacity;
    }
}
