//! Per-IP rate limiting: a bounded, LRU-evicted sliding-window counter
//! used by the Pairing Broker and Auth Middleware (spec.md §4.3/§4.4/§9).

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// The caller is within the limit; the attempt has been recorded.
    Allowed,
    /// The caller has exceeded the limit; retry after this many seconds.
    Limited {
        /// Seconds until the oldest recorded attempt ages out of the
        /// window.
        retry_after_secs: u64,
    },
}

struct Bucket {
    attempts: Vec<Instant>,
    last_touched: Instant,
}

/// A bounded, LRU-evicted sliding-window rate limiter keyed by an
/// arbitrary string (typically a client IP). Bounded so a flood of
/// distinct source IPs can't grow the limiter's memory without bound
/// (spec.md §9).
///
/// Grounded in the donor's `RateLimiter` trait shape
/// (`check_and_record`/`reset`/`get_attempts`), reimplemented here as a
/// concrete bounded structure rather than a trait object since there is
/// exactly one production backing store (in-memory) for this daemon.
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    capacity: usize,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Construct a limiter allowing `max_attempts` within `window`,
    /// tracking at most `capacity` distinct keys (evicting the
    /// least-recently-touched key when full).
    #[must_use]
    pub fn new(max_attempts: u32, window: Duration, capacity: usize) -> Self {
        Self {
            max_attempts,
            window,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Check and record an attempt for `key` in one step, matching the
    /// donor's `check_and_record` semantics.
    pub async fn check_and_record(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;

        if !buckets.contains_key(key) && buckets.len() >= self.capacity {
            evict_lru(&mut buckets);
        }

        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            attempts: Vec::new(),
            last_touched: now,
        });
        bucket.attempts.retain(|t| now.duration_since(*t) < self.window);
        bucket.last_touched = now;

        if bucket.attempts.len() as u32 >= self.max_attempts {
            let oldest = bucket.attempts.first().copied().unwrap_or(now);
            let elapsed = now.duration_since(oldest);
            let retry_after = self.window.saturating_sub(elapsed);
            return RateLimitDecision::Limited {
                retry_after_secs: retry_after.as_secs().max(1),
            };
        }

        bucket.attempts.push(now);
        RateLimitDecision::Allowed
    }

    /// Number of attempts currently counted for `key` within the window.
    pub async fn attempts(&self, key: &str) -> u32 {
        let now = Instant::now();
        let buckets = self.buckets.lock().await;
        buckets
            .get(key)
            .map(|b| {
                b.attempts
                    .iter()
                    .filter(|t| now.duration_since(**t) < self.window)
                    .count() as u32
            })
            .unwrap_or(0)
    }

    /// Reset the counter for `key` (e.g. after a successful login).
    pub async fn reset(&self, key: &str) {
        self.buckets.lock().await.remove(key);
    }
}

fn evict_lru(buckets: &mut HashMap<String, Bucket>) {
    if let Some(oldest_key) = buckets
        .iter()
        .min_by_key(|(_, b)| b.last_touched)
        .map(|(k, _)| k.clone())
    {
        buckets.remove(&oldest_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_within_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60), 100);
        for _ in 0..3 {
            assert_eq!(
                limiter.check_and_record("1.2.3.4").await,
                RateLimitDecision::Allowed
            );
        }
    }

    #[tokio::test]
    async fn blocks_over_limit() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60), 100);
        limiter.check_and_record("1.2.3.4").await;
        limiter.check_and_record("1.2.3.4").await;
        assert!(matches!(
            limiter.check_and_record("1.2.3.4").await,
            RateLimitDecision::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn reset_clears_counter() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60), 100);
        limiter.check_and_record("1.2.3.4").await;
        limiter.reset("1.2.3.4").await;
        assert_eq!(
            limiter.check_and_record("1.2.3.4").await,
            RateLimitDecision::Allowed
        );
    }

    #[tokio::test]
    async fn evicts_lru_when_at_capacity() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60), 2);
        limiter.check_and_record("a").await;
        limiter.check_and_record("b").await;
        limiter.check_and_record("c").await; // evicts "a"
        assert_eq!(limiter.attempts("a").await, 0);
        assert_eq!(limiter.attempts("b").await, 1);
        assert_eq!(limiter.attempts("c").await, 1);
    }

    #[tokio::test]
    async fn different_keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60), 100);
        limiter.check_and_record("a").await;
        assert_eq!(
            limiter.check_and_record("b").await,
            RateLimitDecision::Allowed
        );
    }
}
