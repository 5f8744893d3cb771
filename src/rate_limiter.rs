//! # Token-Bucket Rate Limiter
//!
//! Per-key admission throttling with continuous refill and discrete
//! consumption. Each key (normally a client source address, sometimes a
//! route id) owns an independent bucket, so one noisy client never
//! starves another. Buckets are created lazily on first use and sized
//! from the rate requested by the caller:
//!
//! - refill rate = requested rate (tokens per second)
//! - capacity = requested rate × burst multiplier
//!
//! On every `allow` call the bucket is first refilled with
//! `elapsed_seconds * refill_rate` tokens (clamped to capacity), then a
//! single token is consumed if at least one is available. A call that
//! supplies a different rate than the bucket was built with replaces the
//! bucket; in-flight tokens are lost, which is acceptable because rate
//! changes are administrative.

use dashmap::DashMap;
use std::time::Instant;
use tracing::debug;

/// A single token bucket.
///
/// Token counts are fractional so that sub-second refill accrues
/// smoothly; consumption is always whole tokens.
#[derive(Debug)]
struct TokenBucket {
    /// Maximum number of tokens the bucket can hold.
    capacity: f64,
    /// Tokens added per second of elapsed wall-clock time.
    refill_rate: f64,
    /// Current token count, `0.0 ..= capacity`.
    tokens: f64,
    /// Monotonic instant of the last refill.
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Refill from elapsed time, then try to consume one token.
    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Point-in-time view of one bucket, for diagnostics and stats reports.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    /// `tokens / capacity`, 0.0 when the capacity is zero.
    pub fraction_remaining: f64,
}

/// Per-key token-bucket rate limiter.
///
/// Buckets live in a sharded concurrent map; distinct keys never block
/// each other, and the refill-then-consume sequence is atomic per bucket
/// under the shard lock.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    burst_multiplier: f64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl RateLimiter {
    /// Create a limiter. `burst_multiplier` scales bucket capacity
    /// relative to the refill rate; 1.0 makes burst capacity equal the
    /// steady-state rate.
    pub fn new(burst_multiplier: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            burst_multiplier: burst_multiplier.max(0.0),
        }
    }

    /// Returns true iff a token was available (and consumed) for `key`
    /// at the given sustained rate in tokens per second.
    pub fn allow(&self, key: &str, rate: f64) -> bool {
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(rate * self.burst_multiplier, rate));

        // An administrative rate change replaces the bucket outright.
        if (entry.refill_rate - rate).abs() > f64::EPSILON {
            debug!(
                key,
                old_rate = entry.refill_rate,
                new_rate = rate,
                "rate changed, replacing token bucket"
            );
            *entry = TokenBucket::new(rate * self.burst_multiplier, rate);
        }

        entry.try_consume()
    }

    /// Current state of the bucket for `key`, if one exists.
    pub fn state(&self, key: &str) -> Option<BucketState> {
        self.buckets.get(key).map(|bucket| BucketState {
            tokens: bucket.tokens,
            capacity: bucket.capacity,
            refill_rate: bucket.refill_rate,
            fraction_remaining: if bucket.capacity > 0.0 {
                bucket.tokens / bucket.capacity
            } else {
                0.0
            },
        })
    }

    /// Drop the bucket for `key`. Returns true if one was present.
    pub fn reset(&self, key: &str) -> bool {
        self.buckets.remove(key).is_some()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
