//! Token bucket with a burst floor.
//!
//! Tokens refill continuously at `max_requests / window_ms`. The burst
//! floor caps how many tokens can ever be available at once: however
//! generous the window allowance, a key cannot burst past
//! `min_burst_protection` tokens per second.

use crate::config::LimiterConfig;
use tokio::time::Instant;

/// Outcome of a limiter check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Whole tokens left after this check
    pub remaining: u64,
    /// Milliseconds until the bucket is full again
    pub reset_ms: u64,
    /// Set when denied: milliseconds until one token is available
    pub retry_after_ms: Option<u64>,
}

/// One key's token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_ms: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: &LimiterConfig) -> Self {
        let floor_per_ms = config.min_burst_protection.max(1) as f64 / 1000.0;
        let configured_per_ms = config.max_requests as f64 / config.window_ms.max(1) as f64;
        let capacity = Self::effective_capacity(config);
        Self {
            capacity,
            // The burst floor bounds the sustained rate too: a generous
            // window never translates into more than the floor per second
            refill_per_ms: configured_per_ms.min(floor_per_ms),
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Burst floor: instantaneous capacity is bounded by one second's
    /// worth of `min_burst_protection`, never below 1.
    fn effective_capacity(config: &LimiterConfig) -> f64 {
        let floor = config.min_burst_protection.max(1) as f64;
        (config.max_requests as f64).min(floor.max(1.0)).max(1.0)
    }

    fn refill(&mut self) {
        let elapsed_ms = self.last_refill.elapsed().as_millis() as f64;
        if elapsed_ms > 0.0 {
            self.tokens = (self.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
            self.last_refill = Instant::now();
        }
    }

    /// Try to take one token.
    pub fn try_consume(&mut self) -> RateLimitDecision {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            RateLimitDecision {
                allowed: true,
                remaining: self.tokens.floor() as u64,
                reset_ms: self.ms_until_full(),
                retry_after_ms: None,
            }
        } else {
            let deficit = 1.0 - self.tokens;
            let retry_after = (deficit / self.refill_per_ms).ceil() as u64;
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_ms: self.ms_until_full(),
                retry_after_ms: Some(retry_after.max(1)),
            }
        }
    }

    /// Inspect without consuming.
    pub fn peek(&mut self) -> RateLimitDecision {
        self.refill();
        RateLimitDecision {
            allowed: self.tokens >= 1.0,
            remaining: self.tokens.floor() as u64,
            reset_ms: self.ms_until_full(),
            retry_after_ms: None,
        }
    }

    fn ms_until_full(&self) -> u64 {
        let deficit = self.capacity - self.tokens;
        if deficit <= 0.0 {
            0
        } else {
            (deficit / self.refill_per_ms).ceil() as u64
        }
    }
}
