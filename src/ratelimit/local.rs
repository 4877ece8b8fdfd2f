//! In-process keyed rate limiter.

use crate::config::LimiterConfig;
use crate::ratelimit::bucket::{RateLimitDecision, TokenBucket};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

/// Per-key statistics. Reading never consumes tokens.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStats {
    pub key: String,
    pub remaining: u64,
    pub reset_ms: u64,
}

/// Token-bucket limiter over string keys.
pub struct LocalRateLimiter {
    config: RwLock<LimiterConfig>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    stopped: AtomicBool,
}

impl LocalRateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config: RwLock::new(config),
            buckets: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    fn allowed_unconditionally(&self) -> Option<RateLimitDecision> {
        let config = self.config.read().expect("limiter config poisoned");
        if !config.enabled || self.stopped.load(Ordering::SeqCst) {
            Some(RateLimitDecision {
                allowed: true,
                remaining: config.max_requests,
                reset_ms: 0,
                retry_after_ms: None,
            })
        } else {
            None
        }
    }

    /// Check a key, consuming at most one token.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        if let Some(decision) = self.allowed_unconditionally() {
            return decision;
        }
        let config = self.config.read().expect("limiter config poisoned").clone();
        let mut buckets = self.buckets.lock().expect("limiter buckets poisoned");
        buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(&config))
            .try_consume()
    }

    /// Consume a token; `false` when the key is exhausted.
    pub fn consume(&self, key: &str) -> bool {
        self.check(key).allowed
    }

    /// Read a key's state without consuming.
    pub fn stats(&self, key: &str) -> KeyStats {
        if let Some(decision) = self.allowed_unconditionally() {
            return KeyStats {
                key: key.to_string(),
                remaining: decision.remaining,
                reset_ms: 0,
            };
        }
        let config = self.config.read().expect("limiter config poisoned").clone();
        let mut buckets = self.buckets.lock().expect("limiter buckets poisoned");
        let decision = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(&config))
            .peek();
        KeyStats {
            key: key.to_string(),
            remaining: decision.remaining,
            reset_ms: decision.reset_ms,
        }
    }

    /// Forget one key's bucket.
    pub fn reset(&self, key: &str) {
        self.buckets
            .lock()
            .expect("limiter buckets poisoned")
            .remove(key);
    }

    /// Forget every bucket.
    pub fn reset_all(&self) {
        self.buckets
            .lock()
            .expect("limiter buckets poisoned")
            .clear();
    }

    /// Swap the configuration; existing buckets are rebuilt lazily.
    pub fn update_config(&self, config: LimiterConfig) {
        *self.config.write().expect("limiter config poisoned") = config;
        self.reset_all();
    }

    /// Disable enforcement permanently (shutdown path).
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().expect("limiter config poisoned").enabled
            && !self.stopped.load(Ordering::SeqCst)
    }
}
