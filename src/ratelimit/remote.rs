//! Remote-backed rate limiter with explicit fail modes.
//!
//! The backend (typically a shared store like Redis) is reached through an
//! async seam. When it errors, behavior follows the configured
//! [`FailMode`]:
//!
//! - `open`: allow and log a security warning
//! - `closed`: deny with a fixed retry-after
//! - `local-fallback` (default): serve the request from an embedded local
//!   limiter for the duration of the outage

use crate::config::{FailMode, LimiterConfig};
use crate::error::Result;
use crate::ratelimit::bucket::RateLimitDecision;
use crate::ratelimit::local::LocalRateLimiter;
use async_trait::async_trait;

/// Fixed retry-after handed out by fail-closed denials.
pub const FAIL_CLOSED_RETRY_MS: u64 = 1_000;

/// Remote limiter backend seam.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Check and consume one token for `key` on the shared backend.
    async fn check(&self, key: &str) -> Result<RateLimitDecision>;

    /// Clear one key.
    async fn reset(&self, key: &str) -> Result<()>;
}

/// Rate limiter that prefers the remote backend and degrades per the
/// configured fail mode.
pub struct RemoteRateLimiter {
    backend: Box<dyn RateLimitBackend>,
    fail_mode: FailMode,
    fallback: LocalRateLimiter,
}

impl RemoteRateLimiter {
    pub fn new(
        backend: Box<dyn RateLimitBackend>,
        config: LimiterConfig,
        fail_mode: FailMode,
    ) -> Self {
        Self {
            backend,
            fail_mode,
            fallback: LocalRateLimiter::new(config),
        }
    }

    /// Check a key, consuming at most one token.
    pub async fn check(&self, key: &str) -> RateLimitDecision {
        match self.backend.check(key).await {
            Ok(decision) => decision,
            Err(err) => self.degraded(key, &err),
        }
    }

    fn degraded(&self, key: &str, err: &crate::error::Error) -> RateLimitDecision {
        match self.fail_mode {
            FailMode::Open => {
                tracing::warn!(
                    key,
                    error = %err,
                    "rate-limit backend unavailable; failing OPEN (request allowed)"
                );
                RateLimitDecision {
                    allowed: true,
                    remaining: 0,
                    reset_ms: 0,
                    retry_after_ms: None,
                }
            }
            FailMode::Closed => {
                tracing::warn!(
                    key,
                    error = %err,
                    "rate-limit backend unavailable; failing CLOSED (request denied)"
                );
                RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    reset_ms: FAIL_CLOSED_RETRY_MS,
                    retry_after_ms: Some(FAIL_CLOSED_RETRY_MS),
                }
            }
            FailMode::LocalFallback => {
                tracing::debug!(
                    key,
                    error = %err,
                    "rate-limit backend unavailable; using local fallback"
                );
                self.fallback.check(key)
            }
        }
    }

    pub async fn reset(&self, key: &str) -> Result<()> {
        self.fallback.reset(key);
        self.backend.reset(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakyBackend {
        reachable: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RateLimitBackend for FlakyBackend {
        async fn check(&self, _key: &str) -> Result<RateLimitDecision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reachable.load(Ordering::SeqCst) {
                Ok(RateLimitDecision {
                    allowed: true,
                    remaining: 99,
                    reset_ms: 0,
                    retry_after_ms: None,
                })
            } else {
                Err(Error::provider("rate-limit-backend", "connection refused"))
            }
        }

        async fn reset(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    fn limiter(fail_mode: FailMode, reachable: bool) -> (RemoteRateLimiter, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(reachable));
        let backend = FlakyBackend {
            reachable: Arc::clone(&flag),
            calls: Arc::new(AtomicUsize::new(0)),
        };
        (
            RemoteRateLimiter::new(Box::new(backend), LimiterConfig::new(3, 1000), fail_mode),
            flag,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_backend_decides() {
        let (limiter, _) = limiter(FailMode::Closed, true);
        let decision = limiter.check("agent-a").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 99);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_open_allows() {
        let (limiter, _) = limiter(FailMode::Open, false);
        for _ in 0..10 {
            assert!(limiter.check("agent-a").await.allowed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_closed_denies_with_fixed_retry() {
        let (limiter, _) = limiter(FailMode::Closed, false);
        let decision = limiter.check("agent-a").await;
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, Some(FAIL_CLOSED_RETRY_MS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_fallback_enforces_locally() {
        let (limiter, _) = limiter(FailMode::LocalFallback, false);

        // First 3 requests pass through the embedded local limiter
        for _ in 0..3 {
            assert!(limiter.check("agent-a").await.allowed);
        }
        // The 4th is denied by the local bucket
        let denied = limiter.check("agent-a").await;
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms.unwrap() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_returns_to_backend() {
        let (limiter, reachable) = limiter(FailMode::LocalFallback, false);
        for _ in 0..4 {
            limiter.check("agent-a").await;
        }

        reachable.store(true, Ordering::SeqCst);
        let decision = limiter.check("agent-a").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 99);
    }
}
