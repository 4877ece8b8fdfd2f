//! Circuit breakers for outbound integrations.
//!
//! Every external call (embedding provider, LLM fallback, remote rate-limit
//! backend) goes through a per-service breaker:
//!
//! - **Closed**: calls pass through; consecutive failures are counted
//! - **Open**: calls are rejected without invoking the wrapped future
//! - **HalfOpen**: a probe window after the reset deadline; consecutive
//!   successes close the breaker, a single failure reopens it

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Breaker state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in Closed before opening
    pub failure_threshold: u32,
    /// Consecutive successes in HalfOpen before closing
    pub success_threshold: u32,
    /// How long Open lasts before the next call probes
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Observable breaker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Consecutive failures in the current Closed window
    pub failures: u32,
    /// Consecutive successes in the current HalfOpen window
    pub successes: u32,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
}

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    opened_at: Option<Instant>,
    reset_deadline: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    last_failure_time: Option<DateTime<Utc>>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            successes: 0,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            opened_at: None,
            reset_deadline: None,
            last_success_time: None,
            last_failure_time: None,
        }
    }
}

type FailurePredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Per-service circuit breaker.
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    /// Decides whether an error counts as a breaker failure.
    /// Errors that do not count still propagate unchanged.
    is_failure: FailurePredicate,
}

impl CircuitBreaker {
    /// Create a breaker counting every error as a failure.
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            is_failure: Arc::new(|_| true),
        }
    }

    /// Set a predicate deciding which errors count as failures.
    pub fn with_failure_predicate(
        mut self,
        predicate: impl Fn(&Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_failure = Arc::new(predicate);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Run `f` through the breaker.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                BreakerState::Open => {
                    let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                    if elapsed >= self.config.reset_timeout {
                        inner.state = BreakerState::HalfOpen;
                        inner.successes = 0;
                        tracing::debug!(service = %self.service, "circuit breaker half-open");
                    } else {
                        let reset_time = inner.reset_deadline.unwrap_or_else(Utc::now);
                        return Err(Error::CircuitBreakerOpen {
                            service: self.service.clone(),
                            reset_time,
                        });
                    }
                }
                BreakerState::Closed | BreakerState::HalfOpen => {}
            }
            inner.total_calls += 1;
        }

        match f().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                if (self.is_failure)(&err) {
                    self.record_failure().await;
                }
                Err(err)
            }
        }
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_successes += 1;
        inner.last_success_time = Some(Utc::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.opened_at = None;
                    inner.reset_deadline = None;
                    tracing::info!(service = %self.service, "circuit breaker closed");
                }
            }
            BreakerState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_failures += 1;
        inner.last_failure_time = Some(Utc::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            BreakerState::HalfOpen => {
                self.trip(&mut inner);
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.reset_deadline = Some(
            Utc::now()
                + chrono::Duration::from_std(self.config.reset_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30)),
        );
        inner.successes = 0;
        tracing::warn!(
            service = %self.service,
            failures = inner.failures,
            "circuit breaker opened"
        );
    }

    /// Current state without invoking anything.
    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    /// Current statistics.
    pub async fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().await;
        BreakerStats {
            state: inner.state,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            failures: inner.failures,
            successes: inner.successes,
            last_success_time: inner.last_success_time,
            last_failure_time: inner.last_failure_time,
        }
    }

    /// Force the breaker back to Closed and clear counts.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        *inner = BreakerInner::new();
    }
}

/// Process-wide registry: the same service name always yields the same
/// breaker instance.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: std::sync::Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            breakers: std::sync::Mutex::new(HashMap::new()),
            default_config,
        }
    }

    /// Get or create the breaker for a service.
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("breaker registry poisoned");
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(service, self.default_config.clone()))
            })
            .clone()
    }

    /// Every registered breaker.
    pub fn get_all(&self) -> Vec<Arc<CircuitBreaker>> {
        let breakers = self.breakers.lock().expect("breaker registry poisoned");
        breakers.values().cloned().collect()
    }

    /// Stats for every registered breaker, keyed by service name.
    pub async fn get_all_stats(&self) -> HashMap<String, BreakerStats> {
        let breakers = self.get_all();
        let stats = futures::future::join_all(
            breakers.iter().map(|breaker| breaker.stats()),
        )
        .await;
        breakers
            .iter()
            .map(|breaker| breaker.service().to_string())
            .zip(stats)
            .collect()
    }

    /// Reset every registered breaker.
    pub async fn reset_all(&self) {
        for breaker in self.get_all() {
            breaker.reset().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(50),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(|| async { Err::<(), _>(Error::provider("test", "boom")) })
            .await
            .map(|_| ())
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<()> {
        breaker.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("svc", fast_config());

        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, BreakerState::Open);

        // Wrapped function must not run while open
        let calls = AtomicUsize::new(0);
        let result = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::CircuitBreakerOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_half_open_recovery() {
        let breaker = CircuitBreaker::new("svc", fast_config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("svc", fast_config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state().await, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_failure_predicate_filters() {
        let breaker = CircuitBreaker::new("svc", fast_config())
            .with_failure_predicate(|e| e.is_transient());

        // NotFound does not count, but still propagates
        for _ in 0..5 {
            let result: Result<()> = breaker
                .call(|| async { Err(Error::not_found("guideline", "g1")) })
                .await;
            assert!(matches!(result, Err(Error::NotFound { .. })));
        }
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_registry_returns_same_instance() {
        let registry = BreakerRegistry::new(fast_config());
        let a = registry.get("embeddings");
        let b = registry.get("embeddings");
        assert!(Arc::ptr_eq(&a, &b));

        let _ = fail(&a).await;
        let stats = registry.get_all_stats().await;
        assert_eq!(stats.get("embeddings").unwrap().total_failures, 1);

        registry.reset_all().await;
        let stats = registry.get_all_stats().await;
        assert_eq!(stats.get("embeddings").unwrap().total_failures, 0);
    }
}
