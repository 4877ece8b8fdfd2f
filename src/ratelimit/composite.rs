//! Composite rate limiter: burst, then global, then per-agent.
//!
//! Every request passes the three stages in that normative order; the
//! first rejection wins and the decision names the stage that rejected.

use crate::config::RateLimitSettings;
use crate::error::{Error, Result};
use crate::ratelimit::local::LocalRateLimiter;

/// Key used by the service-wide stages.
const SERVICE_KEY: &str = "service";

/// Which stage rejected, when one did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectingStage {
    Burst,
    Global,
    PerAgent,
}

impl std::fmt::Display for RejectingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Burst => write!(f, "burst"),
            Self::Global => write!(f, "global"),
            Self::PerAgent => write!(f, "per-agent"),
        }
    }
}

/// Outcome of a composite check.
#[derive(Debug, Clone)]
pub struct CompositeDecision {
    pub allowed: bool,
    pub rejected_by: Option<RejectingStage>,
    pub retry_after_ms: Option<u64>,
}

impl CompositeDecision {
    /// Convert a denial into the error returned to tool callers.
    pub fn into_result(self) -> Result<()> {
        match self.rejected_by {
            None => Ok(()),
            Some(stage) => Err(Error::RateLimited {
                limiter: stage.to_string(),
                retry_after_ms: self.retry_after_ms.unwrap_or(0),
            }),
        }
    }
}

/// The three-stage limiter guarding every tool request.
pub struct CompositeRateLimiter {
    burst: LocalRateLimiter,
    global: LocalRateLimiter,
    per_agent: LocalRateLimiter,
}

impl CompositeRateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            burst: LocalRateLimiter::new(settings.burst.clone()),
            global: LocalRateLimiter::new(settings.global.clone()),
            per_agent: LocalRateLimiter::new(settings.per_agent.clone()),
        }
    }

    /// Run one request through burst -> global -> per-agent.
    pub fn check(&self, agent_id: &str) -> CompositeDecision {
        let stages: [(&LocalRateLimiter, &str, RejectingStage); 3] = [
            (&self.burst, SERVICE_KEY, RejectingStage::Burst),
            (&self.global, SERVICE_KEY, RejectingStage::Global),
            (&self.per_agent, agent_id, RejectingStage::PerAgent),
        ];

        for (limiter, key, stage) in stages {
            let decision = limiter.check(key);
            if !decision.allowed {
                tracing::debug!(agent_id, stage = %stage, "request rate limited");
                return CompositeDecision {
                    allowed: false,
                    rejected_by: Some(stage),
                    retry_after_ms: decision.retry_after_ms,
                };
            }
        }

        CompositeDecision {
            allowed: true,
            rejected_by: None,
            retry_after_ms: None,
        }
    }

    /// Clear one agent's bucket (the shared stages are untouched).
    pub fn reset_agent(&self, agent_id: &str) {
        self.per_agent.reset(agent_id);
    }

    /// Clear every bucket in every stage.
    pub fn reset_all(&self) {
        self.burst.reset_all();
        self.global.reset_all();
        self.per_agent.reset_all();
    }

    /// Stop enforcement on every stage.
    pub fn stop(&self) {
        self.burst.stop();
        self.global.stop();
        self.per_agent.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterConfig;

    fn settings(burst: u64, global: u64, per_agent: u64) -> RateLimitSettings {
        RateLimitSettings {
            burst: LimiterConfig::new(burst, 1_000),
            global: LimiterConfig::new(global, 60_000),
            per_agent: LimiterConfig::new(per_agent, 60_000),
            fail_mode: crate::config::FailMode::LocalFallback,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_agent_stage_rejects_last() {
        let limiter = CompositeRateLimiter::new(&settings(100, 100, 2));

        assert!(limiter.check("agent-a").allowed);
        assert!(limiter.check("agent-a").allowed);
        let denied = limiter.check("agent-a");
        assert!(!denied.allowed);
        assert_eq!(denied.rejected_by, Some(RejectingStage::PerAgent));

        // Another agent is unaffected
        assert!(limiter.check("agent-b").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_stage_rejects_first() {
        // Burst would deny on the 2nd request; global would deny on the
        // 2nd as well. Burst is first in the normative order, so it names
        // the rejection.
        let limiter = CompositeRateLimiter::new(&settings(1, 1, 100));

        assert!(limiter.check("agent-a").allowed);
        let denied = limiter.check("agent-a");
        assert!(!denied.allowed);
        assert_eq!(denied.rejected_by, Some(RejectingStage::Burst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_stage_shared_across_agents() {
        let limiter = CompositeRateLimiter::new(&settings(100, 3, 100));

        assert!(limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
        assert!(limiter.check("c").allowed);
        let denied = limiter.check("d");
        assert!(!denied.allowed);
        assert_eq!(denied.rejected_by, Some(RejectingStage::Global));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_converts_to_error() {
        let limiter = CompositeRateLimiter::new(&settings(1, 100, 100));
        limiter.check("a");

        let err = limiter.check("a").into_result().unwrap_err();
        match err {
            Error::RateLimited { limiter, retry_after_ms } => {
                assert_eq!(limiter, "burst");
                assert!(retry_after_ms > 0);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_agent_only_clears_that_bucket() {
        let limiter = CompositeRateLimiter::new(&settings(100, 100, 1));
        assert!(limiter.check("a").allowed);
        assert!(!limiter.check("a").allowed);

        limiter.reset_agent("a");
        assert!(limiter.check("a").allowed);
    }
}
