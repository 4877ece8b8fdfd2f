//! Configuration snapshot for the memory service.
//!
//! Configuration is read once at boot into an immutable snapshot and passed
//! by value into each component. Hot paths never read the process
//! environment; `MemoryConfig::from_env` is the only place env vars are
//! consulted.

use serde::{Deserialize, Serialize};

/// Context-detection behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoContextConfig {
    pub enabled: bool,
    pub cache_ttl_ms: u64,
    pub default_agent_id: String,
    /// Automatically attach the active session when resolving scope
    pub auto_session: bool,
}

impl Default for AutoContextConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl_ms: 30_000,
            default_agent_id: "default-agent".to_string(),
            auto_session: true,
        }
    }
}

/// Classification pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    pub high_confidence_threshold: f64,
    pub low_confidence_threshold: f64,
    pub enable_llm_fallback: bool,
    /// Feedback older than this is excluded from multiplier aggregates
    pub feedback_decay_days: i64,
    pub max_pattern_boost: f64,
    pub max_pattern_penalty: f64,
    pub cache_size: usize,
    pub cache_ttl_ms: u64,
    pub learning_rate: f64,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            high_confidence_threshold: 0.8,
            low_confidence_threshold: 0.55,
            enable_llm_fallback: false,
            feedback_decay_days: 30,
            max_pattern_boost: 0.3,
            max_pattern_penalty: 0.5,
            cache_size: 512,
            cache_ttl_ms: 300_000,
            learning_rate: 0.1,
        }
    }
}

/// Behavior when the remote rate-limit backend is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailMode {
    /// Allow the request and log a security warning
    Open,
    /// Deny with a fixed retry-after
    Closed,
    /// Route through an embedded local limiter for the outage
    LocalFallback,
}

impl std::str::FromStr for FailMode {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "local-fallback" => Ok(Self::LocalFallback),
            other => Err(crate::error::Error::Config(format!(
                "unknown fail mode '{}'",
                other
            ))),
        }
    }
}

/// One token-bucket limiter's parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub max_requests: u64,
    pub window_ms: u64,
    pub enabled: bool,
    /// Minimum short-window token rate enforced regardless of `max_requests`
    pub min_burst_protection: u64,
}

impl LimiterConfig {
    pub fn new(max_requests: u64, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
            enabled: true,
            min_burst_protection: 10,
        }
    }
}

/// Full rate-limiting settings for the composite limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub per_agent: LimiterConfig,
    pub global: LimiterConfig,
    pub burst: LimiterConfig,
    pub fail_mode: FailMode,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            per_agent: LimiterConfig::new(120, 60_000),
            global: LimiterConfig::new(1_000, 60_000),
            burst: LimiterConfig::new(50, 1_000),
            fail_mode: FailMode::LocalFallback,
        }
    }
}

impl RateLimitSettings {
    /// Disable every limiter (honors `RATE_LIMIT=0`).
    pub fn disabled() -> Self {
        let mut settings = Self::default();
        settings.per_agent.enabled = false;
        settings.global.enabled = false;
        settings.burst.enabled = false;
        settings
    }
}

/// Hook-learning behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    pub enabled: bool,
    /// Identical failures required before an experience is created
    pub min_failures_for_experience: u32,
    pub error_pattern_threshold: u32,
    pub error_pattern_window_ms: u64,
    /// Created experiences needed to trigger a librarian analysis
    pub analysis_threshold: u32,
    pub default_confidence: f64,
    pub include_tool_input: bool,
    pub enable_knowledge_extraction: bool,
    pub knowledge_confidence_threshold: f64,
    pub knowledge_extraction_tools: Vec<String>,
    pub min_output_length_for_knowledge: usize,
    /// Subagent summaries shorter than this are not significant
    pub min_summary_length_for_success: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_failures_for_experience: 2,
            error_pattern_threshold: 3,
            error_pattern_window_ms: 300_000,
            analysis_threshold: 5,
            default_confidence: 0.7,
            include_tool_input: false,
            enable_knowledge_extraction: false,
            knowledge_confidence_threshold: 0.6,
            knowledge_extraction_tools: vec!["Bash".to_string(), "WebFetch".to_string()],
            min_output_length_for_knowledge: 200,
            min_summary_length_for_success: 80,
        }
    }
}

/// Pagination cursor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// HMAC secret; generated when absent. Short secrets log a warning.
    pub secret: Option<String>,
    pub ttl_ms: u64,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ttl_ms: 600_000,
        }
    }
}

/// Embedding pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub reembed_batch_size: usize,
    pub reembed_batch_delay_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_attempts: 3,
            retry_base_delay_ms: 500,
            reembed_batch_size: 50,
            reembed_batch_delay_ms: 100,
        }
    }
}

/// Timestamp display settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampConfig {
    pub display_timezone: String,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            display_timezone: "UTC".to_string(),
        }
    }
}

/// The complete immutable configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub auto_context: AutoContextConfig,
    pub classification: ClassificationConfig,
    pub rate_limit: RateLimitSettings,
    pub learning: LearningConfig,
    pub cursor: CursorConfig,
    pub embedding: EmbeddingConfig,
    pub timestamps: TimestampConfig,
}

impl MemoryConfig {
    /// Read the snapshot from the process environment.
    ///
    /// Recognized variables:
    /// - `RATE_LIMIT=0` disables all rate limiting
    /// - `AMEM_RATE_LIMIT_FAIL_MODE` = open | closed | local-fallback
    /// - `AMEM_CURSOR_SECRET` - cursor HMAC secret (>= 32 bytes recommended)
    /// - `AMEM_AGENT_ID` - default agent identity
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if std::env::var("RATE_LIMIT").as_deref() == Ok("0") {
            config.rate_limit = RateLimitSettings::disabled();
        }
        if let Ok(mode) = std::env::var("AMEM_RATE_LIMIT_FAIL_MODE") {
            if let Ok(parsed) = mode.parse() {
                config.rate_limit.fail_mode = parsed;
            } else {
                tracing::warn!(mode = %mode, "ignoring unknown rate-limit fail mode");
            }
        }
        if let Ok(secret) = std::env::var("AMEM_CURSOR_SECRET") {
            config.cursor.secret = Some(secret);
        }
        if let Ok(agent_id) = std::env::var("AMEM_AGENT_ID") {
            config.auto_context.default_agent_id = agent_id;
        }

        config
    }

    /// Rebuild the snapshot from the current environment. Test hook only;
    /// production code holds the boot-time snapshot for its lifetime.
    pub fn reload_for_tests() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = MemoryConfig::default();
        assert!(config.classification.low_confidence_threshold < config.classification.high_confidence_threshold);
        assert!(config.rate_limit.burst.window_ms <= config.rate_limit.global.window_ms);
        assert_eq!(config.embedding.max_concurrency, 4);
    }

    #[test]
    fn test_fail_mode_parse() {
        assert_eq!("open".parse::<FailMode>().unwrap(), FailMode::Open);
        assert_eq!("closed".parse::<FailMode>().unwrap(), FailMode::Closed);
        assert_eq!(
            "local-fallback".parse::<FailMode>().unwrap(),
            FailMode::LocalFallback
        );
        assert!("crash".parse::<FailMode>().is_err());
    }

    #[test]
    fn test_disabled_settings() {
        let settings = RateLimitSettings::disabled();
        assert!(!settings.per_agent.enabled);
        assert!(!settings.global.enabled);
        assert!(!settings.burst.enabled);
    }
}
