//! Rule-based text classifier with feedback-adjusted confidence.
//!
//! Free-form text is classified into guideline, knowledge, or tool with a
//! confidence in [0, 1]. The regex rule set decides almost everything; an
//! optional LLM fallback is consulted only below the low-confidence
//! threshold. Results are cached by input hash.

use crate::artifact::EntryType;
use crate::classify::cache::{input_hash, ClassificationCache};
use crate::classify::feedback::PatternConfidenceStore;
use crate::classify::rules::{match_window, matching_rules};
use crate::config::ClassificationConfig;
use crate::error::Result;
use crate::storage::StorageAdapter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Confidence returned for inputs no rule matched.
pub const FLOOR_CONFIDENCE: f64 = 0.3;

/// How a classification was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationMethod {
    Regex,
    Llm,
    Default,
}

impl ClassificationMethod {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Regex => "regex",
            Self::Llm => "llm",
            Self::Default => "default",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "regex" => Self::Regex,
            "llm" => Self::Llm,
            _ => Self::Default,
        }
    }
}

/// Outcome of classifying one input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub entry_type: EntryType,
    pub confidence: f64,
    pub method: ClassificationMethod,
    /// Winning rule, when the regex path decided
    pub pattern_id: Option<String>,
}

/// Seam for the optional LLM fallback.
#[async_trait]
pub trait LlmFallback: Send + Sync {
    /// Classify text, returning the kind and a confidence in [0, 1].
    async fn classify(&self, text: &str) -> Result<(EntryType, f64)>;

    /// Whether the provider can currently serve requests.
    fn is_available(&self) -> bool {
        true
    }
}

/// The classification pipeline.
pub struct Classifier {
    config: ClassificationConfig,
    confidence: PatternConfidenceStore,
    cache: ClassificationCache,
    fallback: Option<Arc<dyn LlmFallback>>,
}

impl Classifier {
    pub fn new(adapter: Arc<StorageAdapter>, config: ClassificationConfig) -> Self {
        let cache = ClassificationCache::new(
            config.cache_size,
            Duration::from_millis(config.cache_ttl_ms),
        );
        let confidence = PatternConfidenceStore::new(adapter, config.clone());
        Self {
            config,
            confidence,
            cache,
            fallback: None,
        }
    }

    /// Attach an LLM fallback consulted below the low-confidence threshold.
    pub fn with_fallback(mut self, fallback: Arc<dyn LlmFallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Classify free-form text.
    pub async fn classify(&self, text: &str) -> Result<Classification> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Classification {
                entry_type: EntryType::Knowledge,
                confidence: FLOOR_CONFIDENCE,
                method: ClassificationMethod::Default,
                pattern_id: None,
            });
        }

        let hash = input_hash(trimmed);
        if let Some((entry_type, confidence, method)) = self.cache.get(&hash) {
            return Ok(Classification {
                entry_type,
                confidence,
                method: ClassificationMethod::from_str(method),
                pattern_id: None,
            });
        }

        let mut result = self.classify_regex(trimmed);

        if result.confidence < self.config.low_confidence_threshold
            && self.config.enable_llm_fallback
        {
            if let Some(fallback) = self.fallback.as_ref().filter(|f| f.is_available()) {
                // Suspending on the provider inside a transaction is the
                // exact bug the escape detector exists for
                StorageAdapter::guard_async("llm classification fallback")?;
                match fallback.classify(trimmed).await {
                    Ok((entry_type, confidence)) => {
                        result = Classification {
                            entry_type,
                            confidence: confidence.clamp(0.0, 1.0),
                            method: ClassificationMethod::Llm,
                            pattern_id: None,
                        };
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "llm fallback failed; keeping regex result");
                    }
                }
            }
        }

        self.cache.put(
            hash,
            result.entry_type,
            result.confidence,
            result.method.as_str(),
        );
        Ok(result)
    }

    /// The synchronous regex path: max effective score wins, ties break in
    /// rule order.
    pub fn classify_regex(&self, text: &str) -> Classification {
        let lowered = match_window(text).to_lowercase();
        let matched = matching_rules(&lowered);

        let mut best: Option<(&'static str, EntryType, f64)> = None;
        for rule in matched {
            let multiplier = self.confidence.multiplier(rule.pattern_id);
            let score = (rule.base_weight * multiplier).clamp(0.0, 1.0);
            // Strictly-greater keeps the earliest rule on ties
            if best.map(|(_, _, s)| score > s).unwrap_or(true) {
                best = Some((rule.pattern_id, rule.target, score));
            }
        }

        match best {
            Some((pattern_id, entry_type, score)) => Classification {
                entry_type,
                confidence: score,
                method: ClassificationMethod::Regex,
                pattern_id: Some(pattern_id.to_string()),
            },
            None => Classification {
                entry_type: EntryType::Knowledge,
                confidence: FLOOR_CONFIDENCE,
                method: ClassificationMethod::Default,
                pattern_id: None,
            },
        }
    }

    /// Record a correction: persists feedback, nudges the multipliers of
    /// the patterns that matched, and invalidates the cached result.
    pub fn record_correction(
        &self,
        text: &str,
        predicted: EntryType,
        actual: EntryType,
    ) -> Result<()> {
        self.confidence.record_correction(text, predicted, actual)?;
        self.cache.remove(&input_hash(text.trim()));
        Ok(())
    }

    /// The pattern-confidence store (diagnostics, tests).
    pub fn confidence_store(&self) -> &PatternConfidenceStore {
        &self.confidence
    }

    /// (hits, misses) of the result cache.
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn classifier() -> Classifier {
        Classifier::new(
            StorageAdapter::in_memory().unwrap(),
            ClassificationConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_clear_samples() {
        let classifier = classifier();

        let guideline = classifier
            .classify("Rule: always use strict mode")
            .await
            .unwrap();
        assert_eq!(guideline.entry_type, EntryType::Guideline);
        assert_eq!(guideline.method, ClassificationMethod::Regex);
        assert!(guideline.confidence >= 0.6);

        let knowledge = classifier
            .classify("We decided to use React")
            .await
            .unwrap();
        assert_eq!(knowledge.entry_type, EntryType::Knowledge);
        assert!(knowledge.confidence >= 0.6);

        let tool = classifier.classify("npm run build").await.unwrap();
        assert_eq!(tool.entry_type, EntryType::Tool);
        assert!(tool.confidence >= 0.6);
    }

    #[tokio::test]
    async fn test_labeled_set_accuracy() {
        let classifier = classifier();
        let samples: Vec<(&str, EntryType)> = vec![
            ("Rule: always use strict mode", EntryType::Guideline),
            ("Always run the linter before committing", EntryType::Guideline),
            ("Never push directly to main", EntryType::Guideline),
            ("Avoid unwrap in library code", EntryType::Guideline),
            ("Prefer composition over inheritance", EntryType::Guideline),
            ("Guideline: keep functions under 50 lines", EntryType::Guideline),
            ("When editing migrations, always add a new file", EntryType::Guideline),
            ("Do not commit secrets to the repository", EntryType::Guideline),
            ("We decided to use React", EntryType::Knowledge),
            ("We chose Postgres over MySQL for JSON support", EntryType::Knowledge),
            ("Decision: the API stays versionless until v2", EntryType::Knowledge),
            ("Note: the staging cluster lives in us-east-1", EntryType::Knowledge),
            ("The deploy pipeline uses blue-green rollouts", EntryType::Knowledge),
            ("FYI: rate limits reset at midnight UTC", EntryType::Knowledge),
            ("The auth service requires mTLS internally", EntryType::Knowledge),
            ("Learned: the flaky test was a timezone bug", EntryType::Knowledge),
            ("npm run build", EntryType::Tool),
            ("cargo test --workspace", EntryType::Tool),
            ("git rebase -i HEAD~3", EntryType::Tool),
            ("docker compose up -d", EntryType::Tool),
            ("make lint", EntryType::Tool),
            ("kubectl get pods -n prod", EntryType::Tool),
        ];

        let mut correct = 0usize;
        for (text, expected) in &samples {
            let result = classifier.classify(text).await.unwrap();
            if result.entry_type == *expected {
                correct += 1;
            }
        }
        let accuracy = correct as f64 / samples.len() as f64;
        assert!(accuracy >= 0.9, "accuracy {} below 0.9", accuracy);
    }

    #[tokio::test]
    async fn test_empty_input_defaults_to_knowledge() {
        let classifier = classifier();
        let result = classifier.classify("   ").await.unwrap();
        assert_eq!(result.entry_type, EntryType::Knowledge);
        assert_eq!(result.method, ClassificationMethod::Default);
        assert!(result.confidence <= FLOOR_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_inputs() {
        let classifier = classifier();
        classifier.classify("npm run build").await.unwrap();
        classifier.classify("npm run build").await.unwrap();

        let (hits, misses) = classifier.cache_stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
    }

    #[tokio::test]
    async fn test_corrections_shift_future_classifications() {
        let classifier = classifier();
        let text = "Rule: always use strict mode";

        let before = classifier.classify(text).await.unwrap();
        for _ in 0..5 {
            classifier
                .record_correction(text, EntryType::Guideline, EntryType::Knowledge)
                .unwrap();
        }
        let after = classifier.classify(text).await.unwrap();
        assert!(after.confidence < before.confidence);

        let row = classifier
            .confidence_store()
            .get("guideline-prefix")
            .unwrap()
            .unwrap();
        assert!(row.incorrect_matches > 0);
    }

    struct FixedFallback {
        calls: AtomicUsize,
        available: AtomicBool,
    }

    #[async_trait]
    impl LlmFallback for FixedFallback {
        async fn classify(&self, _text: &str) -> Result<(EntryType, f64)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((EntryType::Guideline, 0.82))
        }

        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_llm_fallback_only_below_threshold() {
        let fallback = Arc::new(FixedFallback {
            calls: AtomicUsize::new(0),
            available: AtomicBool::new(true),
        });
        let mut config = ClassificationConfig::default();
        config.enable_llm_fallback = true;

        let classifier = Classifier::new(StorageAdapter::in_memory().unwrap(), config)
            .with_fallback(fallback.clone());

        // Strong regex match: fallback not consulted
        let result = classifier.classify("npm run build").await.unwrap();
        assert_eq!(result.method, ClassificationMethod::Regex);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);

        // No rule matches: fallback decides
        let result = classifier.classify("zzz qqq xyzzy").await.unwrap();
        assert_eq!(result.method, ClassificationMethod::Llm);
        assert_eq!(result.entry_type, EntryType::Guideline);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);

        // Unavailable provider: regex/default result stands
        fallback.available.store(false, Ordering::SeqCst);
        let result = classifier.classify("qqq zzz xyzzy plugh").await.unwrap();
        assert_eq!(result.method, ClassificationMethod::Default);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }
}
