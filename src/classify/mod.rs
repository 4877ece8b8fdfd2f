//! Classification pipeline.
//!
//! Classifies free-form text into guideline, knowledge, or tool:
//!
//! 1. Normalize (trim; lowercase for matching only)
//! 2. Evaluate the fixed, ordered rule set
//! 3. Weight each match by its live feedback multiplier
//! 4. Max effective score wins; low-confidence results may consult the
//!    LLM fallback
//! 5. Cache by input hash with LRU eviction and TTL
//!
//! Corrections feed back into per-pattern multipliers so misfiring rules
//! lose influence over time.

mod cache;
mod classifier;
mod feedback;
mod rules;

pub use cache::{input_hash, ClassificationCache};
pub use classifier::{
    Classification, ClassificationMethod, Classifier, LlmFallback, FLOOR_CONFIDENCE,
};
pub use feedback::{PatternConfidence, PatternConfidenceStore};
pub use rules::{match_window, matching_rules, Rule, MATCH_WINDOW_BYTES, RULES};
