//! Pattern-confidence store and correction feedback.
//!
//! Each rule's live multiplier is bounded to
//! `[1 - max_penalty, 1 + max_boost]`. Corrections nudge the multipliers of
//! the rules that matched the corrected text; feedback older than the decay
//! window is excluded from aggregates.

use crate::artifact::EntryType;
use crate::classify::cache::input_hash;
use crate::classify::rules::{match_window, matching_rules};
use crate::config::ClassificationConfig;
use crate::error::Result;
use crate::storage::StorageAdapter;
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

/// Live confidence state of one pattern.
#[derive(Debug, Clone)]
pub struct PatternConfidence {
    pub pattern_id: String,
    pub correct_matches: i64,
    pub incorrect_matches: i64,
    pub multiplier: f64,
}

/// Persistent store for per-pattern feedback multipliers.
pub struct PatternConfidenceStore {
    adapter: Arc<StorageAdapter>,
    config: ClassificationConfig,
}

impl PatternConfidenceStore {
    pub fn new(adapter: Arc<StorageAdapter>, config: ClassificationConfig) -> Self {
        Self { adapter, config }
    }

    fn clamp(&self, multiplier: f64) -> f64 {
        multiplier.clamp(
            1.0 - self.config.max_pattern_penalty,
            1.0 + self.config.max_pattern_boost,
        )
    }

    /// The live multiplier for a pattern (1.0 when no feedback exists).
    pub fn multiplier(&self, pattern_id: &str) -> f64 {
        let stored: Option<f64> = self
            .adapter
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT multiplier FROM pattern_confidence WHERE pattern_id = ?1",
                    params![pattern_id],
                    |row| row.get(0),
                )
                .optional()
            })
            .unwrap_or(None);
        self.clamp(stored.unwrap_or(1.0))
    }

    /// Full confidence row for a pattern.
    pub fn get(&self, pattern_id: &str) -> Result<Option<PatternConfidence>> {
        self.adapter.with_conn(|conn| {
            conn.query_row(
                "SELECT pattern_id, correct_matches, incorrect_matches, multiplier
                 FROM pattern_confidence WHERE pattern_id = ?1",
                params![pattern_id],
                |row| {
                    Ok(PatternConfidence {
                        pattern_id: row.get(0)?,
                        correct_matches: row.get(1)?,
                        incorrect_matches: row.get(2)?,
                        multiplier: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Record a correction and nudge every pattern that matched the text.
    ///
    /// Correct prediction: multiplier moves toward `1 + max_boost` by
    /// `learning_rate` of the remaining headroom. Incorrect: toward
    /// `1 - max_penalty` by `learning_rate` of the remaining penalty room.
    pub fn record_correction(
        &self,
        text: &str,
        predicted: EntryType,
        actual: EntryType,
    ) -> Result<()> {
        let lowered = match_window(text).to_lowercase();
        let matched = matching_rules(&lowered);
        let hash = input_hash(text);

        self.adapter.transaction(|conn| {
            conn.execute(
                "INSERT INTO classification_feedback (text_hash, text, predicted, actual, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    hash,
                    lowered,
                    predicted.to_string(),
                    actual.to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| crate::error::Error::Storage(e.to_string()))?;

            for rule in &matched {
                // A pattern was "correct" when it voted for the actual kind
                let correct = rule.target == actual;
                let current: f64 = conn
                    .query_row(
                        "SELECT multiplier FROM pattern_confidence WHERE pattern_id = ?1",
                        params![rule.pattern_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| crate::error::Error::Storage(e.to_string()))?
                    .unwrap_or(1.0);

                let next = if correct {
                    let headroom = (1.0 + self.config.max_pattern_boost) - current;
                    current + self.config.learning_rate * headroom.max(0.0)
                } else {
                    let room = current - (1.0 - self.config.max_pattern_penalty);
                    current - self.config.learning_rate * room.max(0.0)
                };
                let next = self.clamp(next);

                conn.execute(
                    "INSERT INTO pattern_confidence
                         (pattern_id, correct_matches, incorrect_matches, multiplier, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(pattern_id) DO UPDATE SET
                         correct_matches = correct_matches + excluded.correct_matches,
                         incorrect_matches = incorrect_matches + excluded.incorrect_matches,
                         multiplier = excluded.multiplier,
                         updated_at = excluded.updated_at",
                    params![
                        rule.pattern_id,
                        correct as i64,
                        (!correct) as i64,
                        next,
                        Utc::now().to_rfc3339(),
                    ],
                )
                .map_err(|e| crate::error::Error::Storage(e.to_string()))?;
            }

            Ok(())
        })?;

        tracing::debug!(
            predicted = %predicted,
            actual = %actual,
            patterns = matched.len(),
            "classification correction recorded"
        );
        Ok(())
    }

    /// Feedback rows inside the decay window for a text hash.
    pub fn recent_feedback_count(&self, text: &str) -> Result<i64> {
        let hash = input_hash(text);
        let cutoff = Utc::now() - Duration::days(self.config.feedback_decay_days);
        self.adapter.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM classification_feedback
                 WHERE text_hash = ?1 AND created_at >= ?2",
                params![hash, cutoff.to_rfc3339()],
                |row| row.get(0),
            )
        })
    }

    /// Delete feedback older than the decay window; stale rows no longer
    /// contribute to any aggregate.
    pub fn prune_decayed(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(self.config.feedback_decay_days);
        let deleted = self.adapter.with_conn(|conn| {
            conn.execute(
                "DELETE FROM classification_feedback WHERE created_at < ?1",
                params![cutoff.to_rfc3339()],
            )
        })?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PatternConfidenceStore {
        PatternConfidenceStore::new(
            StorageAdapter::in_memory().unwrap(),
            ClassificationConfig::default(),
        )
    }

    #[test]
    fn test_default_multiplier_is_one() {
        let store = store();
        assert!((store.multiplier("guideline-prefix") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_incorrect_corrections_decrease_multiplier() {
        let store = store();
        let text = "Rule: always use strict mode";

        let mut last = store.multiplier("guideline-prefix");
        for _ in 0..5 {
            store
                .record_correction(text, EntryType::Guideline, EntryType::Knowledge)
                .unwrap();
            let current = store.multiplier("guideline-prefix");
            assert!(current < last, "multiplier did not strictly decrease");
            last = current;
        }

        let row = store.get("guideline-prefix").unwrap().unwrap();
        assert!(row.incorrect_matches > 0);
        // Bounded below
        let config = ClassificationConfig::default();
        assert!(row.multiplier >= 1.0 - config.max_pattern_penalty);
    }

    #[test]
    fn test_correct_corrections_increase_multiplier() {
        let store = store();
        let text = "Rule: always use strict mode";

        store
            .record_correction(text, EntryType::Guideline, EntryType::Guideline)
            .unwrap();
        assert!(store.multiplier("guideline-prefix") > 1.0);

        let config = ClassificationConfig::default();
        for _ in 0..50 {
            store
                .record_correction(text, EntryType::Guideline, EntryType::Guideline)
                .unwrap();
        }
        // Bounded above even after many boosts
        assert!(store.multiplier("guideline-prefix") <= 1.0 + config.max_pattern_boost + 1e-9);
    }

    #[test]
    fn test_feedback_rows_recorded() {
        let store = store();
        store
            .record_correction("npm run build", EntryType::Tool, EntryType::Tool)
            .unwrap();
        assert_eq!(store.recent_feedback_count("npm run build").unwrap(), 1);
        assert_eq!(store.recent_feedback_count("other text").unwrap(), 0);
    }
}
