//! Field validation, rule ingestion, and the regex safety guard.
//!
//! Two guards protect the write path:
//!
//! - **Date-range guard**: timestamps must parse as ISO-8601 and fall in
//!   [1970, 2100] inclusive.
//! - **ReDoS guard**: user-supplied regex rules are rejected when they
//!   match known catastrophic-backtracking shapes, before compilation.

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Inclusive year bounds for any accepted timestamp.
pub const MIN_YEAR: i32 = 1970;
pub const MAX_YEAR: i32 = 2100;

/// Accumulated validation outcome.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<(String, String)>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn push(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push((field.to_string(), message.into()));
    }

    /// Convert into a result carrying the first error.
    pub fn into_result(self) -> Result<()> {
        match self.errors.into_iter().next() {
            None => Ok(()),
            Some((field, message)) => Err(Error::Validation { field, message }),
        }
    }
}

/// Pure-data field checks.
pub struct Validator;

impl Validator {
    /// Required, non-blank string.
    pub fn require(report: &mut ValidationReport, field: &str, value: Option<&str>) {
        match value {
            Some(v) if !v.trim().is_empty() => {}
            _ => report.push(field, "is required"),
        }
    }

    /// Maximum length in characters.
    pub fn max_length(report: &mut ValidationReport, field: &str, value: &str, max: usize) {
        if value.chars().count() > max {
            report.push(field, format!("exceeds maximum length of {}", max));
        }
    }

    /// Parseable JSON object or array.
    pub fn json_shape(report: &mut ValidationReport, field: &str, value: &Value) {
        if !value.is_object() && !value.is_array() && !value.is_null() {
            report.push(field, "must be a JSON object or array");
        }
    }

    /// ISO-8601 timestamp within the accepted year range.
    pub fn date_in_range(report: &mut ValidationReport, field: &str, value: &str) {
        match DateTime::parse_from_rfc3339(value) {
            Ok(parsed) => {
                let year = parsed.with_timezone(&Utc).year();
                if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
                    report.push(
                        field,
                        format!("year {} outside accepted range [{}, {}]", year, MIN_YEAR, MAX_YEAR),
                    );
                }
            }
            Err(_) => report.push(field, "must be an ISO-8601 timestamp"),
        }
    }

    /// Confidence in [0, 1].
    pub fn confidence(report: &mut ValidationReport, field: &str, value: f64) {
        if !(0.0..=1.0).contains(&value) {
            report.push(field, "must be between 0 and 1");
        }
    }
}

// Dangerous regex shapes, checked before any user pattern compiles
static NESTED_QUANTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\([^)]*[+*?]\)[+*]|\([^)]*[+*?]\)\?\*").expect("guard regex")
});
static QUANTIFIED_GROUP_QUANTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\)\{\d+,?\d*\}[+*]|\)[+*?]\{\d+").expect("guard regex")
});
static CONSECUTIVE_QUANTIFIERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[+*]{2,}|\+\*|\*\+").expect("guard regex"));
static STACKED_GREEDY_WILDCARDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.\*\.\*|\.\+\.\+|\.\*\.\+|\.\+\.\*").expect("guard regex"));
static ALTERNATION_NESTED_QUANTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\([^)|]*[+*][^)|]*(\|[^)]*)+\)[+*]|\([^)]*\|[^)]*[+*][^)]*\)[+*]")
        .expect("guard regex")
});
static LARGE_REPETITION_BOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\d+)(?:,(\d*))?\}").expect("guard regex"));
static WORD_BOUNDARY_GREEDY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\b\.[+*].*\\b").expect("guard regex"));

/// Maximum accepted repetition bound.
pub const MAX_REPETITION: u64 = 1000;

/// Reject patterns matching dangerous shapes; returns the compiled regex
/// when safe.
pub fn compile_guarded(pattern: &str) -> Result<Regex> {
    check_pattern_safety(pattern)?;
    Regex::new(pattern).map_err(|e| Error::validation("pattern", format!("invalid regex: {}", e)))
}

/// The ReDoS shape check on its own.
pub fn check_pattern_safety(pattern: &str) -> Result<()> {
    let reject = |reason: &str| -> Result<()> {
        Err(Error::validation(
            "pattern",
            format!("potentially catastrophic regex rejected: {}", reason),
        ))
    };

    if NESTED_QUANTIFIER.is_match(pattern) {
        return reject("nested quantifier");
    }
    if QUANTIFIED_GROUP_QUANTIFIER.is_match(pattern) {
        return reject("quantifier on quantified group");
    }
    if CONSECUTIVE_QUANTIFIERS.is_match(pattern) {
        return reject("consecutive quantifiers");
    }
    if STACKED_GREEDY_WILDCARDS.is_match(pattern) {
        return reject("stacked greedy wildcards");
    }
    if ALTERNATION_NESTED_QUANTIFIER.is_match(pattern) {
        return reject("alternation containing nested quantifier");
    }
    if overlapping_alternation(pattern) {
        return reject("overlapping alternation under a quantifier");
    }
    if WORD_BOUNDARY_GREEDY.is_match(pattern) {
        return reject("word boundaries around a greedy middle");
    }
    for captures in LARGE_REPETITION_BOUND.captures_iter(pattern) {
        for idx in 1..=2 {
            if let Some(bound) = captures.get(idx) {
                if let Ok(value) = bound.as_str().parse::<u64>() {
                    if value > MAX_REPETITION {
                        return reject("repetition bound too large");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Detect `(a|a)+` / `(a|ab)+`: a quantified alternation where one branch
/// is a prefix of another.
fn overlapping_alternation(pattern: &str) -> bool {
    let bytes = pattern.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'(' {
            if let Some(close) = matching_paren(bytes, idx) {
                let quantified = bytes
                    .get(close + 1)
                    .map(|c| matches!(c, b'+' | b'*'))
                    .unwrap_or(false);
                if quantified {
                    let body = &pattern[idx + 1..close];
                    let branches: Vec<&str> = body.split('|').collect();
                    if branches.len() > 1 {
                        for (i, a) in branches.iter().enumerate() {
                            for (j, b) in branches.iter().enumerate() {
                                if i != j && !a.is_empty() && b.starts_with(a) {
                                    return true;
                                }
                            }
                        }
                    }
                }
            }
        }
        idx += 1;
    }
    false
}

fn matching_paren(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0;
    for (idx, byte) in bytes.iter().enumerate().skip(open) {
        match byte {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// A validation rule ingested from a `validation:*` guideline.
#[derive(Debug, Clone)]
pub struct IngestedRule {
    pub field: String,
    pub pattern: Regex,
}

/// Parse `validation:<field>` guideline content into a guarded rule.
///
/// The guideline's content is the regex the field must match.
pub fn ingest_rule(guideline_name: &str, content: &str) -> Result<Option<IngestedRule>> {
    let Some(field) = guideline_name.strip_prefix("validation:") else {
        return Ok(None);
    };
    let pattern = compile_guarded(content.trim())?;
    Ok(Some(IngestedRule {
        field: field.to_string(),
        pattern,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_checks() {
        let mut report = ValidationReport::default();
        Validator::require(&mut report, "name", Some("ok"));
        Validator::require(&mut report, "title", None);
        Validator::max_length(&mut report, "content", "abc", 2);
        Validator::confidence(&mut report, "confidence", 1.5);

        assert!(!report.is_valid());
        let fields: Vec<&str> = report.errors.iter().map(|(f, _)| f.as_str()).collect();
        assert_eq!(fields, vec!["title", "content", "confidence"]);
    }

    #[test]
    fn test_date_range_guard() {
        let mut report = ValidationReport::default();
        Validator::date_in_range(&mut report, "valid_from", "2026-08-01T00:00:00Z");
        assert!(report.is_valid());

        Validator::date_in_range(&mut report, "valid_from", "1969-12-31T23:59:59Z");
        Validator::date_in_range(&mut report, "valid_until", "2101-01-01T00:00:00Z");
        Validator::date_in_range(&mut report, "observed_at", "not a date");
        assert_eq!(report.errors.len(), 3);

        // Error names the field and the observed year
        assert!(report.errors[0].1.contains("1969"));
        assert_eq!(report.errors[0].0, "valid_from");
        assert!(report.errors[1].1.contains("2101"));
    }

    #[test]
    fn test_redos_guard_rejects_dangerous_shapes() {
        let dangerous = [
            "(a+)+",
            "(x*)*",
            "(a?)*",
            "a++b",
            "a**",
            "a+*",
            ".*.*",
            ".+.+",
            "(a|a)+",
            "(a|ab)+",
            "(a+|b+)+",
            "x{5000}",
            r"\b.*stuff.*\b",
        ];
        for pattern in dangerous {
            assert!(
                check_pattern_safety(pattern).is_err(),
                "{} should be rejected",
                pattern
            );
        }
    }

    #[test]
    fn test_redos_guard_accepts_safe_patterns() {
        let safe = [
            r"^[a-z0-9-]+$",
            r"^\d{4}-\d{2}-\d{2}$",
            r"(foo|bar)baz",
            r"https?://\S+",
            r"x{1,100}",
        ];
        for pattern in safe {
            assert!(
                compile_guarded(pattern).is_ok(),
                "{} should be accepted",
                pattern
            );
        }
    }

    #[test]
    fn test_rule_ingestion() {
        let rule = ingest_rule("validation:ticket_id", r"^[A-Z]+-\d+$")
            .unwrap()
            .unwrap();
        assert_eq!(rule.field, "ticket_id");
        assert!(rule.pattern.is_match("MEM-123"));
        assert!(!rule.pattern.is_match("not a ticket"));

        // Non-validation guidelines are ignored
        assert!(ingest_rule("style-guide", "anything").unwrap().is_none());
        // Dangerous ingested patterns are rejected
        assert!(ingest_rule("validation:bad", "(a+)+").is_err());
    }
}
