//! The fixed, ordered classification rule set.
//!
//! Each rule carries a stable `pattern_id`, a target artifact kind, and a
//! base weight in [0.5, 0.95]. Rules are evaluated in order; ties between
//! equal effective scores break in rule order. Matching is case-insensitive
//! and inspects at most the first 4 KiB of input.

use crate::artifact::EntryType;
use regex::Regex;
use std::sync::LazyLock;

/// Maximum input length considered by pattern matching.
pub const MATCH_WINDOW_BYTES: usize = 4 * 1024;

/// One classification rule.
pub struct Rule {
    /// Stable id used by the pattern-confidence store
    pub pattern_id: &'static str,
    pub target: EntryType,
    /// Base weight in [0.5, 0.95] before the feedback multiplier
    pub base_weight: f64,
    pub pattern: &'static LazyLock<Regex>,
}

macro_rules! rule_pattern {
    ($name:ident, $re:literal) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($re).expect("invalid rule regex"));
    };
}

rule_pattern!(
    GUIDELINE_PREFIX,
    r"(?i)^\s*(rule|guideline|policy|convention)\s*:"
);
rule_pattern!(
    GUIDELINE_IMPERATIVE,
    r"(?i)^\s*(always|never|do not|don't|avoid|prefer|ensure|make sure)\b"
);
rule_pattern!(
    GUIDELINE_MODAL,
    r"(?i)\b(should|must|shall|ought to)\b.*\b(use|avoid|follow|keep|write|run|check)\b"
);
rule_pattern!(
    KNOWLEDGE_DECISION,
    r"(?i)\b(we|team)\s+(decided|chose|agreed|settled)\b|^\s*decision\s*:"
);
rule_pattern!(
    KNOWLEDGE_PREFIX,
    r"(?i)^\s*(note|fyi|fact|learned|til|observation)\s*[:\-]"
);
rule_pattern!(
    KNOWLEDGE_STATEMENT,
    r"(?i)^\s*(the|our|this)\b.+\b(is|are|was|were|uses|used|supports|requires|contains)\b"
);
rule_pattern!(
    TOOL_BACKTICK,
    r"`[^`]+`"
);
rule_pattern!(
    TOOL_COMMAND,
    r"(?i)^\s*(npm|npx|pnpm|yarn|cargo|git|make|docker|kubectl|python3?|pip|go|rustc|bash|sh)\s+\S"
);
rule_pattern!(
    TOOL_FLAGS,
    r"(?:^|\s)--?[a-z][a-z0-9-]*(?:=\S+)?"
);
rule_pattern!(
    TOOL_DESCRIPTION,
    r"(?i)\b(command|script|cli|tool)\b.*\b(runs?|builds?|executes?|deploys?|generates?|installs?)\b"
);
rule_pattern!(
    KNOWLEDGE_CAUSAL,
    r"(?i)\b(because|therefore|turns out|it turned out|root cause)\b"
);
rule_pattern!(
    GUIDELINE_WHEN,
    r"(?i)^\s*when\b.+,\s*(always|never|use|prefer|avoid|do)\b"
);

/// The rule set, in evaluation order. Earlier rules win score ties.
pub static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        Rule {
            pattern_id: "guideline-prefix",
            target: EntryType::Guideline,
            base_weight: 0.95,
            pattern: &GUIDELINE_PREFIX,
        },
        Rule {
            pattern_id: "knowledge-decision",
            target: EntryType::Knowledge,
            base_weight: 0.9,
            pattern: &KNOWLEDGE_DECISION,
        },
        Rule {
            pattern_id: "tool-command",
            target: EntryType::Tool,
            base_weight: 0.9,
            pattern: &TOOL_COMMAND,
        },
        Rule {
            pattern_id: "guideline-imperative",
            target: EntryType::Guideline,
            base_weight: 0.85,
            pattern: &GUIDELINE_IMPERATIVE,
        },
        Rule {
            pattern_id: "knowledge-prefix",
            target: EntryType::Knowledge,
            base_weight: 0.85,
            pattern: &KNOWLEDGE_PREFIX,
        },
        Rule {
            pattern_id: "guideline-when-then",
            target: EntryType::Guideline,
            base_weight: 0.8,
            pattern: &GUIDELINE_WHEN,
        },
        Rule {
            pattern_id: "tool-description",
            target: EntryType::Tool,
            base_weight: 0.75,
            pattern: &TOOL_DESCRIPTION,
        },
        Rule {
            pattern_id: "tool-backtick",
            target: EntryType::Tool,
            base_weight: 0.7,
            pattern: &TOOL_BACKTICK,
        },
        Rule {
            pattern_id: "guideline-modal",
            target: EntryType::Guideline,
            base_weight: 0.7,
            pattern: &GUIDELINE_MODAL,
        },
        Rule {
            pattern_id: "knowledge-causal",
            target: EntryType::Knowledge,
            base_weight: 0.65,
            pattern: &KNOWLEDGE_CAUSAL,
        },
        Rule {
            pattern_id: "knowledge-statement",
            target: EntryType::Knowledge,
            base_weight: 0.6,
            pattern: &KNOWLEDGE_STATEMENT,
        },
        Rule {
            pattern_id: "tool-flags",
            target: EntryType::Tool,
            base_weight: 0.55,
            pattern: &TOOL_FLAGS,
        },
    ]
});

/// Ids of every rule whose pattern matches `text` (already truncated and
/// lowercased by the caller).
pub fn matching_rules(text: &str) -> Vec<&'static Rule> {
    RULES
        .iter()
        .filter(|rule| rule.pattern.is_match(text))
        .collect()
}

/// Truncate to the match window on a char boundary.
pub fn match_window(text: &str) -> &str {
    if text.len() <= MATCH_WINDOW_BYTES {
        return text;
    }
    let mut end = MATCH_WINDOW_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_in_range() {
        for rule in RULES.iter() {
            assert!(
                (0.5..=0.95).contains(&rule.base_weight),
                "{} out of range",
                rule.pattern_id
            );
        }
    }

    #[test]
    fn test_pattern_ids_unique() {
        let mut ids: Vec<_> = RULES.iter().map(|r| r.pattern_id).collect();
        ids.sort();
        let before = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }

    #[test]
    fn test_representative_matches() {
        assert!(GUIDELINE_PREFIX.is_match("rule: always use strict mode"));
        assert!(KNOWLEDGE_DECISION.is_match("we decided to use react"));
        assert!(TOOL_COMMAND.is_match("npm run build"));
        assert!(!TOOL_COMMAND.is_match("the npm registry is slow"));
    }

    #[test]
    fn test_match_window_respects_boundaries() {
        let text = "é".repeat(3000);
        let window = match_window(&text);
        assert!(window.len() <= MATCH_WINDOW_BYTES);
        assert!(text.starts_with(window));
    }
}
