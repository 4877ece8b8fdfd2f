//! Pattern-triggered knowledge extraction from tool output.

use regex::Regex;
use std::sync::LazyLock;

/// A knowledge candidate mined from tool output.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeCandidate {
    pub title: String,
    pub content: String,
    pub confidence: f64,
}

static VERSION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^([a-zA-Z][\w@/.-]{1,60})\s+(?:version\s+)?v?(\d+\.\d+(?:\.\d+)?)\s*$")
        .expect("invalid regex")
});

static LISTENING_ON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:listening|serving|running)\s+(?:on|at)\s+(https?://\S+|[\w.:-]+:\d+)")
        .expect("invalid regex")
});

static CONFIG_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:config|configuration|settings)\s+(?:file\s+)?(?:loaded|found|read)\s+(?:from|at)\s+(\S+)")
        .expect("invalid regex")
});

static RESOLVED_BY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^(?:fixed|resolved|solved)\s+by\s+(.{5,120})$").expect("invalid regex")
});

/// Extract knowledge candidates from tool output.
///
/// Each extractor is triggered by its own pattern; unmatched output yields
/// nothing. Confidence reflects how unambiguous the pattern is.
pub fn extract_knowledge(tool_name: &str, output: &str) -> Vec<KnowledgeCandidate> {
    let mut candidates = Vec::new();

    for captures in VERSION_LINE.captures_iter(output) {
        let subject = captures[1].trim().to_string();
        let version = captures[2].to_string();
        candidates.push(KnowledgeCandidate {
            title: format!("{} version", subject),
            content: format!("{} is at version {}", subject, version),
            confidence: 0.8,
        });
    }

    for captures in LISTENING_ON.captures_iter(output) {
        let endpoint = captures[1].trim_end_matches('.').to_string();
        candidates.push(KnowledgeCandidate {
            title: format!("{} endpoint", tool_name),
            content: format!("Service endpoint observed at {}", endpoint),
            confidence: 0.75,
        });
    }

    for captures in CONFIG_PATH.captures_iter(output) {
        let path = captures[1].trim_end_matches('.').to_string();
        candidates.push(KnowledgeCandidate {
            title: "configuration location".to_string(),
            content: format!("Configuration is read from {}", path),
            confidence: 0.7,
        });
    }

    for captures in RESOLVED_BY.captures_iter(output) {
        let remedy = captures[1].trim().to_string();
        candidates.push(KnowledgeCandidate {
            title: "known remedy".to_string(),
            content: format!("A previous failure was resolved by: {}", remedy),
            confidence: 0.6,
        });
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_extraction() {
        let output = "node v20.11.1\nnpm 10.2.4\nsome other line\n";
        let candidates = extract_knowledge("Bash", output);

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].title, "node version");
        assert!(candidates[0].content.contains("20.11.1"));
        assert!(candidates[0].confidence >= 0.6);
    }

    #[test]
    fn test_endpoint_extraction() {
        let output = "Server listening on http://127.0.0.1:8080";
        let candidates = extract_knowledge("Bash", output);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].content.contains("http://127.0.0.1:8080"));
    }

    #[test]
    fn test_remedy_extraction() {
        let output = "build failed twice\nfixed by clearing the cargo cache\n";
        let candidates = extract_knowledge("Bash", output);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].content.contains("clearing the cargo cache"));
    }

    #[test]
    fn test_unremarkable_output_yields_nothing() {
        let output = "ok\nall 42 tests passed\n";
        assert!(extract_knowledge("Bash", output).is_empty());
    }
}
