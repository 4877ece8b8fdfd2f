//! Near-duplicate detection over the FTS index.
//!
//! Candidate entries come from an FTS match on the name/title; scores are
//! FTS rank magnitudes normalized by the best candidate, so the best match
//! scores 1.0 and the rest fall off toward 0.

use crate::artifact::EntryType;
use crate::error::Result;
use crate::scope::ScopeType;
use crate::storage::StorageAdapter;
use serde::Serialize;
use std::sync::Arc;

/// Score at or above which a candidate is a duplicate.
pub const DUPLICATE_THRESHOLD: f64 = 0.9;

/// Score at or above which a candidate is merely similar.
pub const SIMILAR_THRESHOLD: f64 = 0.7;

/// Thresholds, adjustable per backend.
#[derive(Debug, Clone)]
pub struct DuplicateConfig {
    pub duplicate_threshold: f64,
    pub similar_threshold: f64,
    pub max_candidates: usize,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            duplicate_threshold: DUPLICATE_THRESHOLD,
            similar_threshold: SIMILAR_THRESHOLD,
            max_candidates: 10,
        }
    }
}

/// One scored candidate.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarEntry {
    pub entry_id: String,
    pub name: String,
    /// Normalized similarity in [0, 1]
    pub score: f64,
}

/// Result of a duplicate check.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    /// Ordered best-first
    pub similar_entries: Vec<SimilarEntry>,
}

/// FTS-backed duplicate service.
pub struct DuplicateService {
    adapter: Arc<StorageAdapter>,
    config: DuplicateConfig,
}

impl DuplicateService {
    pub fn new(adapter: Arc<StorageAdapter>) -> Self {
        Self {
            adapter,
            config: DuplicateConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DuplicateConfig) -> Self {
        self.config = config;
        self
    }

    /// Check a prospective name/title against existing entries of the
    /// same kind in the same scope.
    pub fn check(
        &self,
        entry_type: EntryType,
        name: &str,
        scope_type: ScopeType,
        scope_id: Option<&str>,
    ) -> Result<DuplicateCheck> {
        let query = fts_query(name);
        if query.is_empty() {
            return Ok(DuplicateCheck {
                is_duplicate: false,
                similar_entries: Vec::new(),
            });
        }

        // FTS5 rank is negative; closer to zero means a worse match, so
        // larger magnitude = better candidate
        let candidates: Vec<(String, String, f64)> = self.adapter.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT e.id, e.name, -rank AS score
                 FROM entries_fts fts
                 JOIN entries e ON e.rowid = fts.rowid
                 WHERE entries_fts MATCH ?1
                   AND e.entry_type = ?2
                   AND e.scope_type = ?3 AND e.scope_id IS ?4
                   AND e.is_active = 1
                 ORDER BY rank
                 LIMIT ?5",
            )?;
            let rows = stmt
                .query_map(
                    rusqlite::params![
                        query,
                        entry_type.to_string(),
                        scope_type.to_string(),
                        scope_id,
                        self.config.max_candidates as i64,
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, f64>(2)?)),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let best = candidates
            .first()
            .map(|(_, _, score)| *score)
            .filter(|s| *s > 0.0);

        let similar_entries: Vec<SimilarEntry> = match best {
            None => Vec::new(),
            Some(best) => candidates
                .into_iter()
                .map(|(entry_id, candidate_name, score)| {
                    // An exact (case-insensitive) name collision is a
                    // duplicate regardless of how FTS ranks it
                    let normalized = if candidate_name.eq_ignore_ascii_case(name) {
                        1.0
                    } else {
                        (score / best).clamp(0.0, 1.0)
                    };
                    SimilarEntry {
                        entry_id,
                        name: candidate_name,
                        score: normalized,
                    }
                })
                .filter(|entry| entry.score >= self.config.similar_threshold)
                .collect(),
        };

        let mut similar_entries = similar_entries;
        similar_entries.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let is_duplicate = similar_entries
            .iter()
            .any(|entry| entry.score >= self.config.duplicate_threshold);

        Ok(DuplicateCheck {
            is_duplicate,
            similar_entries,
        })
    }
}

/// Build an OR query over quoted terms so partial-name overlaps match.
fn fts_query(name: &str) -> String {
    let cleaned = name.replace('"', " ");
    cleaned
        .split_whitespace()
        .map(|term| format!("\"{}\"", term))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn seeded() -> DuplicateService {
        let adapter = StorageAdapter::in_memory().unwrap();
        for (id, name) in [
            ("t1", "npm build tool"),
            ("t2", "npm deploy tool"),
            ("t3", "database migration runner"),
        ] {
            adapter
                .with_conn(|conn| {
                    conn.execute(
                        "INSERT INTO entries (id, entry_type, scope_type, scope_id, name, content, current_version_id)
                         VALUES (?1, 'tool', 'project', 'p1', ?2, 'description', ?1 || ':v1')",
                        params![id, name],
                    )
                })
                .unwrap();
        }
        DuplicateService::new(adapter)
    }

    #[test]
    fn test_exact_name_is_duplicate() {
        let service = seeded();
        let check = service
            .check(EntryType::Tool, "npm build tool", ScopeType::Project, Some("p1"))
            .unwrap();

        assert!(check.is_duplicate);
        assert!(!check.similar_entries.is_empty());
        assert_eq!(check.similar_entries[0].name, "npm build tool");
        assert!((check.similar_entries[0].score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unrelated_name_is_not_duplicate() {
        let service = seeded();
        let check = service
            .check(
                EntryType::Tool,
                "kubernetes log tailer",
                ScopeType::Project,
                Some("p1"),
            )
            .unwrap();
        assert!(!check.is_duplicate);
    }

    #[test]
    fn test_scope_isolation() {
        let service = seeded();
        // Same name, different project: no candidates
        let check = service
            .check(EntryType::Tool, "npm build tool", ScopeType::Project, Some("p2"))
            .unwrap();
        assert!(!check.is_duplicate);
        assert!(check.similar_entries.is_empty());
    }

    #[test]
    fn test_kind_isolation() {
        let service = seeded();
        let check = service
            .check(
                EntryType::Guideline,
                "npm build tool",
                ScopeType::Project,
                Some("p1"),
            )
            .unwrap();
        assert!(!check.is_duplicate);
    }

    #[test]
    fn test_results_ordered_best_first() {
        let service = seeded();
        let check = service
            .check(EntryType::Tool, "npm tool", ScopeType::Project, Some("p1"))
            .unwrap();

        for pair in check.similar_entries.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }
}
