//! Usage analytics over the artifact tables and the audit log.

use crate::error::Result;
use crate::storage::StorageAdapter;
use chrono::{Duration, Utc};
use rusqlite::params;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Aggregate usage per artifact kind.
#[derive(Debug, Clone, Serialize)]
pub struct KindUsage {
    pub entry_type: String,
    pub total: i64,
    pub active: i64,
    pub total_accesses: i64,
}

/// One heavily accessed entry.
#[derive(Debug, Clone, Serialize)]
pub struct TopEntry {
    pub entry_type: String,
    pub id: String,
    pub name: String,
    pub access_count: i64,
}

/// Creations per day.
#[derive(Debug, Clone, Serialize)]
pub struct TrendPoint {
    pub day: String,
    pub created: i64,
}

/// Failures of one action within the window.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorCorrelation {
    pub action: String,
    pub failures: i64,
    pub denials: i64,
}

/// A scope whose entries concentrate in very few categories.
#[derive(Debug, Clone, Serialize)]
pub struct LowDiversityScope {
    pub scope_type: String,
    pub scope_id: Option<String>,
    pub distinct_categories: i64,
    pub total_entries: i64,
}

/// Subagent experience outcomes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubtaskStats {
    pub successes: i64,
    pub failures: i64,
}

/// Read-only analytics queries.
pub struct AnalyticsService {
    adapter: Arc<StorageAdapter>,
}

impl AnalyticsService {
    pub fn new(adapter: Arc<StorageAdapter>) -> Self {
        Self { adapter }
    }

    /// Per-kind counts and access totals, plus the most accessed entries.
    pub fn usage_stats(&self, top_k: usize) -> Result<(Vec<KindUsage>, Vec<TopEntry>)> {
        let usage = self.adapter.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT entry_type, COUNT(*), SUM(is_active), SUM(access_count)
                 FROM entries GROUP BY entry_type ORDER BY entry_type",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(KindUsage {
                        entry_type: row.get(0)?,
                        total: row.get(1)?,
                        active: row.get(2)?,
                        total_accesses: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let top = self.adapter.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT entry_type, id, name, access_count FROM entries
                 WHERE access_count > 0
                 ORDER BY access_count DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![top_k as i64], |row| {
                    Ok(TopEntry {
                        entry_type: row.get(0)?,
                        id: row.get(1)?,
                        name: row.get(2)?,
                        access_count: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        Ok((usage, top))
    }

    /// Entries created per day over the trailing window.
    pub fn creation_trend(&self, days: i64) -> Result<Vec<TrendPoint>> {
        let cutoff = Utc::now() - Duration::days(days);
        self.adapter.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT substr(created_at, 1, 10) AS day, COUNT(*)
                 FROM entries WHERE created_at >= ?1
                 GROUP BY day ORDER BY day",
            )?;
            let rows = stmt
                .query_map(params![cutoff.to_rfc3339()], |row| {
                    Ok(TrendPoint {
                        day: row.get(0)?,
                        created: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Which audited actions fail or get denied most, over the window.
    pub fn error_correlation(&self, days: i64) -> Result<Vec<ErrorCorrelation>> {
        let cutoff = Utc::now() - Duration::days(days);
        self.adapter.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT action,
                        SUM(CASE WHEN outcome = 'failed' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN outcome = 'denied' THEN 1 ELSE 0 END)
                 FROM audit_log WHERE created_at >= ?1
                 GROUP BY action
                 HAVING SUM(CASE WHEN outcome != 'success' THEN 1 ELSE 0 END) > 0
                 ORDER BY 2 DESC, 3 DESC",
            )?;
            let rows = stmt
                .query_map(params![cutoff.to_rfc3339()], |row| {
                    Ok(ErrorCorrelation {
                        action: row.get(0)?,
                        failures: row.get(1)?,
                        denials: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Scopes holding several entries but almost no category spread.
    pub fn low_diversity(&self, min_entries: i64) -> Result<Vec<LowDiversityScope>> {
        self.adapter.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT e.scope_type, e.scope_id,
                        COUNT(DISTINCT json_extract(v.payload, '$.category')),
                        COUNT(*)
                 FROM entries e
                 JOIN entry_versions v ON v.version_id = e.current_version_id
                 GROUP BY e.scope_type, e.scope_id
                 HAVING COUNT(*) >= ?1
                    AND COUNT(DISTINCT json_extract(v.payload, '$.category')) <= 1",
            )?;
            let rows = stmt
                .query_map(params![min_entries], |row| {
                    Ok(LowDiversityScope {
                        scope_type: row.get(0)?,
                        scope_id: row.get(1)?,
                        distinct_categories: row.get(2)?,
                        total_entries: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Success/failure counts of recorded subagent experiences.
    pub fn subtask_stats(&self) -> Result<HashMap<String, SubtaskStats>> {
        let rows: Vec<(String, i64)> = self.adapter.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT json_extract(v.payload, '$.category'), COUNT(*)
                 FROM entries e
                 JOIN entry_versions v ON v.version_id = e.current_version_id
                 WHERE e.entry_type = 'experience'
                   AND json_extract(v.payload, '$.category') IN
                       ('subagent-success', 'subagent-failure')
                 GROUP BY 1",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut stats: HashMap<String, SubtaskStats> = HashMap::new();
        let entry = stats.entry("subagent".to_string()).or_default();
        for (category, count) in rows {
            match category.as_str() {
                "subagent-success" => entry.successes += count,
                "subagent-failure" => entry.failures += count,
                _ => {}
            }
        }
        Ok(stats)
    }
}
