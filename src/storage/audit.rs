//! Structured audit trail.
//!
//! Every mutation records `(actor, action, resource, outcome, timestamp)`,
//! including failed attempts. Audit writes are best-effort: a failure to
//! audit is logged and counted, never surfaced to the caller.

use crate::error::Result;
use crate::storage::adapter::StorageAdapter;
use crate::storage::repository::parse_datetime;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use std::sync::Arc;

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Denied,
    Failed,
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Denied => write!(f, "denied"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One audit row.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub outcome: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Writer/reader over the audit log.
#[derive(Clone)]
pub struct AuditLog {
    adapter: Arc<StorageAdapter>,
}

impl AuditLog {
    pub fn new(adapter: Arc<StorageAdapter>) -> Self {
        Self { adapter }
    }

    /// Record an audit event. Best-effort.
    pub fn record(
        &self,
        actor: &str,
        action: &str,
        resource: &str,
        outcome: AuditOutcome,
        detail: Option<&str>,
    ) {
        let result = self.adapter.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log (actor, action, resource, outcome, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    actor,
                    action,
                    resource,
                    outcome.to_string(),
                    detail,
                    Utc::now().to_rfc3339(),
                ],
            )
        });
        if let Err(err) = result {
            self.adapter.metrics().incr("audit.write_failed");
            tracing::warn!(actor, action, error = %err, "audit write failed");
        }
    }

    /// Recent events for an actor, newest first.
    pub fn recent_for_actor(&self, actor: &str, limit: usize) -> Result<Vec<AuditEvent>> {
        self.adapter.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT actor, action, resource, outcome, detail, created_at
                 FROM audit_log WHERE actor = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![actor, limit as i64], |row| {
                    Ok(AuditEvent {
                        actor: row.get(0)?,
                        action: row.get(1)?,
                        resource: row.get(2)?,
                        outcome: row.get(3)?,
                        detail: row.get(4)?,
                        created_at: parse_datetime(row.get::<_, String>(5)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Count events per outcome since a cutoff, for analytics.
    pub fn outcome_counts_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(String, i64)>> {
        self.adapter.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT outcome, COUNT(*) FROM audit_log
                 WHERE created_at >= ?1 GROUP BY outcome",
            )?;
            let rows = stmt
                .query_map(params![cutoff.to_rfc3339()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_read_back() {
        let log = AuditLog::new(StorageAdapter::in_memory().unwrap());

        log.record("agent-a", "guideline.add", "guideline:g1", AuditOutcome::Success, None);
        log.record(
            "agent-a",
            "guideline.delete",
            "guideline:g1",
            AuditOutcome::Denied,
            Some("no admin permission"),
        );

        let events = log.recent_for_actor("agent-a", 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "guideline.delete");
        assert_eq!(events[0].outcome, "denied");
        assert_eq!(events[1].outcome, "success");
    }

    #[test]
    fn test_outcome_counts() {
        let log = AuditLog::new(StorageAdapter::in_memory().unwrap());
        for _ in 0..3 {
            log.record("a", "x", "r", AuditOutcome::Success, None);
        }
        log.record("a", "x", "r", AuditOutcome::Failed, None);

        let counts = log
            .outcome_counts_since(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        let success = counts.iter().find(|(o, _)| o == "success").unwrap().1;
        assert_eq!(success, 3);
    }
}
