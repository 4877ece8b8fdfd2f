//! Scope-entity repository: orgs, projects, and sessions.
//!
//! Projects are looked up by root path during context detection; sessions
//! carry a JSON metadata column used by the observe-commit bookkeeping.

use crate::error::{Error, Result};
use crate::storage::adapter::StorageAdapter;
use crate::storage::repository::parse_datetime;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// An organization row.
#[derive(Debug, Clone)]
pub struct Org {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A project row.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub org_id: Option<String>,
    pub name: String,
    pub root_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A session row.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub project_id: Option<String>,
    pub agent_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

/// Repository over the scope tables.
pub struct ScopeRepository {
    adapter: Arc<StorageAdapter>,
}

impl ScopeRepository {
    pub fn new(adapter: Arc<StorageAdapter>) -> Self {
        Self { adapter }
    }

    // ==================== Orgs ====================

    pub fn create_org(&self, name: &str) -> Result<Org> {
        let org = Org {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.adapter.with_conn(|conn| {
            conn.execute(
                "INSERT INTO orgs (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![org.id, org.name, org.created_at.to_rfc3339()],
            )
        })?;
        Ok(org)
    }

    pub fn get_org(&self, id: &str) -> Result<Option<Org>> {
        self.adapter.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, created_at FROM orgs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Org {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: parse_datetime(row.get::<_, String>(2)?),
                    })
                },
            )
            .optional()
        })
    }

    // ==================== Projects ====================

    pub fn create_project(
        &self,
        name: &str,
        org_id: Option<&str>,
        root_path: Option<&str>,
    ) -> Result<Project> {
        let project = Project {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.map(str::to_string),
            name: name.to_string(),
            root_path: root_path.map(str::to_string),
            created_at: Utc::now(),
        };
        self.adapter.with_conn(|conn| {
            conn.execute(
                "INSERT INTO projects (id, org_id, name, root_path, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    project.id,
                    project.org_id,
                    project.name,
                    project.root_path,
                    project.created_at.to_rfc3339(),
                ],
            )
        })?;
        Ok(project)
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.adapter.with_conn(|conn| {
            conn.query_row(
                "SELECT id, org_id, name, root_path, created_at FROM projects WHERE id = ?1",
                params![id],
                |row| row_to_project(row),
            )
            .optional()
        })
    }

    /// Find the project whose root path is the longest prefix of `path`.
    pub fn find_project_by_path(&self, path: &str) -> Result<Option<Project>> {
        let mut projects: Vec<Project> = self.adapter.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, org_id, name, root_path, created_at
                 FROM projects WHERE root_path IS NOT NULL",
            )?;
            let rows = stmt
                .query_map([], |row| row_to_project(row))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        projects.retain(|p| {
            p.root_path
                .as_deref()
                .map(|root| path == root || path.starts_with(&format!("{}/", root)))
                .unwrap_or(false)
        });
        projects.sort_by_key(|p| std::cmp::Reverse(p.root_path.as_deref().unwrap_or("").len()));
        Ok(projects.into_iter().next())
    }

    // ==================== Sessions ====================

    pub fn start_session(&self, project_id: Option<&str>, agent_id: &str) -> Result<Session> {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.map(str::to_string),
            agent_id: agent_id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            metadata: None,
        };
        self.adapter.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, project_id, agent_id, started_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    session.id,
                    session.project_id,
                    session.agent_id,
                    session.started_at.to_rfc3339(),
                ],
            )
        })?;
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.adapter.with_conn(|conn| {
            conn.query_row(
                "SELECT id, project_id, agent_id, started_at, ended_at, metadata
                 FROM sessions WHERE id = ?1",
                params![id],
                |row| row_to_session(row),
            )
            .optional()
        })
    }

    /// The most recently started session for a project that has not ended.
    pub fn active_session_for_project(&self, project_id: &str) -> Result<Option<Session>> {
        self.adapter.with_conn(|conn| {
            conn.query_row(
                "SELECT id, project_id, agent_id, started_at, ended_at, metadata
                 FROM sessions
                 WHERE project_id = ?1 AND ended_at IS NULL
                 ORDER BY started_at DESC LIMIT 1",
                params![project_id],
                |row| row_to_session(row),
            )
            .optional()
        })
    }

    pub fn end_session(&self, id: &str) -> Result<()> {
        let changed = self.adapter.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET ended_at = ?2 WHERE id = ?1 AND ended_at IS NULL",
                params![id, Utc::now().to_rfc3339()],
            )
        })?;
        if changed == 0 {
            return Err(Error::not_found("session", id));
        }
        Ok(())
    }

    /// Merge keys into the session's JSON metadata.
    pub fn merge_session_metadata(&self, id: &str, patch: &Value) -> Result<()> {
        let session = self
            .get_session(id)?
            .ok_or_else(|| Error::not_found("session", id))?;

        let mut metadata = session.metadata.unwrap_or_else(|| Value::Object(Default::default()));
        if let (Some(target), Some(source)) = (metadata.as_object_mut(), patch.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }

        self.adapter.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET metadata = ?2 WHERE id = ?1",
                params![id, serde_json::to_string(&metadata).unwrap_or_default()],
            )
        })?;
        Ok(())
    }
}

fn row_to_project(row: &rusqlite::Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        org_id: row.get(1)?,
        name: row.get(2)?,
        root_path: row.get(3)?,
        created_at: parse_datetime(row.get::<_, String>(4)?),
    })
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        project_id: row.get(1)?,
        agent_id: row.get(2)?,
        started_at: parse_datetime(row.get::<_, String>(3)?),
        ended_at: row.get::<_, Option<String>>(4)?.map(parse_datetime),
        metadata: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| serde_json::from_str(&s).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repo() -> ScopeRepository {
        ScopeRepository::new(StorageAdapter::in_memory().unwrap())
    }

    #[test]
    fn test_project_path_lookup_longest_prefix() {
        let repo = repo();
        repo.create_project("mono", None, Some("/home/dev/mono")).unwrap();
        let nested = repo
            .create_project("svc", None, Some("/home/dev/mono/services/api"))
            .unwrap();

        let found = repo
            .find_project_by_path("/home/dev/mono/services/api/src")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, nested.id);

        // Sibling path does not match the nested project
        let found = repo
            .find_project_by_path("/home/dev/mono/docs")
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "mono");

        assert!(repo.find_project_by_path("/tmp/elsewhere").unwrap().is_none());
    }

    #[test]
    fn test_active_session_lifecycle() {
        let repo = repo();
        let project = repo.create_project("p", None, None).unwrap();

        let s1 = repo.start_session(Some(&project.id), "agent-a").unwrap();
        let active = repo.active_session_for_project(&project.id).unwrap().unwrap();
        assert_eq!(active.id, s1.id);

        repo.end_session(&s1.id).unwrap();
        assert!(repo
            .active_session_for_project(&project.id)
            .unwrap()
            .is_none());
        assert!(matches!(
            repo.end_session(&s1.id),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_session_metadata_merge() {
        let repo = repo();
        let session = repo.start_session(None, "agent-a").unwrap();

        repo.merge_session_metadata(&session.id, &json!({"observe": {"committedAt": "2026-08-01T00:00:00Z"}}))
            .unwrap();
        repo.merge_session_metadata(&session.id, &json!({"needsReviewCount": 2}))
            .unwrap();

        let loaded = repo.get_session(&session.id).unwrap().unwrap();
        let metadata = loaded.metadata.unwrap();
        assert!(metadata["observe"]["committedAt"].is_string());
        assert_eq!(metadata["needsReviewCount"], 2);
    }
}
