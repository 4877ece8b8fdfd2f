//! Agent access control.
//!
//! Permission rows are `(agent_id, scope_type?, scope_id?, entry_type?,
//! entry_id?, permission)` where NULL columns are wildcards. Resolution
//! walks candidate rows in decreasing specificity (exact entry >
//! entry-type within scope > scope only > wildcard); the first matching
//! row decides, and absence denies.

use crate::artifact::EntryType;
use crate::error::Result;
use crate::scope::Scope;
use crate::storage::StorageAdapter;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Permission levels. `Admin` implies `Write` implies `Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Permission {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "admin" => Ok(Self::Admin),
            other => Err(crate::error::Error::validation(
                "permission",
                format!("unknown permission '{}'", other),
            )),
        }
    }
}

/// What a check is about.
#[derive(Debug, Clone)]
pub struct ResourceRef {
    pub scope: Scope,
    pub entry_type: Option<EntryType>,
    pub entry_id: Option<String>,
}

impl ResourceRef {
    pub fn scope(scope: Scope) -> Self {
        Self {
            scope,
            entry_type: None,
            entry_id: None,
        }
    }

    pub fn entry(scope: Scope, entry_type: EntryType, entry_id: impl Into<String>) -> Self {
        Self {
            scope,
            entry_type: Some(entry_type),
            entry_id: Some(entry_id.into()),
        }
    }

    /// Stable key used by batch results.
    pub fn key(&self) -> String {
        match (&self.entry_type, &self.entry_id) {
            (Some(et), Some(id)) => format!("{}:{}", et, id),
            (Some(et), None) => format!("{}:*", et),
            _ => format!("{}", self.scope),
        }
    }
}

#[derive(Debug, Clone)]
struct PermissionRow {
    scope_type: Option<String>,
    scope_id: Option<String>,
    entry_type: Option<String>,
    entry_id: Option<String>,
    permission: Permission,
}

impl PermissionRow {
    /// Higher = more specific. Exact entry beats entry-type beats scope
    /// beats wildcard.
    fn specificity(&self) -> u8 {
        match (
            self.entry_id.is_some(),
            self.entry_type.is_some(),
            self.scope_type.is_some(),
        ) {
            (true, _, _) => 3,
            (false, true, _) => 2,
            (false, false, true) => 1,
            _ => 0,
        }
    }

    fn matches(&self, resource: &ResourceRef) -> bool {
        if let Some(st) = &self.scope_type {
            if *st != resource.scope.scope_type.to_string() {
                return false;
            }
            if let Some(sid) = &self.scope_id {
                if resource.scope.scope_id.as_deref() != Some(sid.as_str()) {
                    return false;
                }
            }
        }
        if let Some(et) = &self.entry_type {
            match resource.entry_type {
                Some(ref resource_et) if *et == resource_et.to_string() => {}
                _ => return false,
            }
        }
        if let Some(eid) = &self.entry_id {
            if resource.entry_id.as_deref() != Some(eid.as_str()) {
                return false;
            }
        }
        true
    }
}

/// The permission service.
pub struct PermissionService {
    adapter: Arc<StorageAdapter>,
}

impl PermissionService {
    pub fn new(adapter: Arc<StorageAdapter>) -> Self {
        Self { adapter }
    }

    /// Grant a permission row.
    pub fn grant(
        &self,
        agent_id: &str,
        scope: Option<&Scope>,
        entry_type: Option<EntryType>,
        entry_id: Option<&str>,
        permission: Permission,
    ) -> Result<()> {
        self.adapter.with_conn(|conn| {
            conn.execute(
                "INSERT INTO permissions (agent_id, scope_type, scope_id, entry_type, entry_id, permission)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    agent_id,
                    scope.map(|s| s.scope_type.to_string()),
                    scope.and_then(|s| s.scope_id.clone()),
                    entry_type.map(|et| et.to_string()),
                    entry_id,
                    permission.to_string(),
                ],
            )
        })?;
        Ok(())
    }

    /// Revoke every row for an agent (admin path).
    pub fn revoke_all(&self, agent_id: &str) -> Result<usize> {
        let deleted = self.adapter.with_conn(|conn| {
            conn.execute(
                "DELETE FROM permissions WHERE agent_id = ?1",
                params![agent_id],
            )
        })?;
        Ok(deleted)
    }

    fn rows_for(&self, agent_id: &str) -> Result<Vec<PermissionRow>> {
        self.adapter.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT scope_type, scope_id, entry_type, entry_id, permission
                 FROM permissions WHERE agent_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![agent_id], |row| {
                    let permission: String = row.get(4)?;
                    Ok(PermissionRow {
                        scope_type: row.get(0)?,
                        scope_id: row.get(1)?,
                        entry_type: row.get(2)?,
                        entry_id: row.get(3)?,
                        permission: permission.parse().unwrap_or(Permission::Read),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Whether `agent_id` may perform `action` on `resource`.
    pub fn check(&self, agent_id: &str, action: Permission, resource: &ResourceRef) -> bool {
        let mut rows = match self.rows_for(agent_id) {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(agent_id, error = %err, "permission lookup failed; denying");
                return false;
            }
        };

        rows.retain(|row| row.matches(resource));
        // First matching row in decreasing specificity decides
        rows.sort_by_key(|row| std::cmp::Reverse(row.specificity()));
        match rows.first() {
            Some(row) => row.permission >= action,
            None => false,
        }
    }

    /// Batch check: one row fetch, per-resource resolution. The map is
    /// keyed by `ResourceRef::key`.
    pub fn check_batch(
        &self,
        agent_id: &str,
        action: Permission,
        resources: &[ResourceRef],
    ) -> HashMap<String, bool> {
        let rows = match self.rows_for(agent_id) {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(agent_id, error = %err, "permission lookup failed; denying batch");
                return resources.iter().map(|r| (r.key(), false)).collect();
            }
        };

        resources
            .iter()
            .map(|resource| {
                let mut matching: Vec<&PermissionRow> =
                    rows.iter().filter(|row| row.matches(resource)).collect();
                matching.sort_by_key(|row| std::cmp::Reverse(row.specificity()));
                let allowed = matching
                    .first()
                    .map(|row| row.permission >= action)
                    .unwrap_or(false);
                (resource.key(), allowed)
            })
            .collect()
    }
}
