//! Shared machinery for the per-kind artifact repositories.
//!
//! Every repository is a thin typed wrapper over [`EntryCore`], which owns
//! the envelope/version plumbing: create, append-version updates with an
//! atomic head swap, scope-inherited name lookup, filtered FTS listing with
//! signed cursors, history, activation flips, and deletion.

use crate::artifact::{EntryType, Envelope, VersionRecord};
use crate::cursor::{CursorCodec, CursorPayload};
use crate::error::{Error, Result};
use crate::scope::{Scope, ScopeType};
use crate::storage::adapter::StorageAdapter;
use crate::storage::events::{InvalidationAction, InvalidationEvent};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Hard cap on page sizes across every list endpoint.
pub const MAX_PAGE_SIZE: u64 = 100;

/// Default cursor TTL for list continuations.
const LIST_CURSOR_TTL_MS: u64 = 600_000;

/// Filter accepted by `list`.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub scope_type: Option<ScopeType>,
    pub scope_id: Option<String>,
    /// Payload `category` field
    pub category: Option<String>,
    /// Payload `level` field (experiences)
    pub level: Option<String>,
    pub tag: Option<String>,
    /// FTS match over name and head content
    pub text_query: Option<String>,
    pub include_inactive: bool,
}

/// One page of list results.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            has_more: self.has_more,
            next_cursor: self.next_cursor,
        }
    }
}

/// An envelope together with its name and head payload.
#[derive(Debug, Clone)]
pub struct EntryRecord {
    pub envelope: Envelope,
    /// Guideline/tool name or knowledge/experience title
    pub name: String,
    pub payload: Value,
}

/// How reads report access for out-of-band tracking.
#[derive(Clone)]
pub enum AccessTracker {
    /// Update counters immediately, swallowing failures
    Inline(Arc<StorageAdapter>),
    /// Queue updates to a background task
    Queued(mpsc::UnboundedSender<(EntryType, String)>),
    /// No tracking (history/audit reads)
    Disabled,
}

impl AccessTracker {
    /// Spawn the queued tracker's background task.
    pub fn spawn(adapter: Arc<StorageAdapter>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(EntryType, String)>();
        tokio::spawn(async move {
            while let Some((entry_type, entry_id)) = rx.recv().await {
                apply_access(&adapter, entry_type, &entry_id);
            }
        });
        Self::Queued(tx)
    }

    /// Record one read. Never blocks the read path; failures are logged
    /// and counted, not surfaced.
    pub fn record(&self, entry_type: EntryType, entry_id: &str) {
        match self {
            Self::Inline(adapter) => apply_access(adapter, entry_type, entry_id),
            Self::Queued(tx) => {
                let _ = tx.send((entry_type, entry_id.to_string()));
            }
            Self::Disabled => {}
        }
    }
}

fn apply_access(adapter: &StorageAdapter, entry_type: EntryType, entry_id: &str) {
    let result = adapter.with_conn(|conn| {
        conn.execute(
            "UPDATE entries
             SET access_count = access_count + 1, last_accessed_at = ?3
             WHERE entry_type = ?1 AND id = ?2",
            params![entry_type.to_string(), entry_id, Utc::now().to_rfc3339()],
        )
    });
    if let Err(err) = result {
        adapter.metrics().incr("storage.access_track_failed");
        tracing::debug!(entry_id, error = %err, "access tracking failed");
    }
}

/// Envelope/version plumbing shared by every artifact kind.
pub struct EntryCore {
    adapter: Arc<StorageAdapter>,
    entry_type: EntryType,
    cursors: CursorCodec,
    tracker: AccessTracker,
}

impl EntryCore {
    pub fn new(adapter: Arc<StorageAdapter>, entry_type: EntryType, cursors: CursorCodec) -> Self {
        let tracker = AccessTracker::Inline(Arc::clone(&adapter));
        Self {
            adapter,
            entry_type,
            cursors,
            tracker,
        }
    }

    /// Replace the access tracker (service wiring uses the queued one).
    pub fn with_tracker(mut self, tracker: AccessTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn adapter(&self) -> &Arc<StorageAdapter> {
        &self.adapter
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    fn kind(&self) -> String {
        self.entry_type.to_string()
    }

    /// Insert a new entry with its v1 version. Emits a `create` event
    /// after commit.
    pub fn create(
        &self,
        scope: &Scope,
        name: &str,
        content: &str,
        payload: &Value,
    ) -> Result<Envelope> {
        self.insert(Envelope::new(self.entry_type, scope.clone()), name, content, payload)
    }

    /// Insert preserving a caller-supplied id (sentinel-driven imports).
    pub fn create_with_id(
        &self,
        id: &str,
        scope: &Scope,
        name: &str,
        content: &str,
        payload: &Value,
    ) -> Result<Envelope> {
        let mut envelope = Envelope::new(self.entry_type, scope.clone());
        envelope.id = id.to_string();
        envelope.current_version_id = format!("{}:v1", id);
        self.insert(envelope, name, content, payload)
    }

    fn insert(
        &self,
        envelope: Envelope,
        name: &str,
        content: &str,
        payload: &Value,
    ) -> Result<Envelope> {
        let scope = envelope.scope.clone();
        let payload_text = serde_json::to_string(payload)?;

        self.adapter.transaction(|conn| {
            conn.execute(
                "INSERT INTO entries (
                    id, entry_type, scope_type, scope_id, name, content,
                    current_version_id, version_num, is_active, access_count,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, 1, 0, ?8, ?8)",
                params![
                    envelope.id,
                    self.kind(),
                    scope.scope_type.to_string(),
                    scope.scope_id,
                    name,
                    content,
                    envelope.current_version_id,
                    envelope.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;

            conn.execute(
                "INSERT INTO entry_versions (version_id, entry_type, entry_id, version_num, payload, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5)",
                params![
                    envelope.current_version_id,
                    self.kind(),
                    envelope.id,
                    payload_text,
                    envelope.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;

            Ok(())
        })?;

        self.publish(&envelope.id, &scope, InvalidationAction::Create);
        Ok(envelope)
    }

    /// Append a new version and swap the head atomically. Emits an
    /// `update` event after commit.
    pub fn update(&self, id: &str, name: &str, content: &str, payload: &Value) -> Result<Envelope> {
        let payload_text = serde_json::to_string(payload)?;
        let now = Utc::now();

        let envelope = self.adapter.transaction(|conn| {
            let mut envelope = self
                .load_envelope(conn, id)?
                .ok_or_else(|| Error::not_found(self.kind(), id))?;

            let next_num = envelope.version_num + 1;
            let version_id = format!("{}:v{}", id, next_num);

            conn.execute(
                "INSERT INTO entry_versions (version_id, entry_type, entry_id, version_num, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    version_id,
                    self.kind(),
                    id,
                    next_num,
                    payload_text,
                    now.to_rfc3339(),
                ],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;

            conn.execute(
                "UPDATE entries
                 SET name = ?3, content = ?4, current_version_id = ?5,
                     version_num = ?6, updated_at = ?7
                 WHERE entry_type = ?1 AND id = ?2",
                params![
                    self.kind(),
                    id,
                    name,
                    content,
                    version_id,
                    next_num,
                    now.to_rfc3339(),
                ],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;

            envelope.current_version_id = version_id;
            envelope.version_num = next_num;
            envelope.updated_at = now;
            Ok(envelope)
        })?;

        self.publish(id, &envelope.scope, InvalidationAction::Update);
        Ok(envelope)
    }

    /// Fetch an entry with its head payload.
    pub fn get_by_id(&self, id: &str) -> Result<Option<EntryRecord>> {
        let record = self.adapter.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {}, e.name, v.payload FROM entries e
                     JOIN entry_versions v ON v.version_id = e.current_version_id
                     WHERE e.entry_type = ?1 AND e.id = ?2",
                    ENVELOPE_COLUMNS
                ),
                params![self.kind(), id],
                |row| row_to_record(row),
            )
            .optional()
        })?;

        if record.is_some() {
            self.tracker.record(self.entry_type, id);
        }
        Ok(record)
    }

    /// Look up by name (or title). With `inherit`, walk the scope chain
    /// upward and return the most specific match; without it, require an
    /// exact scope match.
    pub fn get_by_name(
        &self,
        name: &str,
        scope_type: ScopeType,
        scope_id: Option<&str>,
        inherit: bool,
        scope_ids: &dyn Fn(ScopeType) -> Option<String>,
    ) -> Result<Option<EntryRecord>> {
        let chain: Vec<(ScopeType, Option<String>)> = if inherit {
            scope_type
                .chain()
                .into_iter()
                .map(|st| {
                    if st == scope_type {
                        (st, scope_id.map(|s| s.to_string()))
                    } else {
                        (st, scope_ids(st))
                    }
                })
                .filter(|(st, id)| !st.requires_id() || id.is_some())
                .collect()
        } else {
            vec![(scope_type, scope_id.map(|s| s.to_string()))]
        };

        for (st, sid) in chain {
            let record = self.adapter.with_conn(|conn| {
                conn.query_row(
                    &format!(
                        "SELECT {}, e.name, v.payload FROM entries e
                         JOIN entry_versions v ON v.version_id = e.current_version_id
                         WHERE e.entry_type = ?1 AND e.name = ?2 AND e.is_active = 1
                           AND e.scope_type = ?3 AND e.scope_id IS ?4",
                        ENVELOPE_COLUMNS
                    ),
                    params![self.kind(), name, st.to_string(), sid],
                    |row| row_to_record(row),
                )
                .optional()
            })?;

            if let Some(record) = record {
                self.tracker.record(self.entry_type, &record.envelope.id);
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Filtered, cursor-paginated listing.
    pub fn list(
        &self,
        filter: &EntryFilter,
        limit: u64,
        cursor: Option<&str>,
    ) -> Result<Page<EntryRecord>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let offset = match cursor {
            Some(c) => self.cursors.decode(c)?.offset.unwrap_or(0),
            None => 0,
        };

        let mut sql = format!(
            "SELECT {}, e.name, v.payload FROM entries e
             JOIN entry_versions v ON v.version_id = e.current_version_id",
            ENVELOPE_COLUMNS
        );
        let mut clauses: Vec<String> = vec!["e.entry_type = ?".to_string()];
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(self.kind())];

        let fts_query = filter.text_query.as_deref().map(fts_escape);
        if let Some(query) = fts_query.filter(|q| !q.is_empty()) {
            sql.push_str(" JOIN entries_fts fts ON fts.rowid = e.rowid");
            clauses.push("entries_fts MATCH ?".to_string());
            args.push(Box::new(query));
        }
        if let Some(st) = filter.scope_type {
            clauses.push("e.scope_type = ?".to_string());
            args.push(Box::new(st.to_string()));
            if st.requires_id() {
                clauses.push("e.scope_id = ?".to_string());
                args.push(Box::new(filter.scope_id.clone().unwrap_or_default()));
            }
        }
        if let Some(category) = &filter.category {
            clauses.push("json_extract(v.payload, '$.category') = ?".to_string());
            args.push(Box::new(category.clone()));
        }
        if let Some(level) = &filter.level {
            clauses.push("json_extract(v.payload, '$.level') = ?".to_string());
            args.push(Box::new(level.clone()));
        }
        if let Some(tag) = &filter.tag {
            clauses.push(
                "EXISTS (SELECT 1 FROM entry_tags t
                         WHERE t.entry_type = e.entry_type
                           AND t.entry_id = e.id AND t.tag_name = ?)"
                    .to_string(),
            );
            args.push(Box::new(tag.clone()));
        }
        if !filter.include_inactive {
            clauses.push("e.is_active = 1".to_string());
        }

        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
        sql.push_str(" ORDER BY e.updated_at DESC, e.id");
        // Over-fetch one row to learn whether more pages exist
        sql.push_str(&format!(" LIMIT {} OFFSET {}", limit + 1, offset));

        let mut items: Vec<EntryRecord> = self.adapter.with_conn(|conn| {
            let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(arg_refs.as_slice(), |row| row_to_record(row))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let has_more = items.len() as u64 > limit;
        items.truncate(limit as usize);

        for item in &items {
            self.tracker.record(self.entry_type, &item.envelope.id);
        }

        let next_cursor = if has_more {
            Some(self.cursors.encode(
                CursorPayload::at_offset(offset + limit, limit),
                LIST_CURSOR_TTL_MS,
            )?)
        } else {
            None
        };

        Ok(Page {
            items,
            has_more,
            next_cursor,
        })
    }

    /// Every version of an entry, newest first.
    pub fn get_history(&self, id: &str) -> Result<Vec<VersionRecord>> {
        self.adapter.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT version_id, entry_id, version_num, payload, created_at
                 FROM entry_versions
                 WHERE entry_type = ?1 AND entry_id = ?2
                 ORDER BY version_num DESC",
            )?;
            let rows = stmt
                .query_map(params![self.kind(), id], |row| {
                    Ok(VersionRecord {
                        version_id: row.get(0)?,
                        entry_id: row.get(1)?,
                        version_num: row.get(2)?,
                        payload: serde_json::from_str(&row.get::<_, String>(3)?)
                            .unwrap_or(Value::Null),
                        created_at: parse_datetime(row.get::<_, String>(4)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Flip the active flag. History is preserved either way.
    pub fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let scope = self.require_scope(id)?;
        let changed = self.adapter.with_conn(|conn| {
            conn.execute(
                "UPDATE entries SET is_active = ?3, updated_at = ?4
                 WHERE entry_type = ?1 AND id = ?2",
                params![
                    self.kind(),
                    id,
                    active as i64,
                    Utc::now().to_rfc3339()
                ],
            )
        })?;
        if changed == 0 {
            return Err(Error::not_found(self.kind(), id));
        }
        let action = if active {
            InvalidationAction::Update
        } else {
            InvalidationAction::Deactivate
        };
        self.publish(id, &scope, action);
        Ok(())
    }

    /// Hard delete: entry, versions (FK cascade), tags, trajectory,
    /// embeddings. Admin path only.
    pub fn delete(&self, id: &str) -> Result<()> {
        let scope = self.require_scope(id)?;
        self.adapter.transaction(|conn| {
            conn.execute(
                "DELETE FROM entry_tags WHERE entry_type = ?1 AND entry_id = ?2",
                params![self.kind(), id],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;
            conn.execute(
                "DELETE FROM trajectory_steps WHERE entry_id = ?1",
                params![id],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;
            let deleted = conn
                .execute(
                    "DELETE FROM entries WHERE entry_type = ?1 AND id = ?2",
                    params![self.kind(), id],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
            if deleted == 0 {
                return Err(Error::not_found(self.kind(), id));
            }
            Ok(())
        })?;
        self.publish(id, &scope, InvalidationAction::Delete);
        Ok(())
    }

    /// Replace the tag set of an entry.
    pub fn set_tags(&self, id: &str, tags: &[String]) -> Result<()> {
        self.adapter.transaction(|conn| {
            conn.execute(
                "DELETE FROM entry_tags WHERE entry_type = ?1 AND entry_id = ?2",
                params![self.kind(), id],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;
            for tag in tags {
                conn.execute(
                    "INSERT OR IGNORE INTO entry_tags (entry_type, entry_id, tag_name)
                     VALUES (?1, ?2, ?3)",
                    params![self.kind(), id, tag],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
            }
            Ok(())
        })
    }

    /// Tags attached to an entry.
    pub fn get_tags(&self, id: &str) -> Result<Vec<String>> {
        self.adapter.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT tag_name FROM entry_tags
                 WHERE entry_type = ?1 AND entry_id = ?2 ORDER BY tag_name",
            )?;
            let rows = stmt
                .query_map(params![self.kind(), id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
    }

    fn require_scope(&self, id: &str) -> Result<Scope> {
        let envelope = self
            .adapter
            .with_conn(|conn| self_load(conn, &self.kind(), id))?
            .ok_or_else(|| Error::not_found(self.kind(), id))?;
        Ok(envelope.scope)
    }

    fn load_envelope(&self, conn: &Connection, id: &str) -> Result<Option<Envelope>> {
        self_load(conn, &self.kind(), id).map_err(|e| Error::Storage(e.to_string()))
    }

    fn publish(&self, id: &str, scope: &Scope, action: InvalidationAction) {
        self.adapter.bus().publish(InvalidationEvent {
            entry_type: self.entry_type,
            entry_id: id.to_string(),
            scope: scope.clone(),
            action,
        });
    }
}

const ENVELOPE_COLUMNS: &str = "e.id, e.entry_type, e.scope_type, e.scope_id, \
     e.current_version_id, e.version_num, e.is_active, e.access_count, \
     e.last_accessed_at, e.created_at, e.updated_at";

fn self_load(conn: &Connection, kind: &str, id: &str) -> rusqlite::Result<Option<Envelope>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM entries e WHERE e.entry_type = ?1 AND e.id = ?2",
            ENVELOPE_COLUMNS
        ),
        params![kind, id],
        |row| row_to_envelope(row),
    )
    .optional()
}

fn row_to_envelope(row: &Row) -> rusqlite::Result<Envelope> {
    let entry_type_str: String = row.get(1)?;
    let scope_type_str: String = row.get(2)?;
    let scope_id: Option<String> = row.get(3)?;

    Ok(Envelope {
        id: row.get(0)?,
        entry_type: entry_type_str
            .parse()
            .unwrap_or(EntryType::Knowledge),
        scope: Scope {
            scope_type: scope_type_str.parse().unwrap_or(ScopeType::Global),
            scope_id,
        },
        current_version_id: row.get(4)?,
        version_num: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
        access_count: row.get(7)?,
        last_accessed_at: row
            .get::<_, Option<String>>(8)?
            .map(parse_datetime),
        created_at: parse_datetime(row.get::<_, String>(9)?),
        updated_at: parse_datetime(row.get::<_, String>(10)?),
    })
}

fn row_to_record(row: &Row) -> rusqlite::Result<EntryRecord> {
    let envelope = row_to_envelope(row)?;
    let name: String = row.get(11)?;
    let payload_text: String = row.get(12)?;
    Ok(EntryRecord {
        envelope,
        name,
        payload: serde_json::from_str(&payload_text).unwrap_or(Value::Null),
    })
}

pub(crate) fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            // SQLite datetime('now') default lacks a timezone suffix
            chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .unwrap_or_else(|_| Utc::now())
        })
}

/// Quote an FTS query so user text cannot inject FTS syntax.
pub(crate) fn fts_escape(query: &str) -> String {
    let cleaned = query.replace('"', " ");
    cleaned
        .split_whitespace()
        .map(|term| format!("\"{}\"", term))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolver for parent scope ids used by inherited lookups when the
/// caller has no surrounding context.
pub fn no_parent_scopes(_st: ScopeType) -> Option<String> {
    None
}
