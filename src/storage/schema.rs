//! SQLite schema and migrations for the memory service.
//!
//! The schema is applied through a sequence of append-only migrations;
//! shipped migrations are never edited, only followed by new ones.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 4;

/// Initialize the database schema, applying any missing migrations.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL for concurrent readers alongside the single writer
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_core(conn)?;
    }
    if current_version < 2 {
        apply_v2_permissions_audit(conn)?;
    }
    if current_version < 3 {
        apply_v3_classification(conn)?;
    }
    if current_version < 4 {
        apply_v4_embeddings(conn)?;
    }

    Ok(())
}

/// v1: scope tables, artifact envelope, version chains, trajectories, tags.
fn apply_v1_core(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS orgs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            org_id TEXT REFERENCES orgs(id) ON DELETE SET NULL,
            name TEXT NOT NULL,
            root_path TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            project_id TEXT REFERENCES projects(id) ON DELETE CASCADE,
            agent_id TEXT NOT NULL,
            started_at TEXT NOT NULL DEFAULT (datetime('now')),
            ended_at TEXT,
            metadata TEXT
        )",
        [],
    )?;

    // Artifact envelope. `name` holds the guideline/tool name or the
    // knowledge/experience title; `content` mirrors the head version's
    // content so FTS triggers can index it.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS entries (
            id TEXT NOT NULL,
            entry_type TEXT NOT NULL,
            scope_type TEXT NOT NULL,
            scope_id TEXT,
            name TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            current_version_id TEXT NOT NULL,
            version_num INTEGER NOT NULL DEFAULT 1,
            is_active INTEGER NOT NULL DEFAULT 1,
            access_count INTEGER NOT NULL DEFAULT 0,
            last_accessed_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (entry_type, id),
            CHECK ((scope_type = 'global') = (scope_id IS NULL))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS entry_versions (
            version_id TEXT PRIMARY KEY,
            entry_type TEXT NOT NULL,
            entry_id TEXT NOT NULL,
            version_num INTEGER NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (entry_type, entry_id, version_num),
            FOREIGN KEY (entry_type, entry_id)
                REFERENCES entries(entry_type, id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS trajectory_steps (
            entry_id TEXT NOT NULL,
            step_num INTEGER NOT NULL,
            action TEXT NOT NULL,
            observation TEXT,
            reasoning TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (entry_id, step_num)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS entry_tags (
            entry_type TEXT NOT NULL,
            entry_id TEXT NOT NULL,
            tag_name TEXT NOT NULL,
            PRIMARY KEY (entry_type, entry_id, tag_name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entries_scope
         ON entries(entry_type, scope_type, scope_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entries_name ON entries(entry_type, name)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_versions_entry
         ON entry_versions(entry_type, entry_id, version_num)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_projects_path ON projects(root_path)",
        [],
    )?;

    // Full-text search over names and head content, used by list text
    // queries and the duplicate service
    conn.execute(
        "CREATE VIRTUAL TABLE IF NOT EXISTS entries_fts USING fts5(
            name,
            content,
            content='entries',
            content_rowid='rowid'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS entries_ai AFTER INSERT ON entries BEGIN
            INSERT INTO entries_fts(rowid, name, content)
            VALUES (NEW.rowid, NEW.name, NEW.content);
        END",
        [],
    )?;
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS entries_ad AFTER DELETE ON entries BEGIN
            INSERT INTO entries_fts(entries_fts, rowid, name, content)
            VALUES ('delete', OLD.rowid, OLD.name, OLD.content);
        END",
        [],
    )?;
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS entries_au AFTER UPDATE ON entries BEGIN
            INSERT INTO entries_fts(entries_fts, rowid, name, content)
            VALUES ('delete', OLD.rowid, OLD.name, OLD.content);
            INSERT INTO entries_fts(rowid, name, content)
            VALUES (NEW.rowid, NEW.name, NEW.content);
        END",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    Ok(())
}

/// v2: ACL rows and the audit log.
fn apply_v2_permissions_audit(conn: &Connection) -> SqliteResult<()> {
    // NULL columns are wildcards; specificity resolution happens in code
    conn.execute(
        "CREATE TABLE IF NOT EXISTS permissions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id TEXT NOT NULL,
            scope_type TEXT,
            scope_id TEXT,
            entry_type TEXT,
            entry_id TEXT,
            permission TEXT NOT NULL CHECK (permission IN ('read', 'write', 'admin')),
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_permissions_agent ON permissions(agent_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            resource TEXT NOT NULL,
            outcome TEXT NOT NULL,
            detail TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_log(actor, created_at)",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;
    Ok(())
}

/// v3: classification feedback and per-pattern confidence.
fn apply_v3_classification(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS classification_feedback (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            text_hash TEXT NOT NULL,
            text TEXT NOT NULL,
            predicted TEXT NOT NULL,
            actual TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feedback_hash ON classification_feedback(text_hash)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pattern_confidence (
            pattern_id TEXT PRIMARY KEY,
            correct_matches INTEGER NOT NULL DEFAULT 0,
            incorrect_matches INTEGER NOT NULL DEFAULT 0,
            multiplier REAL NOT NULL DEFAULT 1.0,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (3)", [])?;
    Ok(())
}

/// v4: vector embedding side store.
fn apply_v4_embeddings(conn: &Connection) -> SqliteResult<()> {
    // One row per entry; version_id records which version the vector was
    // computed from so stale workers cannot clobber a newer embedding
    conn.execute(
        "CREATE TABLE IF NOT EXISTS embeddings (
            entry_type TEXT NOT NULL,
            entry_id TEXT NOT NULL,
            version_id TEXT NOT NULL,
            version_num INTEGER NOT NULL,
            model TEXT NOT NULL,
            dimension INTEGER NOT NULL,
            vector BLOB NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (entry_type, entry_id),
            FOREIGN KEY (entry_type, entry_id)
                REFERENCES entries(entry_type, id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_embeddings_dimension ON embeddings(dimension)",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (4)", [])?;
    Ok(())
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='entries'",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_schema() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        assert!(is_initialized(&conn));
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_idempotent_initialization() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_scope_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        // global with a scope_id violates the CHECK
        let result = conn.execute(
            "INSERT INTO entries (id, entry_type, scope_type, scope_id, name, current_version_id)
             VALUES ('e1', 'guideline', 'global', 'oops', 'n', 'e1:v1')",
            [],
        );
        assert!(result.is_err());

        // project without a scope_id violates the CHECK
        let result = conn.execute(
            "INSERT INTO entries (id, entry_type, scope_type, scope_id, name, current_version_id)
             VALUES ('e2', 'guideline', 'project', NULL, 'n', 'e2:v1')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_fts_triggers_follow_updates() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO entries (id, entry_type, scope_type, scope_id, name, content, current_version_id)
             VALUES ('e1', 'guideline', 'global', NULL, 'strict mode', 'always use strict mode', 'e1:v1')",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM entries_fts WHERE entries_fts MATCH 'strict'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        conn.execute("UPDATE entries SET content = 'renamed away' WHERE id = 'e1'", [])
            .unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM entries_fts WHERE entries_fts MATCH 'renamed'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }
}
