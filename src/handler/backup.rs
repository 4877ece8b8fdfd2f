//! Database backups behind an admin key.

use crate::error::{Error, Result};
use crate::storage::StorageAdapter;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Backups kept by default after cleanup.
pub const DEFAULT_KEEP_COUNT: usize = 5;

/// One backup file on disk.
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub filename: String,
    pub size_bytes: u64,
}

/// Admin-keyed backup operations.
pub struct BackupService {
    adapter: Arc<StorageAdapter>,
    backup_dir: PathBuf,
    admin_key: String,
}

impl BackupService {
    pub fn new(adapter: Arc<StorageAdapter>, backup_dir: PathBuf, admin_key: String) -> Self {
        Self {
            adapter,
            backup_dir,
            admin_key,
        }
    }

    fn authorize(&self, key: &str) -> Result<()> {
        if key == self.admin_key {
            Ok(())
        } else {
            Err(Error::permission_denied("?", "admin", "backups"))
        }
    }

    /// Snapshot the live database into a new timestamped file.
    pub fn create(&self, key: &str) -> Result<BackupInfo> {
        self.authorize(key)?;
        std::fs::create_dir_all(&self.backup_dir)
            .map_err(|e| Error::Storage(format!("backup dir: {}", e)))?;

        let filename = format!(
            "backup-{}-{}.db",
            Utc::now().format("%Y%m%d-%H%M%S"),
            uuid::Uuid::new_v4().simple()
        );
        let path = self.backup_dir.join(&filename);
        self.adapter.snapshot_to(&path)?;

        let size_bytes = std::fs::metadata(&path)
            .map(|m| m.len())
            .unwrap_or_default();
        tracing::info!(filename = %filename, size_bytes, "backup created");
        Ok(BackupInfo {
            filename,
            size_bytes,
        })
    }

    /// List backups, newest first.
    pub fn list(&self, key: &str) -> Result<Vec<BackupInfo>> {
        self.authorize(key)?;
        let mut backups = Vec::new();
        let entries = match std::fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(backups),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("backup-") && name.ends_with(".db") {
                backups.push(BackupInfo {
                    size_bytes: entry.metadata().map(|m| m.len()).unwrap_or_default(),
                    filename: name,
                });
            }
        }
        backups.sort_by(|a, b| b.filename.cmp(&a.filename));
        Ok(backups)
    }

    /// Delete all but the newest `keep_count` backups.
    pub fn cleanup(&self, key: &str, keep_count: usize) -> Result<usize> {
        let backups = self.list(key)?;
        let mut removed = 0;
        for stale in backups.iter().skip(keep_count) {
            if std::fs::remove_file(self.backup_dir.join(&stale.filename)).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Restore the live database from a named backup.
    pub fn restore(&self, key: &str, filename: &str) -> Result<()> {
        self.authorize(key)?;
        // Reject path traversal in user-supplied filenames
        if filename.contains('/') || filename.contains("..") {
            return Err(Error::validation("filename", "must be a bare backup name"));
        }
        let path = self.backup_dir.join(filename);
        if !path.exists() {
            return Err(Error::not_found("backup", filename));
        }
        self.adapter.restore_from_file(&path)?;
        tracing::info!(filename, "database restored from backup");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (BackupService, Arc<StorageAdapter>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let adapter = StorageAdapter::in_memory().unwrap();
        let service = BackupService::new(
            Arc::clone(&adapter),
            dir.path().to_path_buf(),
            "secret-admin-key".to_string(),
        );
        (service, adapter, dir)
    }

    #[test]
    fn test_requires_admin_key() {
        let (service, _, _dir) = service();
        assert!(matches!(
            service.create("wrong"),
            Err(Error::PermissionDenied { .. })
        ));
        assert!(service.create("secret-admin-key").is_ok());
    }

    #[test]
    fn test_create_list_cleanup() {
        let (service, _, _dir) = service();
        for _ in 0..3 {
            service.create("secret-admin-key").unwrap();
        }

        let listed = service.list("secret-admin-key").unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|b| b.size_bytes > 0));

        let removed = service.cleanup("secret-admin-key", 1).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(service.list("secret-admin-key").unwrap().len(), 1);
    }

    #[test]
    fn test_restore_round_trip() {
        let (service, adapter, _dir) = service();

        adapter
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO orgs (id, name) VALUES ('o1', 'before-backup')",
                    [],
                )
            })
            .unwrap();
        let backup = service.create("secret-admin-key").unwrap();

        // Mutate after the backup, then restore
        adapter
            .with_conn(|conn| conn.execute("DELETE FROM orgs", []))
            .unwrap();
        service
            .restore("secret-admin-key", &backup.filename)
            .unwrap();

        let name: String = adapter
            .with_conn(|conn| {
                conn.query_row("SELECT name FROM orgs WHERE id = 'o1'", [], |row| {
                    row.get(0)
                })
            })
            .unwrap();
        assert_eq!(name, "before-backup");
    }

    #[test]
    fn test_restore_rejects_traversal() {
        let (service, _, _dir) = service();
        assert!(matches!(
            service.restore("secret-admin-key", "../../etc/passwd"),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            service.restore("secret-admin-key", "backup-missing.db"),
            Err(Error::NotFound { .. })
        ));
    }
}
