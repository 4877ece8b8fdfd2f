//! Storage adapter: exclusive owner of the database handle.
//!
//! The SQL engine is strictly synchronous; a transaction body is a
//! synchronous closure and must not suspend on external work. Two
//! safeguards enforce this at run time:
//!
//! - Nested `transaction` calls fail with [`Error::NestedTransaction`].
//! - Code that is about to suspend on external work (provider calls,
//!   remote rate-limit checks) calls [`StorageAdapter::guard_async`]
//!   first; inside a transaction that fails with
//!   [`Error::TransactionAsyncEscape`] naming the offending transaction.

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::storage::events::InvalidationBus;
use crate::storage::schema::initialize_schema;
use rusqlite::Connection;
use std::cell::RefCell;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

thread_local! {
    static ACTIVE_TXN: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Clears the thread-local transaction marker on scope exit, including
/// error and panic paths.
struct TxnMarker;

impl TxnMarker {
    fn enter(txn_id: String) -> Result<Self> {
        ACTIVE_TXN.with(|cell| {
            let mut active = cell.borrow_mut();
            if let Some(existing) = active.as_ref() {
                return Err(Error::NestedTransaction {
                    txn_id: existing.clone(),
                });
            }
            *active = Some(txn_id);
            Ok(TxnMarker)
        })
    }
}

impl Drop for TxnMarker {
    fn drop(&mut self) {
        ACTIVE_TXN.with(|cell| cell.borrow_mut().take());
    }
}

/// Exclusive owner of the SQLite connection.
///
/// Repositories hold an `Arc<StorageAdapter>` and never close the handle.
pub struct StorageAdapter {
    conn: Mutex<Connection>,
    txn_counter: AtomicU64,
    bus: InvalidationBus,
    metrics: Metrics,
}

impl StorageAdapter {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>, metrics: Metrics) -> Result<Arc<Self>> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        Self::from_connection(conn, metrics)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        Self::from_connection(conn, Metrics::new())
    }

    fn from_connection(conn: Connection, metrics: Metrics) -> Result<Arc<Self>> {
        conn.set_prepared_statement_cache_capacity(64);
        initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        // The statement cache only survives unchanged schema
        conn.flush_prepared_statement_cache();

        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
            txn_counter: AtomicU64::new(0),
            bus: InvalidationBus::default(),
            metrics,
        }))
    }

    /// Run `f` with the connection outside any explicit transaction.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::Storage(e.to_string()))
    }

    /// Run a synchronous transaction.
    ///
    /// The body receives the transactional connection and must complete
    /// without suspending; commit happens iff the body returns `Ok`.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let txn_id = format!("txn-{}", self.txn_counter.fetch_add(1, Ordering::SeqCst) + 1);
        let _marker = TxnMarker::enter(txn_id.clone())?;

        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Storage(e.to_string()))?;

        tracing::trace!(txn_id = %txn_id, "transaction started");
        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(|e| Error::Storage(e.to_string()))?;
                self.metrics.incr("storage.txn_committed");
                Ok(value)
            }
            Err(err) => {
                // Transaction rolls back on drop
                self.metrics.incr("storage.txn_rolled_back");
                tracing::debug!(txn_id = %txn_id, error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }

    /// The transaction id active on this thread, if any.
    pub fn current_txn() -> Option<String> {
        ACTIVE_TXN.with(|cell| cell.borrow().clone())
    }

    /// Fail if called while a synchronous transaction is active on this
    /// thread. Every path that suspends on external work consults this
    /// before suspending.
    pub fn guard_async(operation: &str) -> Result<()> {
        match Self::current_txn() {
            Some(txn_id) => Err(Error::TransactionAsyncEscape {
                txn_id,
                cause: format!("'{}' would suspend inside a synchronous transaction", operation),
                remediation:
                    "Run the external work before or after the transaction closure; transaction \
                     bodies must stay synchronous."
                        .to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Snapshot the live database into `path` (used by backups).
    pub fn snapshot_to(&self, path: &std::path::Path) -> Result<()> {
        let target = path.to_string_lossy().replace('\'', "''");
        self.with_conn(|conn| {
            conn.execute(&format!("VACUUM INTO '{}'", target), [])
        })?;
        Ok(())
    }

    /// Replace the live database contents from a backup file.
    pub fn restore_from_file(&self, path: &std::path::Path) -> Result<()> {
        let source = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        let backup = rusqlite::backup::Backup::new(&source, &mut conn)
            .map_err(|e| Error::Storage(e.to_string()))?;
        backup
            .run_to_completion(64, std::time::Duration::from_millis(5), None)
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    /// The cache-invalidation bus. Events are published after commit.
    pub fn bus(&self) -> &InvalidationBus {
        &self.bus
    }

    /// The shared metrics registry.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_and_rollback() {
        let adapter = StorageAdapter::in_memory().unwrap();

        adapter
            .transaction(|conn| {
                conn.execute(
                    "INSERT INTO orgs (id, name) VALUES ('o1', 'acme')",
                    [],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(())
            })
            .unwrap();

        let result: Result<()> = adapter.transaction(|conn| {
            conn.execute(
                "INSERT INTO orgs (id, name) VALUES ('o2', 'temp')",
                [],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;
            Err(Error::Internal("force rollback".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = adapter
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM orgs", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_nested_transaction_rejected() {
        let adapter = StorageAdapter::in_memory().unwrap();
        let adapter2 = Arc::clone(&adapter);

        let result: Result<()> = adapter.transaction(|_conn| {
            adapter2.transaction(|_conn| Ok(()))
        });
        assert!(matches!(result, Err(Error::NestedTransaction { .. })));

        // The marker was cleared; a fresh transaction succeeds
        adapter.transaction(|_conn| Ok(())).unwrap();
    }

    #[test]
    fn test_async_escape_detected() {
        let adapter = StorageAdapter::in_memory().unwrap();

        let result: Result<()> = adapter.transaction(|_conn| {
            // A provider call reached from inside the body would hit this
            StorageAdapter::guard_async("embedding provider call")?;
            Ok(())
        });

        let err = result.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Transaction ID: txn-"), "got: {}", msg);
        assert!(msg.contains("embedding provider call"));

        // Subsequent transactions succeed
        adapter.transaction(|_conn| Ok(())).unwrap();
        // And the guard passes outside any transaction
        StorageAdapter::guard_async("embedding provider call").unwrap();
    }

    #[test]
    fn test_txn_ids_are_distinct() {
        let adapter = StorageAdapter::in_memory().unwrap();
        let mut seen = Vec::new();
        for _ in 0..3 {
            let id = adapter
                .transaction(|_conn| Ok(StorageAdapter::current_txn().unwrap()))
                .unwrap();
            seen.push(id);
        }
        seen.dedup();
        assert_eq!(seen.len(), 3);
    }
}
