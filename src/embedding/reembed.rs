//! Background re-embedding on model-dimension drift.
//!
//! When the provider's embedding dimension differs from what the store
//! holds (model swap), the corpus is re-embedded in batches: page through
//! mismatched rows, fetch each entry's current text, compute a new vector,
//! overwrite, and yield between batches. Missing or unknown entries are
//! skipped, never failed.

use crate::artifact::EntryType;
use crate::config::EmbeddingConfig;
use crate::embedding::provider::EmbeddingProvider;
use crate::embedding::store::VectorStore;
use crate::error::Result;
use crate::storage::StorageAdapter;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Re-embed run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReembedState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Progress readable mid-run.
#[derive(Debug, Clone, Serialize)]
pub struct ReembedProgress {
    pub state: ReembedState,
    pub processed: u64,
    pub failed: u64,
    /// Mismatched rows remaining when the run started
    pub queued: u64,
}

impl ReembedProgress {
    fn idle() -> Self {
        Self {
            state: ReembedState::Idle,
            processed: 0,
            failed: 0,
            queued: 0,
        }
    }
}

/// The current text of an entry, as re-embedding input.
#[derive(Debug, Clone)]
pub struct EntryText {
    pub version_id: String,
    pub version_num: i64,
    pub text: String,
}

/// Source of current entry text for re-embedding.
pub trait EntryTextSource: Send + Sync {
    fn current_text(&self, entry_type: EntryType, entry_id: &str) -> Result<Option<EntryText>>;
}

/// Text source backed by the entries table.
pub struct StoredTextSource {
    adapter: Arc<StorageAdapter>,
}

impl StoredTextSource {
    pub fn new(adapter: Arc<StorageAdapter>) -> Self {
        Self { adapter }
    }
}

impl EntryTextSource for StoredTextSource {
    fn current_text(&self, entry_type: EntryType, entry_id: &str) -> Result<Option<EntryText>> {
        self.adapter.with_conn(|conn| {
            conn.query_row(
                "SELECT current_version_id, version_num, name || ' ' || content
                 FROM entries WHERE entry_type = ?1 AND id = ?2",
                params![entry_type.to_string(), entry_id],
                |row| {
                    Ok(EntryText {
                        version_id: row.get(0)?,
                        version_num: row.get(1)?,
                        text: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }
}

/// Detects dimension drift and re-embeds the corpus.
pub struct ReembedService {
    provider: Arc<dyn EmbeddingProvider>,
    store: VectorStore,
    source: Arc<dyn EntryTextSource>,
    config: EmbeddingConfig,
    progress: Mutex<ReembedProgress>,
}

impl ReembedService {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        store: VectorStore,
        source: Arc<dyn EntryTextSource>,
        config: EmbeddingConfig,
    ) -> Self {
        Self {
            provider,
            store,
            source,
            config,
            progress: Mutex::new(ReembedProgress::idle()),
        }
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> ReembedProgress {
        self.progress.lock().expect("progress mutex poisoned").clone()
    }

    /// Check for drift and run a re-embed when needed. Returns whether a
    /// run happened. Concurrent triggers are refused.
    pub async fn trigger_if_needed(&self) -> Result<bool> {
        let expected = self.provider.dimension();
        let mismatched = self.store.count_with_other_dimension(expected)?;
        if mismatched == 0 || !self.provider.is_available() {
            return Ok(false);
        }

        {
            let mut progress = self.progress.lock().expect("progress mutex poisoned");
            if progress.state == ReembedState::Running {
                tracing::debug!("re-embed already running; trigger refused");
                return Ok(false);
            }
            *progress = ReembedProgress {
                state: ReembedState::Running,
                processed: 0,
                failed: 0,
                queued: mismatched as u64,
            };
        }

        tracing::info!(
            expected_dimension = expected,
            mismatched,
            "embedding dimension drift detected; re-embedding"
        );

        let outcome = self.run(expected).await;
        let mut progress = self.progress.lock().expect("progress mutex poisoned");
        match outcome {
            Ok(()) => progress.state = ReembedState::Completed,
            Err(err) => {
                tracing::error!(error = %err, "re-embed run failed");
                progress.state = ReembedState::Failed;
            }
        }
        Ok(true)
    }

    async fn run(&self, expected: usize) -> Result<()> {
        // Rows that are skipped or fail stay mismatched; advancing the
        // offset past them keeps the pager from re-reading them forever
        let mut left_behind: usize = 0;

        loop {
            let batch =
                self.store
                    .page_mismatched(expected, left_behind, self.config.reembed_batch_size)?;
            if batch.is_empty() {
                break;
            }

            for meta in &batch {
                let entry = match self.source.current_text(meta.entry_type, &meta.entry_id) {
                    Ok(Some(entry)) => entry,
                    Ok(None) => {
                        left_behind += 1;
                        continue;
                    }
                    Err(err) => {
                        tracing::debug!(entry_id = %meta.entry_id, error = %err, "text lookup failed; skipping");
                        left_behind += 1;
                        continue;
                    }
                };

                match self.provider.embed(&entry.text).await {
                    Ok(vector) => {
                        self.store.upsert(
                            meta.entry_type,
                            &meta.entry_id,
                            &entry.version_id,
                            entry.version_num,
                            self.provider.model(),
                            &vector,
                        )?;
                        let mut progress =
                            self.progress.lock().expect("progress mutex poisoned");
                        progress.processed += 1;
                    }
                    Err(err) => {
                        tracing::warn!(entry_id = %meta.entry_id, error = %err, "re-embed failed");
                        left_behind += 1;
                        let mut progress =
                            self.progress.lock().expect("progress mutex poisoned");
                        progress.failed += 1;
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(self.config.reembed_batch_delay_ms)).await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::provider::HashEmbeddingProvider;

    fn seed_entry(adapter: &StorageAdapter, id: &str) {
        adapter
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO entries (id, entry_type, scope_type, scope_id, name, content, current_version_id)
                     VALUES (?1, 'knowledge', 'global', NULL, ?1, 'entry content', ?1 || ':v1')",
                    params![id],
                )
            })
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dimension_drift_reembeds_corpus() {
        let adapter = StorageAdapter::in_memory().unwrap();
        let store = VectorStore::new(Arc::clone(&adapter));

        // Three entries embedded at 768 dims by the previous model
        for id in ["e1", "e2", "e3"] {
            seed_entry(&adapter, id);
            store
                .upsert(EntryType::Knowledge, id, &format!("{}:v1", id), 1, "old-model", &vec![0.5f32; 768])
                .unwrap();
        }

        let provider = Arc::new(HashEmbeddingProvider::new(384));
        let service = ReembedService::new(
            provider,
            store.clone(),
            Arc::new(StoredTextSource::new(adapter)),
            EmbeddingConfig {
                reembed_batch_size: 2,
                reembed_batch_delay_ms: 10,
                ..Default::default()
            },
        );

        let ran = service.trigger_if_needed().await.unwrap();
        assert!(ran);

        let progress = service.progress();
        assert_eq!(progress.state, ReembedState::Completed);
        assert_eq!(progress.processed, 3);
        assert_eq!(progress.failed, 0);
        assert_eq!(progress.queued, 3);

        for id in ["e1", "e2", "e3"] {
            let stored = store.get(EntryType::Knowledge, id).unwrap().unwrap();
            assert_eq!(stored.dimension, 384);
            assert_eq!(stored.model, "hash-v1");
        }

        // Nothing left to do on the second trigger
        assert!(!service.trigger_if_needed().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_entries_are_skipped() {
        let adapter = StorageAdapter::in_memory().unwrap();
        let store = VectorStore::new(Arc::clone(&adapter));

        seed_entry(&adapter, "kept");
        store
            .upsert(EntryType::Knowledge, "kept", "kept:v1", 1, "old", &vec![0.1f32; 768])
            .unwrap();

        // An orphaned embedding row with no entries row behind it
        seed_entry(&adapter, "orphan");
        store
            .upsert(EntryType::Knowledge, "orphan", "orphan:v1", 1, "old", &vec![0.1f32; 768])
            .unwrap();
        adapter
            .with_conn(|conn| {
                // Remove the entry but keep the embedding row
                conn.execute("PRAGMA foreign_keys = OFF", [])?;
                conn.execute(
                    "DELETE FROM entries WHERE id = 'orphan'",
                    [],
                )?;
                conn.execute("PRAGMA foreign_keys = ON", [])
            })
            .unwrap();

        let service = ReembedService::new(
            Arc::new(HashEmbeddingProvider::new(384)),
            store.clone(),
            Arc::new(StoredTextSource::new(adapter)),
            EmbeddingConfig::default(),
        );

        assert!(service.trigger_if_needed().await.unwrap());
        let progress = service.progress();
        assert_eq!(progress.state, ReembedState::Completed);
        assert_eq!(progress.processed, 1);
        assert_eq!(progress.failed, 0);

        assert_eq!(
            store.get(EntryType::Knowledge, "kept").unwrap().unwrap().dimension,
            384
        );
    }

    #[tokio::test]
    async fn test_no_drift_no_run() {
        let adapter = StorageAdapter::in_memory().unwrap();
        let store = VectorStore::new(Arc::clone(&adapter));
        seed_entry(&adapter, "e1");
        store
            .upsert(EntryType::Knowledge, "e1", "e1:v1", 1, "m", &vec![0.1f32; 384])
            .unwrap();

        let service = ReembedService::new(
            Arc::new(HashEmbeddingProvider::new(384)),
            store,
            Arc::new(StoredTextSource::new(adapter)),
            EmbeddingConfig::default(),
        );
        assert!(!service.trigger_if_needed().await.unwrap());
        assert_eq!(service.progress().state, ReembedState::Idle);
    }
}
