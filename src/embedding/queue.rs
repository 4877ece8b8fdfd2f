//! Bounded-concurrency embedding queue.
//!
//! Embeddings are computed off the write path. The queue keeps one pending
//! slot per `(entry_type, entry_id)` plus a FIFO of distinct keys; a fresh
//! enqueue for a key whose job has not started replaces the slot in place
//! (latest wins). Jobs already in flight for an older version are not
//! cancelled; the store's version check discards their result.

use crate::artifact::EntryType;
use crate::config::EmbeddingConfig;
use crate::embedding::provider::EmbeddingProvider;
use crate::embedding::store::VectorStore;
use crate::error::Result;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

type Key = (EntryType, String);

/// One queued embedding job.
#[derive(Debug, Clone)]
pub struct EmbeddingJob {
    pub entry_type: EntryType,
    pub entry_id: String,
    pub version_id: String,
    pub version_num: i64,
    pub text: String,
    pub attempts: u32,
}

/// A terminally failed job surfaced by `failed_jobs`.
#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    pub entry_type: EntryType,
    pub entry_id: String,
    pub version_id: String,
    pub attempts: u32,
    pub last_error: String,
    /// Original text, kept so `retry_failed` can requeue the job
    #[serde(skip)]
    text: String,
}

/// Queue observability counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub processed: u64,
    pub failed: u64,
    pub skipped_stale: u64,
    pub retried: u64,
    pub failed_pending_retry: usize,
}

#[derive(Default)]
struct QueueState {
    slots: HashMap<Key, EmbeddingJob>,
    fifo: VecDeque<Key>,
    retry: Vec<(Instant, EmbeddingJob)>,
    failed: HashMap<Key, FailedJob>,
}

struct Inner {
    provider: Arc<dyn EmbeddingProvider>,
    store: VectorStore,
    config: EmbeddingConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    in_flight: AtomicUsize,
    processed: AtomicU64,
    failed_total: AtomicU64,
    skipped_stale: AtomicU64,
    retried: AtomicU64,
    stopped: AtomicBool,
}

/// The embedding work queue.
pub struct EmbeddingQueue {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EmbeddingQueue {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        store: VectorStore,
        config: EmbeddingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                store,
                config,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                in_flight: AtomicUsize::new(0),
                processed: AtomicU64::new(0),
                failed_total: AtomicU64::new(0),
                skipped_stale: AtomicU64::new(0),
                retried: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool.
    pub fn start(&self) {
        let mut workers = self.workers.lock().expect("worker list poisoned");
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.inner.config.max_concurrency.max(1) {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move {
                worker_loop(inner, worker_id).await;
            }));
        }
    }

    /// Enqueue a job. If a pending job for the same entry has not started,
    /// it is replaced in place and counted as stale.
    pub fn enqueue(
        &self,
        entry_type: EntryType,
        entry_id: &str,
        version_id: &str,
        text: &str,
    ) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            tracing::warn!(entry_id, "embedding queue is stopped; dropping job");
            return Ok(());
        }

        let job = EmbeddingJob {
            entry_type,
            entry_id: entry_id.to_string(),
            version_id: version_id.to_string(),
            version_num: version_num_of(version_id),
            text: text.to_string(),
            attempts: 0,
        };
        let key: Key = (entry_type, entry_id.to_string());

        {
            let mut state = self.inner.state.lock().expect("queue state poisoned");
            state.failed.remove(&key);
            state.retry.retain(|(_, j)| {
                let stale = j.entry_type == entry_type && j.entry_id == entry_id;
                if stale {
                    self.inner.skipped_stale.fetch_add(1, Ordering::SeqCst);
                }
                !stale
            });

            if state.slots.insert(key.clone(), job).is_some() {
                // Previous job had not started; replaced in place
                self.inner.skipped_stale.fetch_add(1, Ordering::SeqCst);
            } else {
                state.fifo.push_back(key);
            }
        }

        self.inner.notify.notify_one();
        Ok(())
    }

    /// Terminally failed jobs with their last error messages.
    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        let state = self.inner.state.lock().expect("queue state poisoned");
        let mut jobs: Vec<FailedJob> = state.failed.values().cloned().collect();
        jobs.sort_by(|a, b| a.entry_id.cmp(&b.entry_id));
        jobs
    }

    /// Move every terminally failed job back onto the queue with a fresh
    /// attempt budget.
    pub fn retry_failed(&self) -> usize {
        let mut moved = 0;
        {
            let mut state = self.inner.state.lock().expect("queue state poisoned");
            let failed: Vec<FailedJob> = state.failed.drain().map(|(_, j)| j).collect();
            for failure in failed {
                let key: Key = (failure.entry_type, failure.entry_id.clone());
                if state.slots.contains_key(&key) {
                    continue;
                }
                let job = EmbeddingJob {
                    entry_type: failure.entry_type,
                    entry_id: failure.entry_id,
                    version_num: version_num_of(&failure.version_id),
                    version_id: failure.version_id,
                    text: failure.text,
                    attempts: 0,
                };
                state.slots.insert(key.clone(), job);
                state.fifo.push_back(key);
                moved += 1;
            }
        }
        if moved > 0 {
            self.inner.notify.notify_one();
        }
        moved
    }

    /// Current counters.
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock().expect("queue state poisoned");
        QueueStats {
            pending: state.fifo.len(),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            processed: self.inner.processed.load(Ordering::SeqCst),
            failed: self.inner.failed_total.load(Ordering::SeqCst),
            skipped_stale: self.inner.skipped_stale.load(Ordering::SeqCst),
            retried: self.inner.retried.load(Ordering::SeqCst),
            failed_pending_retry: state.retry.len(),
        }
    }

    /// Stop the workers and drop pending work.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        let mut workers = self.workers.lock().expect("worker list poisoned");
        for handle in workers.drain(..) {
            handle.abort();
        }
    }
}

async fn worker_loop(inner: Arc<Inner>, worker_id: usize) {
    tracing::debug!(worker_id, "embedding worker started");
    loop {
        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }
        match next_job(&inner) {
            Some(job) => process_job(&inner, job).await,
            None => {
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }
        }
    }
    tracing::debug!(worker_id, "embedding worker stopped");
}

fn next_job(inner: &Inner) -> Option<EmbeddingJob> {
    let mut state = inner.state.lock().expect("queue state poisoned");

    // Promote due retries back onto the FIFO
    let now = Instant::now();
    let mut due: Vec<EmbeddingJob> = Vec::new();
    state.retry.retain(|(at, job)| {
        if *at <= now {
            due.push(job.clone());
            false
        } else {
            true
        }
    });
    for job in due {
        let key: Key = (job.entry_type, job.entry_id.clone());
        if state.slots.contains_key(&key) {
            // A newer enqueue superseded the retry
            inner.skipped_stale.fetch_add(1, Ordering::SeqCst);
            continue;
        }
        state.slots.insert(key.clone(), job);
        state.fifo.push_back(key);
    }

    while let Some(key) = state.fifo.pop_front() {
        if let Some(job) = state.slots.remove(&key) {
            return Some(job);
        }
    }
    None
}

async fn process_job(inner: &Inner, job: EmbeddingJob) {
    if !inner.provider.is_available() {
        // Park, not fail: put the job back unless a newer one arrived
        {
            let mut state = inner.state.lock().expect("queue state poisoned");
            let key: Key = (job.entry_type, job.entry_id.clone());
            if state.slots.contains_key(&key) {
                inner.skipped_stale.fetch_add(1, Ordering::SeqCst);
            } else {
                state.slots.insert(key.clone(), job);
                state.fifo.push_back(key);
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        return;
    }

    inner.in_flight.fetch_add(1, Ordering::SeqCst);
    let result = inner.provider.embed(&job.text).await;
    inner.in_flight.fetch_sub(1, Ordering::SeqCst);

    match result {
        Ok(vector) => {
            let stored = inner.store.upsert(
                job.entry_type,
                &job.entry_id,
                &job.version_id,
                job.version_num,
                inner.provider.model(),
                &vector,
            );
            match stored {
                Ok(true) => {
                    inner.processed.fetch_add(1, Ordering::SeqCst);
                }
                Ok(false) => {
                    // A newer version's embedding is already stored
                    inner.skipped_stale.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => {
                    tracing::warn!(entry_id = %job.entry_id, error = %err, "embedding store failed");
                    fail_or_retry(inner, job, err.to_string());
                }
            }
        }
        Err(err) => {
            fail_or_retry(inner, job, err.to_string());
        }
    }

}

fn fail_or_retry(inner: &Inner, mut job: EmbeddingJob, error: String) {
    job.attempts += 1;
    let mut state = inner.state.lock().expect("queue state poisoned");
    if job.attempts < inner.config.max_attempts {
        let backoff = Duration::from_millis(
            inner.config.retry_base_delay_ms * 2u64.saturating_pow(job.attempts - 1),
        );
        inner.retried.fetch_add(1, Ordering::SeqCst);
        state.retry.push((Instant::now() + backoff, job));
    } else {
        inner.failed_total.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(
            entry_id = %job.entry_id,
            attempts = job.attempts,
            error = %error,
            "embedding job terminally failed"
        );
        state.failed.insert(
            (job.entry_type, job.entry_id.clone()),
            FailedJob {
                entry_type: job.entry_type,
                entry_id: job.entry_id,
                version_id: job.version_id,
                attempts: job.attempts,
                last_error: error,
                text: job.text,
            },
        );
    }
}

/// Parse the numeric suffix of a `<id>:v<n>` version id.
fn version_num_of(version_id: &str) -> i64 {
    version_id
        .rsplit(":v")
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::provider::HashEmbeddingProvider;
    use crate::error::Error;
    use crate::storage::StorageAdapter;
    use async_trait::async_trait;
    use rusqlite::params;

    fn seeded_adapter(ids: &[&str]) -> Arc<StorageAdapter> {
        let adapter = StorageAdapter::in_memory().unwrap();
        for id in ids {
            adapter
                .with_conn(|conn| {
                    conn.execute(
                        "INSERT INTO entries (id, entry_type, scope_type, scope_id, name, content, current_version_id)
                         VALUES (?1, 'knowledge', 'global', NULL, ?1, 'content', ?1 || ':v1')",
                        params![id],
                    )
                })
                .unwrap();
        }
        adapter
    }

    fn fast_config() -> EmbeddingConfig {
        EmbeddingConfig {
            max_concurrency: 2,
            max_attempts: 2,
            retry_base_delay_ms: 10,
            ..Default::default()
        }
    }

    async fn wait_until(check: impl Fn() -> bool) {
        let deadline = Duration::from_secs(10);
        tokio::time::timeout(deadline, async {
            loop {
                if check() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_wins_dedup() {
        let adapter = seeded_adapter(&["e1"]);
        let provider = Arc::new(HashEmbeddingProvider::new(8));
        let store = VectorStore::new(Arc::clone(&adapter));
        let queue = EmbeddingQueue::new(provider.clone(), store.clone(), fast_config());

        // Two enqueues for the same entry before any worker runs
        queue
            .enqueue(EntryType::Knowledge, "e1", "e1:v1", "old text")
            .unwrap();
        queue
            .enqueue(EntryType::Knowledge, "e1", "e1:v2", "new text")
            .unwrap();
        queue.start();

        wait_until(|| queue.stats().processed >= 1).await;

        let stats = queue.stats();
        assert_eq!(stats.processed, 1);
        assert!(stats.skipped_stale >= 1);

        // Exactly one stored embedding, for the later text
        let stored = store.get(EntryType::Knowledge, "e1").unwrap().unwrap();
        assert_eq!(stored.version_id, "e1:v2");
        let expected = provider.embed("new text").await.unwrap();
        assert_eq!(stored.vector, expected);

        queue.stop();
    }

    struct AlwaysFailProvider;

    #[async_trait]
    impl crate::embedding::provider::EmbeddingProvider for AlwaysFailProvider {
        async fn embed(&self, _text: &str) -> crate::error::Result<Vec<f32>> {
            Err(Error::provider("embeddings", "503 service unavailable"))
        }

        fn dimension(&self) -> usize {
            8
        }

        fn model(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_retry_then_surface() {
        let adapter = seeded_adapter(&["e1", "e2"]);
        let queue = EmbeddingQueue::new(
            Arc::new(AlwaysFailProvider),
            VectorStore::new(adapter),
            fast_config(),
        );

        queue
            .enqueue(EntryType::Knowledge, "e1", "e1:v1", "a")
            .unwrap();
        queue
            .enqueue(EntryType::Knowledge, "e2", "e2:v1", "b")
            .unwrap();
        queue.start();

        wait_until(|| queue.stats().failed >= 2).await;

        let stats = queue.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.processed, 0);
        // max_attempts = 2: each job retried once before terminal failure
        assert_eq!(stats.retried, 2);

        let failed = queue.failed_jobs();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|f| f.last_error.contains("503")));
        assert!(failed.iter().all(|f| f.attempts == 2));

        queue.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_provider_parks_jobs() {
        let adapter = seeded_adapter(&["e1"]);
        let provider = Arc::new(HashEmbeddingProvider::new(8));
        provider.set_available(false);
        let queue = EmbeddingQueue::new(
            provider.clone(),
            VectorStore::new(adapter),
            fast_config(),
        );

        queue
            .enqueue(EntryType::Knowledge, "e1", "e1:v1", "text")
            .unwrap();
        queue.start();

        // Give workers time to cycle; the job must be parked, not failed
        tokio::time::sleep(Duration::from_millis(500)).await;
        let stats = queue.stats();
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.failed, 0);

        provider.set_available(true);
        wait_until(|| queue.stats().processed == 1).await;

        queue.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_all_processed() {
        let ids = ["a", "b", "c", "d", "e"];
        let adapter = seeded_adapter(&ids);
        let provider = Arc::new(HashEmbeddingProvider::new(8));
        let store = VectorStore::new(Arc::clone(&adapter));
        let queue = EmbeddingQueue::new(provider, store.clone(), fast_config());

        for id in ids {
            queue
                .enqueue(
                    EntryType::Knowledge,
                    id,
                    &format!("{}:v1", id),
                    &format!("text {}", id),
                )
                .unwrap();
        }
        queue.start();

        wait_until(|| queue.stats().processed == 5).await;
        for id in ids {
            assert!(store.get(EntryType::Knowledge, id).unwrap().is_some());
        }

        queue.stop();
    }
}
