//! Classification result cache with LRU eviction and TTL.

use crate::artifact::EntryType;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Hash key for classified text.
pub fn input_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
struct CachedClassification {
    entry_type: EntryType,
    confidence: f64,
    method: &'static str,
    inserted_at: Instant,
    last_used: u64,
}

/// LRU + TTL cache keyed by input hash.
pub struct ClassificationCache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CachedClassification>,
    clock: u64,
    hits: u64,
    misses: u64,
}

impl ClassificationCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Look up a cached result by text hash.
    pub fn get(&self, hash: &str) -> Option<(EntryType, f64, &'static str)> {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.clock += 1;
        let clock = inner.clock;

        let expired = match inner.entries.get(hash) {
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if expired {
            inner.entries.remove(hash);
            inner.misses += 1;
            return None;
        }

        let entry = inner.entries.get_mut(hash).expect("checked above");
        entry.last_used = clock;
        let result = (entry.entry_type, entry.confidence, entry.method);
        inner.hits += 1;
        Some(result)
    }

    /// Insert a result, evicting the least recently used entry when full.
    pub fn put(&self, hash: String, entry_type: EntryType, confidence: f64, method: &'static str) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.clock += 1;
        let clock = inner.clock;

        if inner.entries.len() >= self.capacity && !inner.entries.contains_key(&hash) {
            if let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&lru_key);
            }
        }

        inner.entries.insert(
            hash,
            CachedClassification {
                entry_type,
                confidence,
                method,
                inserted_at: Instant::now(),
                last_used: clock,
            },
        );
    }

    /// Remove one entry (used when a correction invalidates it).
    pub fn remove(&self, hash: &str) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.entries.remove(hash);
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.entries.clear();
    }

    /// (hits, misses) so far.
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock().expect("cache mutex poisoned");
        (inner.hits, inner.misses)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss() {
        let cache = ClassificationCache::new(8, Duration::from_secs(60));
        let hash = input_hash("npm run build");

        assert!(cache.get(&hash).is_none());
        cache.put(hash.clone(), EntryType::Tool, 0.9, "regex");

        let (et, conf, method) = cache.get(&hash).unwrap();
        assert_eq!(et, EntryType::Tool);
        assert!((conf - 0.9).abs() < f64::EPSILON);
        assert_eq!(method, "regex");
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ClassificationCache::new(2, Duration::from_secs(60));
        cache.put("a".into(), EntryType::Tool, 0.9, "regex");
        cache.put("b".into(), EntryType::Knowledge, 0.8, "regex");

        // Touch "a" so "b" becomes the LRU victim
        cache.get("a");
        cache.put("c".into(), EntryType::Guideline, 0.7, "regex");

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ClassificationCache::new(8, Duration::from_millis(0));
        cache.put("a".into(), EntryType::Tool, 0.9, "regex");
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_distinct_inputs_distinct_hashes() {
        assert_ne!(input_hash("a"), input_hash("b"));
        assert_eq!(input_hash("same"), input_hash("same"));
    }
}
