// # L1 In-process Cache
//
// TTL-bounded local map with lazy expiry. Entries are never authoritative;
// they mirror L2 values for the lifetime of their TTL. No background sweep:
// a get on an expired entry removes it and reports a miss.

use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process cache with per-entry TTLs.
pub struct LocalCache {
    entries: DashMap<String, Entry>,
    /// Per-key gates serializing concurrent `get_or_set` loaders
    loader_gates: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            loader_gates: DashMap::new(),
        }
    }

    /// Store a value with a TTL.
    pub fn set(&self, key: &str, value: Value, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Fetch a value. Expired entries are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        // Expired: evict lazily.
        self.entries.remove(key);
        None
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.loader_gates.clear();
    }

    /// Live entry count. Expired-but-unevicted entries are not counted.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True iff a live entry for `key` structurally equals `candidate`.
    /// Used by the write path to suppress redundant L2 writes.
    pub fn is_unchanged(&self, key: &str, candidate: &Value) -> bool {
        match self.entries.get(key) {
            Some(entry) => !entry.is_expired() && entry.value == *candidate,
            None => false,
        }
    }

    /// Return the cached value, or run `loader` to populate it. Concurrent
    /// callers for the same key are serialized so the loader runs once.
    pub async fn get_or_set<F, Fut>(&self, key: &str, loader: F, ttl: Duration) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let gate = self
            .loader_gates
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = gate.lock().await;

        // A concurrent loader may have filled the entry while we waited.
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let value = loader().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_set_get_round_trip() {
        let cache = LocalCache::new();
        cache.set("k", json!({"a": 1}), Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some(json!({"a": 1})));
    }

    #[test]
    fn test_expired_entry_is_miss() {
        let cache = LocalCache::new();
        cache.set("k", json!(1), Duration::from_millis(0));
        assert_eq!(cache.get("k"), None);
        // The expired entry was evicted on read.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_delete_then_get() {
        let cache = LocalCache::new();
        cache.set("k", json!("v"), Duration::from_secs(60));
        cache.delete("k");
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_is_unchanged() {
        let cache = LocalCache::new();
        cache.set("k", json!({"n": 5}), Duration::from_secs(60));
        assert!(cache.is_unchanged("k", &json!({"n": 5})));
        assert!(!cache.is_unchanged("k", &json!({"n": 6})));
        assert!(!cache.is_unchanged("missing", &json!(null)));
    }

    #[test]
    fn test_is_unchanged_expired_entry() {
        let cache = LocalCache::new();
        cache.set("k", json!(1), Duration::from_millis(0));
        assert!(!cache.is_unchanged("k", &json!(1)));
    }

    #[tokio::test]
    async fn test_get_or_set_runs_loader_once() {
        let cache = Arc::new(LocalCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_set(
                        "shared",
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok(json!("loaded"))
                        },
                        Duration::from_secs(60),
                    )
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!("loaded"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
