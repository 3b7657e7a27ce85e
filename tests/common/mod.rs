// Shared test doubles for the integration scenarios.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use media_relay::cache::{CacheService, KvProvider};
use media_relay::config::{CacheTierConfig, CoordinatorConfig};
use media_relay::coordination::InstanceCoordinator;
use media_relay::error::{RelayError, Result};

/// In-memory KV provider with scriptable failures.
pub struct MemoryKv {
    label: &'static str,
    pub store: DashMap<String, String>,
    fail_next: AtomicU32,
    failure_message: &'static str,
}

impl MemoryKv {
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            store: DashMap::new(),
            fail_next: AtomicU32::new(0),
            failure_message: "free usage limit exceeded",
        })
    }

    pub fn fail_next_n(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> Option<RelayError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            Some(RelayError::QuotaExhausted(self.failure_message.to_string()))
        } else {
            None
        }
    }
}

#[async_trait]
impl KvProvider for MemoryKv {
    fn name(&self) -> &str {
        self.label
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        Ok(self.store.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &str, _ttl: Option<Duration>) -> Result<()> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        self.store.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        self.store.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        Ok(self
            .store
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}

pub fn cache_on(kv: &Arc<MemoryKv>) -> Arc<CacheService> {
    Arc::new(CacheService::new(
        Arc::clone(kv) as Arc<dyn KvProvider>,
        None,
        CacheTierConfig {
            ttl_jitter_ratio: 0.0,
            ..CacheTierConfig::default()
        },
    ))
}

pub fn test_coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        heartbeat_interval: Duration::from_millis(50),
        instance_timeout: Duration::from_millis(150),
        lock_backoff_ms: vec![1, 2],
        active_set_cache_ttl: Duration::ZERO,
        ..CoordinatorConfig::default()
    }
}

pub fn coordinator_on(kv: &Arc<MemoryKv>) -> Arc<InstanceCoordinator> {
    Arc::new(InstanceCoordinator::new(
        cache_on(kv),
        test_coordinator_config(),
        "http://localhost:8080".to_string(),
        "test".to_string(),
    ))
}
