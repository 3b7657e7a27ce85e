// Consistent Cache
//
// Lock-protected write-through under the `consistent:` prefix. Every
// mutation appends a change-log entry and broadcasts a change event so peers
// converge; the change log doubles as the replay source for per-user
// recovery. Broadcasts and log writes are best-effort: a failure is logged,
// never surfaced.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::coordinator::InstanceCoordinator;
use crate::cache::{CacheReadOptions, CacheService, CacheWriteOptions};
use crate::error::Result;
use crate::queue::{EventPublisher, TOPIC_CACHE_SYNC};

pub const CONSISTENT_PREFIX: &str = "consistent:";
pub const CHANGE_LOG_PREFIX: &str = "change_log:";

const WRITE_LOCK_TTL: Duration = Duration::from_secs(30);
const L1_TTL: Duration = Duration::from_secs(60);
const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const CHANGE_LOG_TTL: Duration = Duration::from_secs(86_400);

/// One recorded mutation, retained for recovery replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub instance_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Set,
    Delete,
}

/// Change event broadcast to peers after a local mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheChangeEvent {
    pub kind: ChangeKind,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub timestamp: i64,
    pub source: String,
}

/// Options for consistent writes.
#[derive(Debug, Clone, Default)]
pub struct ConsistentWriteOptions {
    pub ttl: Option<Duration>,
    /// When set, the write runs under `cache_write:<lock_key>`
    pub lock_key: Option<String>,
    /// Attributes the change-log entry to a user for later replay
    pub user_id: Option<String>,
}

/// A single operation inside a `batch` call.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    Set {
        key: String,
        value: Value,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
}

pub struct ConsistentCache {
    cache: Arc<CacheService>,
    coordinator: Arc<InstanceCoordinator>,
    publisher: Arc<dyn EventPublisher>,
}

impl ConsistentCache {
    pub fn new(
        cache: Arc<CacheService>,
        coordinator: Arc<InstanceCoordinator>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            cache,
            coordinator,
            publisher,
        }
    }

    fn full_key(key: &str) -> String {
        format!("{}{}", CONSISTENT_PREFIX, key)
    }

    /// Write a value. Returns false when the write lock could not be taken.
    pub async fn set(&self, key: &str, value: Value, opts: &ConsistentWriteOptions) -> Result<bool> {
        let lock_name = opts.lock_key.as_ref().map(|k| format!("cache_write:{}", k));
        if let Some(ref lock_name) = lock_name {
            if !self
                .coordinator
                .acquire_lock(lock_name, WRITE_LOCK_TTL, None)
                .await?
            {
                return Ok(false);
            }
        }

        let result = self.apply_set(key, &value, opts).await;

        if let Some(ref lock_name) = lock_name {
            if let Err(e) = self.coordinator.release_lock(lock_name).await {
                warn!("Failed to release {}: {}", lock_name, e);
            }
        }

        result.map(|_| true)
    }

    async fn apply_set(&self, key: &str, value: &Value, opts: &ConsistentWriteOptions) -> Result<()> {
        let ttl = opts.ttl.unwrap_or(DEFAULT_TTL);
        self.cache
            .set(
                &Self::full_key(key),
                value,
                Some(ttl),
                &CacheWriteOptions {
                    cache_ttl: Some(ttl.min(L1_TTL).max(Duration::from_secs(1))),
                    ..CacheWriteOptions::default()
                },
            )
            .await?;

        self.append_change_log(ChangeKind::Set, key, Some(value.clone()), opts.user_id.clone())
            .await;
        self.broadcast_change(ChangeKind::Set, key, Some(value.clone()))
            .await;
        Ok(())
    }

    /// Read a value. `skip_cache` bypasses L1 and reads L2 directly.
    pub async fn get(&self, key: &str, skip_cache: bool) -> Result<Option<Value>> {
        self.cache
            .get(
                &Self::full_key(key),
                &CacheReadOptions {
                    skip_l1: skip_cache,
                    cache_ttl: Some(L1_TTL),
                },
            )
            .await
    }

    /// Delete a value, symmetric to `set`.
    pub async fn delete(&self, key: &str, opts: &ConsistentWriteOptions) -> Result<bool> {
        let lock_name = opts.lock_key.as_ref().map(|k| format!("cache_write:{}", k));
        if let Some(ref lock_name) = lock_name {
            if !self
                .coordinator
                .acquire_lock(lock_name, WRITE_LOCK_TTL, None)
                .await?
            {
                return Ok(false);
            }
        }

        let result = self.cache.delete(&Self::full_key(key)).await;
        if result.is_ok() {
            self.append_change_log(ChangeKind::Delete, key, None, opts.user_id.clone())
                .await;
            self.broadcast_change(ChangeKind::Delete, key, None).await;
        }

        if let Some(ref lock_name) = lock_name {
            if let Err(e) = self.coordinator.release_lock(lock_name).await {
                warn!("Failed to release {}: {}", lock_name, e);
            }
        }

        result.map(|_| true)
    }

    /// Apply a sequence of operations under one coarse lock. Returns false
    /// when the lock is unavailable or any operation fails.
    pub async fn batch(&self, operations: Vec<BatchOperation>) -> Result<bool> {
        let lock_name = format!("cache_batch:{}", Utc::now().timestamp_millis());
        if !self
            .coordinator
            .acquire_lock(&lock_name, WRITE_LOCK_TTL, None)
            .await?
        {
            return Ok(false);
        }

        let mut ok = true;
        for operation in operations {
            let result = match operation {
                BatchOperation::Set { key, value, ttl } => {
                    self.apply_set(
                        &key,
                        &value,
                        &ConsistentWriteOptions {
                            ttl,
                            ..ConsistentWriteOptions::default()
                        },
                    )
                    .await
                }
                BatchOperation::Delete { key } => {
                    let result = self.cache.delete(&Self::full_key(&key)).await;
                    if result.is_ok() {
                        self.append_change_log(ChangeKind::Delete, &key, None, None).await;
                        self.broadcast_change(ChangeKind::Delete, &key, None).await;
                    }
                    result
                }
            };
            if let Err(e) = result {
                warn!("Batch operation failed: {}", e);
                ok = false;
                break;
            }
        }

        if let Err(e) = self.coordinator.release_lock(&lock_name).await {
            warn!("Failed to release {}: {}", lock_name, e);
        }
        Ok(ok)
    }

    /// Apply a peer's change event to the local L1 only. Events originating
    /// from this instance are ignored.
    pub fn handle_sync_event(&self, event: &CacheChangeEvent) {
        if event.source == self.coordinator.instance_id() {
            return;
        }
        let key = Self::full_key(&event.key);
        match event.kind {
            ChangeKind::Set => {
                if let Some(ref value) = event.value {
                    self.cache.l1().set(&key, value.clone(), L1_TTL);
                }
            }
            ChangeKind::Delete => self.cache.l1().delete(&key),
        }
    }

    /// Replay a user's change log against L2 in timestamp order, then drop
    /// L1 so subsequent reads see the restored values.
    pub async fn restore_consistency(&self, user_id: &str) -> Result<usize> {
        let keys = self.cache.list_keys(CHANGE_LOG_PREFIX).await?;
        let read_opts = CacheReadOptions {
            skip_l1: true,
            ..CacheReadOptions::default()
        };

        let mut entries: Vec<ChangeLogEntry> = Vec::new();
        for key in keys {
            if let Some(entry) = self
                .cache
                .get_json::<ChangeLogEntry>(&key, &read_opts)
                .await?
            {
                if entry.user_id.as_deref() == Some(user_id) {
                    entries.push(entry);
                }
            }
        }
        entries.sort_by_key(|entry| entry.timestamp);

        let write_opts = CacheWriteOptions {
            skip_l1: true,
            ..CacheWriteOptions::default()
        };
        let replayed = entries.len();
        for entry in entries {
            let key = Self::full_key(&entry.key);
            match entry.kind {
                ChangeKind::Set => {
                    if let Some(value) = entry.value {
                        self.cache
                            .set(&key, &value, Some(DEFAULT_TTL), &write_opts)
                            .await?;
                    }
                }
                ChangeKind::Delete => {
                    self.cache.delete(&key).await?;
                }
            }
        }

        self.cache.l1().clear();
        debug!("Replayed {} change-log entries for user {}", replayed, user_id);
        Ok(replayed)
    }

    async fn append_change_log(
        &self,
        kind: ChangeKind,
        key: &str,
        value: Option<Value>,
        user_id: Option<String>,
    ) {
        let timestamp = Utc::now().timestamp_millis();
        let entry = ChangeLogEntry {
            kind,
            key: key.to_string(),
            value,
            user_id,
            timestamp,
            instance_id: self.coordinator.instance_id().to_string(),
        };
        let log_key = format!("{}{}:{}", CHANGE_LOG_PREFIX, timestamp, key);
        if let Err(e) = self
            .cache
            .set_json(
                &log_key,
                &entry,
                Some(CHANGE_LOG_TTL),
                &CacheWriteOptions {
                    skip_l1: true,
                    ..CacheWriteOptions::default()
                },
            )
            .await
        {
            warn!("Change-log append for {} failed: {}", key, e);
        }
    }

    async fn broadcast_change(&self, kind: ChangeKind, key: &str, value: Option<Value>) {
        let event = CacheChangeEvent {
            kind,
            key: key.to_string(),
            value,
            timestamp: Utc::now().timestamp_millis(),
            source: self.coordinator.instance_id().to_string(),
        };
        match serde_json::to_value(&event) {
            Ok(message) => {
                if let Err(e) = self.publisher.publish_event(TOPIC_CACHE_SYNC, message).await {
                    warn!("Cache-change broadcast for {} failed: {}", key, e);
                }
            }
            Err(e) => warn!("Cache-change event serialization failed: {}", e),
        }
    }
}
