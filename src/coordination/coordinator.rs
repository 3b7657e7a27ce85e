// Instance Coordinator
//
// Instance registry, heartbeat, leader election, and distributed locks over
// the shared KV store:
// - Every process registers one instance record and refreshes it on a
//   heartbeat; records older than the instance timeout are dead.
// - The leader is the active instance with the smallest id. Leadership is
//   deterministic; no ballots, no terms.
// - Locks are KV records with owner, acquisition time, and TTL. A lock whose
//   owner's instance record is gone may be preempted. Acquisition re-reads
//   after writing to compensate for the store's eventual consistency.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheReadOptions, CacheService, CacheWriteOptions};
use crate::config::CoordinatorConfig;
use crate::error::{RelayError, Result};

pub const INSTANCE_PREFIX: &str = "instance:";
pub const LOCK_PREFIX: &str = "lock:";

/// Instance liveness status as recorded in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Active,
    Inactive,
}

/// One running process, as seen by its peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub url: String,
    pub hostname: String,
    pub region: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: InstanceStatus,
}

impl InstanceRecord {
    /// Whether the record is live relative to `timeout`.
    pub fn is_live(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        if self.status != InstanceStatus::Active {
            return false;
        }
        let age = now.signed_duration_since(self.last_heartbeat);
        age < chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX)
    }
}

/// Distributed lock record stored under `lock:<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub instance_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.acquired_at);
        age >= chrono::Duration::seconds(self.ttl_secs as i64)
    }
}

struct ActiveSetSnapshot {
    taken_at: Instant,
    instances: Vec<InstanceRecord>,
}

/// Per-process coordination handle. One per process; the id is stable for
/// the process lifetime.
pub struct InstanceCoordinator {
    instance_id: String,
    url: String,
    hostname: String,
    region: String,
    started_at: DateTime<Utc>,
    cache: Arc<CacheService>,
    config: CoordinatorConfig,
    active_set: Mutex<Option<ActiveSetSnapshot>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    loop_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl InstanceCoordinator {
    pub fn new(cache: Arc<CacheService>, config: CoordinatorConfig, url: String, region: String) -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        Self {
            instance_id: Uuid::new_v4().to_string(),
            url,
            hostname,
            region,
            started_at: Utc::now(),
            cache,
            config,
            active_set: Mutex::new(None),
            stop_tx: Mutex::new(None),
            loop_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn instance_key(id: &str) -> String {
        format!("{}{}", INSTANCE_PREFIX, id)
    }

    fn lock_key(name: &str) -> String {
        format!("{}{}", LOCK_PREFIX, name)
    }

    fn own_record(&self) -> InstanceRecord {
        InstanceRecord {
            id: self.instance_id.clone(),
            url: self.url.clone(),
            hostname: self.hostname.clone(),
            region: self.region.clone(),
            started_at: self.started_at,
            last_heartbeat: Utc::now(),
            status: InstanceStatus::Active,
        }
    }

    /// Bypass L1 for coordination reads; a stale local copy must never win.
    fn kv_read_opts() -> CacheReadOptions {
        CacheReadOptions {
            skip_l1: true,
            ..CacheReadOptions::default()
        }
    }

    fn kv_write_opts() -> CacheWriteOptions {
        CacheWriteOptions {
            skip_l1: true,
            skip_ttl_randomization: true,
            ..CacheWriteOptions::default()
        }
    }

    /// Register this instance and start the heartbeat and leader-watch loops.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.register().await?;

        let mut stop_slot = self.stop_tx.lock();
        if stop_slot.is_some() {
            return Ok(());
        }
        let (tx, rx) = watch::channel(false);
        *stop_slot = Some(tx);
        drop(stop_slot);

        let heartbeat = {
            let coordinator = Arc::clone(&self);
            let mut rx = rx.clone();
            let interval = self.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = coordinator.heartbeat().await {
                                warn!("Heartbeat failed: {}", e);
                            }
                        }
                        _ = rx.changed() => {
                            if *rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        let watchdog = {
            let coordinator = Arc::clone(&self);
            let mut rx = rx;
            let interval = self.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match coordinator.is_leader().await {
                                Ok(true) => {
                                    if let Err(e) = coordinator.cleanup_stale_instances().await {
                                        warn!("Stale-instance cleanup failed: {}", e);
                                    }
                                }
                                Ok(false) => {}
                                Err(e) => debug!("Leader check failed: {}", e),
                            }
                        }
                        _ = rx.changed() => {
                            if *rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        self.loop_handles.lock().extend([heartbeat, watchdog]);
        info!(instance_id = %self.instance_id, "Instance coordinator started");
        Ok(())
    }

    /// Stop background loops and delete the instance record.
    pub async fn stop(&self) -> Result<()> {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(true);
        }
        let handles: Vec<_> = self.loop_handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.cache
            .delete(&Self::instance_key(&self.instance_id))
            .await?;
        info!(instance_id = %self.instance_id, "Instance coordinator stopped");
        Ok(())
    }

    async fn register(&self) -> Result<()> {
        self.cache
            .set_json(
                &Self::instance_key(&self.instance_id),
                &self.own_record(),
                Some(self.config.instance_timeout),
                &Self::kv_write_opts(),
            )
            .await
    }

    /// Refresh the own instance record; re-register if it vanished.
    pub async fn heartbeat(&self) -> Result<()> {
        let key = Self::instance_key(&self.instance_id);
        let existing: Option<InstanceRecord> =
            self.cache.get_json(&key, &Self::kv_read_opts()).await?;

        match existing {
            None => {
                warn!(instance_id = %self.instance_id, "Own instance record missing; re-registering");
                self.register().await
            }
            Some(mut record) => {
                record.last_heartbeat = Utc::now();
                record.status = InstanceStatus::Active;
                self.cache
                    .set_json(
                        &key,
                        &record,
                        Some(self.config.instance_timeout),
                        &Self::kv_write_opts(),
                    )
                    .await
            }
        }
    }

    /// The current active set: registered instances with a fresh heartbeat.
    /// Served from a brief local snapshot between store reads.
    pub async fn get_active_instances(&self) -> Result<Vec<InstanceRecord>> {
        {
            let snapshot = self.active_set.lock();
            if let Some(s) = snapshot.as_ref() {
                if s.taken_at.elapsed() < self.config.active_set_cache_ttl {
                    return Ok(s.instances.clone());
                }
            }
        }

        let keys = self.cache.list_keys(INSTANCE_PREFIX).await?;
        let now = Utc::now();
        let mut instances = Vec::new();
        for key in keys {
            let record: Option<InstanceRecord> =
                self.cache.get_json(&key, &Self::kv_read_opts()).await?;
            if let Some(record) = record {
                if record.is_live(self.config.instance_timeout, now) {
                    instances.push(record);
                }
            }
        }
        instances.sort_by(|a, b| a.id.cmp(&b.id));

        *self.active_set.lock() = Some(ActiveSetSnapshot {
            taken_at: Instant::now(),
            instances: instances.clone(),
        });
        Ok(instances)
    }

    /// Deterministic election: smallest id among the active set.
    pub async fn get_leader_id(&self) -> Result<Option<String>> {
        let instances = self.get_active_instances().await?;
        Ok(instances.first().map(|record| record.id.clone()))
    }

    pub async fn is_leader(&self) -> Result<bool> {
        Ok(self.get_leader_id().await?.as_deref() == Some(self.instance_id.as_str()))
    }

    /// Acquire a named lock, retrying with backoff up to `max_attempts`
    /// (defaults to the configured cap). Returns false when the lock is held
    /// by another live instance after all attempts.
    pub async fn acquire_lock(
        &self,
        name: &str,
        ttl: Duration,
        max_attempts: Option<usize>,
    ) -> Result<bool> {
        let attempts = max_attempts.unwrap_or(self.config.lock_max_attempts).max(1);

        for attempt in 0..attempts {
            match self.try_acquire_once(name, ttl).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    debug!("Lock {} attempt {} errored: {}", name, attempt + 1, e);
                }
            }

            if attempt + 1 < attempts {
                let idx = attempt.min(self.config.lock_backoff_ms.len() - 1);
                tokio::time::sleep(Duration::from_millis(self.config.lock_backoff_ms[idx])).await;
            }
        }
        Ok(false)
    }

    async fn try_acquire_once(&self, name: &str, ttl: Duration) -> Result<bool> {
        let key = Self::lock_key(name);
        let now = Utc::now();

        let existing: Option<LockRecord> =
            self.cache.get_json(&key, &Self::kv_read_opts()).await?;

        if let Some(record) = existing {
            if record.instance_id != self.instance_id && !record.is_expired(now) {
                // Preemption is allowed only when the owner is gone.
                let owner_key = Self::instance_key(&record.instance_id);
                let owner: Option<InstanceRecord> =
                    self.cache.get_json(&owner_key, &Self::kv_read_opts()).await?;
                if owner.is_some() {
                    return Ok(false);
                }
                info!(
                    "Preempting lock {} held by absent instance {}",
                    name, record.instance_id
                );
            }
        }

        let record = LockRecord {
            instance_id: self.instance_id.clone(),
            acquired_at: now,
            ttl_secs: ttl.as_secs(),
        };
        self.cache
            .set_json(&key, &record, Some(ttl), &Self::kv_write_opts())
            .await?;

        // The store is eventually consistent: verify the write landed as ours.
        let verify: Option<LockRecord> =
            self.cache.get_json(&key, &Self::kv_read_opts()).await?;
        Ok(verify.map(|r| r.instance_id == self.instance_id).unwrap_or(false))
    }

    /// Release a lock this instance owns. Releasing someone else's lock, or
    /// an absent one, is a no-op; never blind-delete.
    pub async fn release_lock(&self, name: &str) -> Result<()> {
        let key = Self::lock_key(name);
        let existing: Option<LockRecord> =
            self.cache.get_json(&key, &Self::kv_read_opts()).await?;

        match existing {
            Some(record) if record.instance_id == self.instance_id => {
                self.cache.delete(&key).await
            }
            _ => Ok(()),
        }
    }

    /// Whether a fresh read shows this instance as the owner. A transient KV
    /// failure surfaces as an error, never as lock loss.
    pub async fn has_lock(&self, name: &str) -> Result<bool> {
        let key = Self::lock_key(name);
        let record: Option<LockRecord> =
            self.cache.get_json(&key, &Self::kv_read_opts()).await?;
        Ok(record
            .map(|r| r.instance_id == self.instance_id && !r.is_expired(Utc::now()))
            .unwrap_or(false))
    }

    pub async fn acquire_task_lock(&self, task_id: &str) -> Result<bool> {
        self.acquire_lock(&format!("task:{}", task_id), self.config.task_lock_ttl, None)
            .await
    }

    pub async fn release_task_lock(&self, task_id: &str) -> Result<()> {
        self.release_lock(&format!("task:{}", task_id)).await
    }

    /// Leader duty: delete instance records stale past twice the timeout.
    pub async fn cleanup_stale_instances(&self) -> Result<usize> {
        let keys = self.cache.list_keys(INSTANCE_PREFIX).await?;
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(self.config.instance_timeout * 2)
            .unwrap_or(chrono::Duration::MAX);

        let mut removed = 0;
        for key in keys {
            let record: Option<InstanceRecord> =
                self.cache.get_json(&key, &Self::kv_read_opts()).await?;
            if let Some(record) = record {
                if now.signed_duration_since(record.last_heartbeat) > cutoff {
                    info!("Removing stale instance record {}", record.id);
                    self.cache.delete(&key).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Instances whose record exists but whose heartbeat is past the timeout.
    pub async fn detect_dead_instances(&self) -> Result<Vec<String>> {
        let keys = self.cache.list_keys(INSTANCE_PREFIX).await?;
        let now = Utc::now();
        let mut dead = Vec::new();
        for key in keys {
            let record: Option<InstanceRecord> =
                self.cache.get_json(&key, &Self::kv_read_opts()).await?;
            if let Some(record) = record {
                if !record.is_live(self.config.instance_timeout, now) {
                    dead.push(record.id);
                }
            }
        }
        Ok(dead)
    }

    /// Reassign a task-state mirror owned by a dead instance. The record's
    /// owner and heartbeat are rewritten so a live instance can pick it up.
    pub async fn recover_orphaned_task(&self, task_key: &str, new_instance_id: &str) -> Result<bool> {
        let key = format!("state:system:task:{}", task_key);
        let existing = self.cache.get(&key, &Self::kv_read_opts()).await?;

        let Some(mut value) = existing else {
            return Ok(false);
        };
        let Some(object) = value.as_object_mut() else {
            return Err(RelayError::InvalidState(format!(
                "Task state {} is not an object",
                task_key
            )));
        };

        object.insert(
            "instanceId".to_string(),
            serde_json::Value::String(new_instance_id.to_string()),
        );
        object.insert(
            "heartbeat".to_string(),
            serde_json::json!(Utc::now().timestamp_millis()),
        );

        self.cache
            .set(&key, &value, None, &Self::kv_write_opts())
            .await?;
        info!(
            "Recovered orphaned task {} for instance {}",
            task_key, new_instance_id
        );
        Ok(true)
    }
}
