// State Synchronizer
//
// Per-(user, type) state with cross-instance convergence. The authoritative
// mirror lives under `state:<user>:<type>`; each peer publishes its own view
// under `sync:<user>:<type>:<instance>`. Synchronization merges snapshots by
// latest timestamp (ties keep local), writes the winner back, and broadcasts
// a state-change event. Subscribers are isolated: one failing callback never
// starves the rest.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use super::coordinator::InstanceCoordinator;
use crate::cache::{CacheReadOptions, CacheService, CacheWriteOptions};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::queue::{EventPublisher, TOPIC_STATE_SYNC};

pub const STATE_PREFIX: &str = "state:";
pub const SYNC_PREFIX: &str = "sync:";
pub const ACTIVE_USERS_KEY: &str = "active_users";

/// Synthetic user owning system-wide state such as task mirrors.
pub const SYSTEM_USER: &str = "system";

/// State types swept by the periodic sync loop.
pub const WELL_KNOWN_STATE_TYPES: &[&str] = &["session", "preferences", "progress"];

/// A versioned state value. The timestamp is the merge version: latest wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub value: Value,
    /// Milliseconds since the epoch
    pub timestamp: i64,
}

impl StateRecord {
    pub fn now(value: Value) -> Self {
        Self {
            value,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Inbound/outbound state-change event on the `state_sync` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub user_id: String,
    pub state_type: String,
    pub state: StateRecord,
    pub source: String,
}

type Callback = Arc<dyn Fn(&str, &StateRecord, &SyncEvent) -> Result<()> + Send + Sync>;

struct Subscription {
    id: String,
    state_type: String,
    callback: Callback,
}

pub struct StateSynchronizer {
    cache: Arc<CacheService>,
    coordinator: Arc<InstanceCoordinator>,
    publisher: Arc<dyn EventPublisher>,
    config: SyncConfig,
    subscriptions: Mutex<Vec<Subscription>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StateSynchronizer {
    pub fn new(
        cache: Arc<CacheService>,
        coordinator: Arc<InstanceCoordinator>,
        publisher: Arc<dyn EventPublisher>,
        config: SyncConfig,
    ) -> Self {
        Self {
            cache,
            coordinator,
            publisher,
            config,
            subscriptions: Mutex::new(Vec::new()),
            stop_tx: Mutex::new(None),
            loop_handle: Mutex::new(None),
        }
    }

    fn state_key(user_id: &str, state_type: &str) -> String {
        format!("{}{}:{}", STATE_PREFIX, user_id, state_type)
    }

    fn sync_key(user_id: &str, state_type: &str, instance_id: &str) -> String {
        format!("{}{}:{}:{}", SYNC_PREFIX, user_id, state_type, instance_id)
    }

    /// Start the periodic sync loop. The inbound side is wired by the API
    /// layer, which routes `state_sync` deliveries to `handle_sync_event`.
    pub fn start(self: Arc<Self>) {
        let mut stop_slot = self.stop_tx.lock();
        if stop_slot.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *stop_slot = Some(tx);
        drop(stop_slot);

        let synchronizer = Arc::clone(&self);
        let interval = self.config.sync_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        synchronizer.sync_all_known_users().await;
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.loop_handle.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(true);
        }
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn sync_all_known_users(&self) {
        let users: Vec<String> = match self
            .cache
            .get_json::<Vec<String>>(ACTIVE_USERS_KEY, &CacheReadOptions::default())
            .await
        {
            Ok(Some(users)) => users,
            Ok(None) => return,
            Err(e) => {
                debug!("Active-user list read failed: {}", e);
                return;
            }
        };

        for user_id in users {
            for state_type in WELL_KNOWN_STATE_TYPES {
                match self.sync_user_state(&user_id, state_type).await {
                    Ok(_) => {}
                    Err(e) => debug!("Periodic sync for {}:{} failed: {}", user_id, state_type, e),
                }
            }
        }
    }

    /// Merge this user's state across peers under a sync lock. Returns false
    /// when the lock is contended or any step fails.
    pub async fn sync_user_state(&self, user_id: &str, state_type: &str) -> Result<bool> {
        let lock_name = format!("sync_state:{}:{}", user_id, state_type);
        if !self
            .coordinator
            .acquire_lock(&lock_name, self.config.sync_lock_ttl, None)
            .await?
        {
            return Ok(false);
        }

        let outcome = self.merge_and_publish(user_id, state_type).await;

        if let Err(e) = self.coordinator.release_lock(&lock_name).await {
            warn!("Failed to release {}: {}", lock_name, e);
        }

        match outcome {
            Ok(merged) => Ok(merged),
            Err(e) => {
                warn!("State sync for {}:{} failed: {}", user_id, state_type, e);
                Ok(false)
            }
        }
    }

    async fn merge_and_publish(&self, user_id: &str, state_type: &str) -> Result<bool> {
        let read_opts = CacheReadOptions {
            skip_l1: true,
            ..CacheReadOptions::default()
        };

        let local: Option<StateRecord> = self
            .cache
            .get_json(&Self::state_key(user_id, state_type), &read_opts)
            .await?;

        let peers = self.coordinator.get_active_instances().await?;
        let mut best = local.clone();
        for peer in &peers {
            if peer.id == self.coordinator.instance_id() {
                continue;
            }
            let snapshot: Option<StateRecord> = self
                .cache
                .get_json(&Self::sync_key(user_id, state_type, &peer.id), &read_opts)
                .await?;
            if let Some(snapshot) = snapshot {
                // Strictly newer wins; a tie keeps the local value.
                let newer = match best {
                    Some(ref current) => snapshot.timestamp > current.timestamp,
                    None => true,
                };
                if newer {
                    best = Some(snapshot);
                }
            }
        }

        let Some(merged) = best else {
            return Ok(false);
        };

        let changed = match local {
            Some(ref local) => local.timestamp != merged.timestamp,
            None => true,
        };
        if !changed {
            return Ok(true);
        }

        self.write_state(user_id, state_type, &merged).await?;
        self.broadcast(user_id, state_type, merged).await;
        Ok(true)
    }

    async fn write_state(&self, user_id: &str, state_type: &str, record: &StateRecord) -> Result<()> {
        self.cache
            .set_json(
                &Self::state_key(user_id, state_type),
                record,
                None,
                &CacheWriteOptions::default(),
            )
            .await
    }

    async fn broadcast(&self, user_id: &str, state_type: &str, state: StateRecord) {
        let event = SyncEvent {
            user_id: user_id.to_string(),
            state_type: state_type.to_string(),
            state,
            source: self.coordinator.instance_id().to_string(),
        };
        match serde_json::to_value(&event) {
            Ok(message) => {
                if let Err(e) = self.publisher.publish_event(TOPIC_STATE_SYNC, message).await {
                    warn!("State-change broadcast failed: {}", e);
                }
            }
            Err(e) => warn!("State-change event serialization failed: {}", e),
        }
    }

    /// Publish a local state change: a `state_change` event plus this
    /// instance's sync snapshot for later merging.
    pub async fn publish_state_change(
        &self,
        user_id: &str,
        state_type: &str,
        state: Value,
    ) -> Result<()> {
        let record = StateRecord::now(state);

        self.cache
            .set_json(
                &Self::sync_key(user_id, state_type, self.coordinator.instance_id()),
                &record,
                Some(self.config.state_snapshot_ttl),
                &CacheWriteOptions {
                    skip_l1: true,
                    ..CacheWriteOptions::default()
                },
            )
            .await?;

        self.broadcast(user_id, state_type, record).await;
        Ok(())
    }

    /// Register a callback for inbound state changes of one type.
    pub fn subscribe<F>(&self, state_type: &str, callback: F) -> String
    where
        F: Fn(&str, &StateRecord, &SyncEvent) -> Result<()> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4().to_string();
        self.subscriptions.lock().push(Subscription {
            id: id.clone(),
            state_type: state_type.to_string(),
            callback: Arc::new(callback),
        });
        id
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != subscription_id);
        subscriptions.len() != before
    }

    /// Apply an inbound peer event: refresh the local mirror and dispatch to
    /// subscribers. Callback failures are logged and isolated.
    pub fn handle_sync_event(&self, event: &SyncEvent) {
        if event.source == self.coordinator.instance_id() {
            return;
        }

        self.cache.l1().set(
            &Self::state_key(&event.user_id, &event.state_type),
            match serde_json::to_value(&event.state) {
                Ok(value) => value,
                Err(e) => {
                    warn!("State event serialization failed: {}", e);
                    return;
                }
            },
            Duration::from_secs(60),
        );

        let callbacks: Vec<Callback> = {
            let subscriptions = self.subscriptions.lock();
            subscriptions
                .iter()
                .filter(|s| s.state_type == event.state_type)
                .map(|s| Arc::clone(&s.callback))
                .collect()
        };

        for callback in callbacks {
            if let Err(e) = callback(&event.user_id, &event.state, event) {
                warn!(
                    "Subscriber for {} failed on {}: {}",
                    event.state_type, event.user_id, e
                );
            }
        }
    }

    /// L1 → L2 → None.
    pub async fn get_state_snapshot(
        &self,
        user_id: &str,
        state_type: &str,
    ) -> Result<Option<StateRecord>> {
        self.cache
            .get_json(
                &Self::state_key(user_id, state_type),
                &CacheReadOptions::default(),
            )
            .await
    }

    /// Write a snapshot to both tiers and notify peers.
    pub async fn restore_state_snapshot(
        &self,
        user_id: &str,
        state_type: &str,
        snapshot: StateRecord,
    ) -> Result<()> {
        self.write_state(user_id, state_type, &snapshot).await?;
        self.broadcast(user_id, state_type, snapshot).await;
        Ok(())
    }

    pub async fn get_task_state(&self, task_id: &str) -> Result<Option<StateRecord>> {
        self.get_state_snapshot(SYSTEM_USER, &format!("task:{}", task_id))
            .await
    }

    pub async fn update_task_state(&self, task_id: &str, state: Value) -> Result<()> {
        let state_type = format!("task:{}", task_id);
        let record = StateRecord::now(state);
        self.write_state(SYSTEM_USER, &state_type, &record).await?;
        self.broadcast(SYSTEM_USER, &state_type, record).await;
        Ok(())
    }

    pub async fn clear_task_state(&self, task_id: &str) -> Result<()> {
        self.cache
            .delete(&Self::state_key(SYSTEM_USER, &format!("task:{}", task_id)))
            .await
    }
}
