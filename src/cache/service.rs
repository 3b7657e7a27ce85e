// # Cache Service
//
// L1 + L2 composition with write-through, write suppression, and sticky
// two-provider fail-over:
// - Read path: L1 hit wins; an L2 hit repopulates L1 under the TTL cap.
// - Write path: a structurally-unchanged, unexpired L1 entry suppresses the
//   L2 write entirely. A failed L2 write still leaves a defensive L1 entry.
// - Fail-over: retryable L2 errors (quota, rate limit, network) count toward
//   a threshold; at the threshold the service flips to the fallback provider
//   once, zeroes the counter, and retries the failed operation. Successes do
//   not reset the counter; only the flip or the recovery probe does.
// - Recovery probe: a periodic health-key read against the primary; on
//   success the service switches back and zeroes the counter.

use parking_lot::Mutex;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::local::LocalCache;
use super::provider::KvProvider;
use super::HEALTH_PROBE_KEY;
use crate::config::CacheTierConfig;
use crate::error::{RelayError, Result};

/// Read-path options. Every field is explicit; defaults match the common path.
#[derive(Debug, Clone, Default)]
pub struct CacheReadOptions {
    /// Bypass L1 entirely (used for lock reads that must see L2)
    pub skip_l1: bool,
    /// TTL used when repopulating L1 from an L2 hit
    pub cache_ttl: Option<Duration>,
}

/// Write-path options.
#[derive(Debug, Clone, Default)]
pub struct CacheWriteOptions {
    /// Do not touch L1
    pub skip_l1: bool,
    /// Skip the cache write entirely
    pub skip_cache: bool,
    /// Override the TTL for this write
    pub cache_ttl: Option<Duration>,
    /// Suppress the random TTL jitter applied to L2 writes
    pub skip_ttl_randomization: bool,
}

/// Snapshot of the fail-over state machine, for status surfaces and tests.
#[derive(Debug, Clone)]
pub struct FailoverStatus {
    pub provider: String,
    pub failure_count: u32,
    pub in_failover: bool,
}

struct FailoverState {
    /// Index into the provider list; 0 is the primary
    active: usize,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Two-tier cache service.
pub struct CacheService {
    l1: LocalCache,
    providers: Vec<Arc<dyn KvProvider>>,
    config: CacheTierConfig,
    state: Mutex<FailoverState>,
    probe_stop: Mutex<Option<watch::Sender<bool>>>,
    probe_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CacheService {
    pub fn new(
        primary: Arc<dyn KvProvider>,
        fallback: Option<Arc<dyn KvProvider>>,
        config: CacheTierConfig,
    ) -> Self {
        let mut providers = vec![primary];
        if let Some(fallback) = fallback {
            providers.push(fallback);
        }
        Self {
            l1: LocalCache::new(),
            providers,
            config,
            state: Mutex::new(FailoverState {
                active: 0,
                failure_count: 0,
                last_failure: None,
            }),
            probe_stop: Mutex::new(None),
            probe_handle: Mutex::new(None),
        }
    }

    /// Start background work (the recovery probe). Idempotent.
    pub fn initialize(self: Arc<Self>) {
        if self.providers.len() < 2 {
            return;
        }
        let mut stop_slot = self.probe_stop.lock();
        if stop_slot.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *stop_slot = Some(tx);

        let service = Arc::clone(&self);
        let interval = self.config.recovery_probe_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        service.probe_primary_once().await;
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.probe_handle.lock() = Some(handle);
    }

    /// Stop background work and disconnect providers.
    pub async fn destroy(&self) {
        if let Some(tx) = self.probe_stop.lock().take() {
            let _ = tx.send(true);
        }
        let handle = self.probe_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        for provider in &self.providers {
            if let Err(e) = provider.disconnect().await {
                warn!("Provider {} disconnect failed: {}", provider.name(), e);
            }
        }
    }

    /// One recovery-probe cycle: if failed over, read the health key against
    /// the primary and switch back on success. Returns whether a switch-back
    /// happened.
    pub async fn probe_primary_once(&self) -> bool {
        {
            let state = self.state.lock();
            if state.active == 0 {
                return false;
            }
        }
        match self.providers[0].get(HEALTH_PROBE_KEY).await {
            Ok(_) => {
                let mut state = self.state.lock();
                state.active = 0;
                state.failure_count = 0;
                state.last_failure = None;
                info!(
                    "Primary provider {} healthy again; switching back",
                    self.providers[0].name()
                );
                true
            }
            Err(e) => {
                debug!("Recovery probe against primary failed: {}", e);
                false
            }
        }
    }

    /// Name of the provider currently serving L2 traffic.
    pub fn current_provider(&self) -> String {
        self.active_provider().name().to_string()
    }

    /// Informational: whether the active provider differs from the
    /// configured preferred one. A provider pinned by configuration is not
    /// fail-over, even if it is the fallback.
    pub fn is_failover_mode(&self) -> bool {
        self.current_provider() != self.config.preferred_provider
    }

    pub fn failover_status(&self) -> FailoverStatus {
        let state = self.state.lock();
        FailoverStatus {
            provider: self.providers[state.active].name().to_string(),
            failure_count: state.failure_count,
            in_failover: self.providers[state.active].name() != self.config.preferred_provider,
        }
    }

    /// Direct L1 access for components that manage their own L2 layout.
    pub fn l1(&self) -> &LocalCache {
        &self.l1
    }

    /// Read a key. L1 unless `skip_l1`; an L2 hit repopulates L1.
    pub async fn get(&self, key: &str, opts: &CacheReadOptions) -> Result<Option<Value>> {
        if !opts.skip_l1 {
            if let Some(value) = self.l1.get(key) {
                return Ok(Some(value));
            }
        }

        let raw = match self.kv_get(key).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("L2 read of {} failed: {}", key, e);
                return Err(e);
            }
        };

        match raw {
            Some(raw) => {
                let value: Value =
                    serde_json::from_str(&raw).unwrap_or_else(|_| Value::String(raw));
                if !opts.skip_l1 {
                    let ttl = opts
                        .cache_ttl
                        .unwrap_or(self.config.default_ttl)
                        .min(self.config.l1_ttl_cap);
                    self.l1.set(key, value.clone(), ttl);
                }
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Lenient read: L2 failures (already counted toward fail-over) read as
    /// a miss. For paths where absence is an acceptable answer.
    pub async fn get_or_absent(&self, key: &str, opts: &CacheReadOptions) -> Option<Value> {
        self.get(key, opts).await.ok().flatten()
    }

    /// Typed read.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
        opts: &CacheReadOptions,
    ) -> Result<Option<T>> {
        match self.get(key, opts).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Write a key through to L2 and into L1.
    ///
    /// An unchanged, unexpired L1 entry suppresses the write entirely. On an
    /// L2 failure the error is surfaced but L1 still holds the new value.
    pub async fn set(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
        opts: &CacheWriteOptions,
    ) -> Result<()> {
        if opts.skip_cache {
            return Ok(());
        }

        if !opts.skip_l1 && self.l1.is_unchanged(key, value) {
            debug!("Write suppressed for unchanged key {}", key);
            return Ok(());
        }

        let ttl = opts.cache_ttl.or(ttl).unwrap_or(self.config.default_ttl);
        let l2_ttl = if opts.skip_ttl_randomization {
            ttl
        } else {
            self.jitter_ttl(ttl)
        };

        let raw = serde_json::to_string(value)?;
        let write_result = self.kv_set(key, &raw, Some(l2_ttl)).await;

        if !opts.skip_l1 {
            // Defensive entry even when L2 failed: peers converge via the
            // change log, and locals keep serving the freshest value.
            self.l1.set(key, value.clone(), ttl.min(self.config.l1_ttl_cap));
        }

        write_result
    }

    /// Typed write.
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        opts: &CacheWriteOptions,
    ) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, &value, ttl, opts).await
    }

    /// Delete from L2 and L1.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let result = self.kv_delete(key).await;
        self.l1.delete(key);
        result
    }

    /// List key names under a prefix (L2 only; L1 holds no listing).
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.kv_list(prefix).await
    }

    fn jitter_ttl(&self, ttl: Duration) -> Duration {
        let ratio = self.config.ttl_jitter_ratio;
        if ratio <= 0.0 {
            return ttl;
        }
        let jitter = rand::rng().random_range(0.0..ratio);
        ttl + Duration::from_secs_f64(ttl.as_secs_f64() * jitter)
    }

    fn active_provider(&self) -> Arc<dyn KvProvider> {
        let state = self.state.lock();
        Arc::clone(&self.providers[state.active])
    }

    /// Count a retryable failure; flip to the fallback at the threshold.
    /// Returns true when a flip happened and the operation should retry once.
    fn record_failure(&self, error: &RelayError) -> bool {
        if !error.is_retryable_kv() {
            return false;
        }
        let mut state = self.state.lock();
        state.failure_count += 1;
        state.last_failure = Some(Instant::now());

        if state.failure_count >= self.config.failure_threshold_for_failover
            && state.active == 0
            && self.providers.len() > 1
        {
            state.active = 1;
            state.failure_count = 0;
            warn!(
                "L2 provider {} exhausted its failure budget; failing over to {}",
                self.providers[0].name(),
                self.providers[1].name()
            );
            return true;
        }
        false
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        match self.active_provider().get(key).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if self.record_failure(&e) {
                    self.active_provider().get(key).await
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn kv_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        match self.active_provider().set(key, value, ttl).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.record_failure(&e) {
                    self.active_provider().set(key, value, ttl).await
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn kv_delete(&self, key: &str) -> Result<()> {
        match self.active_provider().delete(key).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.record_failure(&e) {
                    self.active_provider().delete(key).await
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn kv_list(&self, prefix: &str) -> Result<Vec<String>> {
        match self.active_provider().list_keys(prefix).await {
            Ok(names) => Ok(names),
            Err(e) => {
                if self.record_failure(&e) {
                    self.active_provider().list_keys(prefix).await
                } else {
                    Err(e)
                }
            }
        }
    }
}
