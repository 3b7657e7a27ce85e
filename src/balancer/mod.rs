// # Load Balancer Frontend
//
// Standalone process fronting the instances. Inbound signed webhooks are
// verified, an active instance is chosen by a persisted round-robin index,
// and the original body is forwarded with the remaining instances tried in
// order on 5xx. The balancer's own coordination-store access runs through a
// stateful fail-over mirroring the cache service's.

pub mod signature;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::KvProvider;
use crate::config::BalancerConfig;
use crate::coordination::InstanceRecord;
use crate::error::{RelayError, Result};

pub const ROUND_ROBIN_KEY: &str = "lb:round_robin_index";

/// Substring classification for the store fail-over, matching the error
/// shapes the KV providers actually emit.
fn is_retryable_store_error(error: &RelayError) -> bool {
    if error.is_retryable_kv() {
        return true;
    }
    let message = error.to_string().to_lowercase();
    [
        "free usage limit",
        "quota",
        "rate limit",
        "network",
        "timeout",
        "fetch failed",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

struct StoreState {
    active: usize,
    failure_count: u32,
}

/// Two-provider store access with threshold fail-over.
pub struct FailoverStore {
    providers: Vec<Arc<dyn KvProvider>>,
    state: Mutex<StoreState>,
    failure_threshold: u32,
}

impl FailoverStore {
    pub fn new(
        primary: Arc<dyn KvProvider>,
        secondary: Option<Arc<dyn KvProvider>>,
        failure_threshold: u32,
    ) -> Self {
        let mut providers = vec![primary];
        if let Some(secondary) = secondary {
            providers.push(secondary);
        }
        Self {
            providers,
            state: Mutex::new(StoreState {
                active: 0,
                failure_count: 0,
            }),
            failure_threshold,
        }
    }

    pub fn current_provider(&self) -> String {
        let state = self.state.lock();
        self.providers[state.active].name().to_string()
    }

    fn active_provider(&self) -> Arc<dyn KvProvider> {
        let state = self.state.lock();
        Arc::clone(&self.providers[state.active])
    }

    /// Count a retryable failure; flip to the other provider at the
    /// threshold. Returns true when a flip happened.
    fn record_failure(&self, error: &RelayError) -> bool {
        if !is_retryable_store_error(error) {
            return false;
        }
        let mut state = self.state.lock();
        state.failure_count += 1;
        if state.failure_count >= self.failure_threshold && self.providers.len() > 1 {
            let next = (state.active + 1) % self.providers.len();
            warn!(
                "Coordination store {} failing; switching to {}",
                self.providers[state.active].name(),
                self.providers[next].name()
            );
            state.active = next;
            state.failure_count = 0;
            return true;
        }
        false
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
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

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
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

    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
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

/// Response handed back to the HTTP layer.
#[derive(Debug, Clone)]
pub struct LbResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl LbResponse {
    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: format!("{{\"error\":\"{}\"}}", message).into_bytes(),
        }
    }
}

pub struct LoadBalancer {
    store: FailoverStore,
    config: BalancerConfig,
    http_client: reqwest::Client,
}

impl LoadBalancer {
    pub fn new(store: FailoverStore, config: BalancerConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.forward_timeout)
            .build()
            .unwrap_or_default();
        Self {
            store,
            config,
            http_client,
        }
    }

    pub fn store(&self) -> &FailoverStore {
        &self.store
    }

    /// Handle one inbound signed webhook. Missing or mismatched signatures
    /// come back as 500 (kept for wire compatibility, 401 is not used here);
    /// an empty active set is 503.
    pub async fn handle_webhook(
        &self,
        path: &str,
        signature: Option<&str>,
        timestamp: Option<&str>,
        body: Bytes,
        client_ip: &str,
        original_host: &str,
        proto: &str,
    ) -> LbResponse {
        let (Some(signature), Some(timestamp)) = (signature, timestamp) else {
            return LbResponse::error(500, "Missing signature headers");
        };
        if !signature::verify_signature(&self.config.signing_keys, signature, timestamp, &body) {
            return LbResponse::error(500, "Signature verification failed");
        }

        let instances = match self.discover_active_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!("Instance discovery failed: {}", e);
                return LbResponse::error(500, "Instance discovery failed");
            }
        };
        if instances.is_empty() {
            return LbResponse::error(503, "No active instances");
        }

        let start_index = self.next_round_robin_index(instances.len()).await;

        for offset in 0..instances.len() {
            let target = &instances[(start_index + offset) % instances.len()];
            match self
                .forward(target, path, &body, client_ip, original_host, proto)
                .await
            {
                Ok(response) => return response,
                Err(e) => {
                    warn!("Forward to {} failed: {}; trying next", target.url, e);
                }
            }
        }

        LbResponse::error(500, "All instances failed")
    }

    /// Active instances per the shared store, sorted by id.
    pub async fn discover_active_instances(&self) -> Result<Vec<InstanceRecord>> {
        let keys = self.store.list_keys("instance:").await?;
        let now = Utc::now();
        let mut instances = Vec::new();
        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<InstanceRecord>(&raw) {
                Ok(record) => {
                    if record.is_live(self.config.instance_timeout, now) {
                        instances.push(record);
                    }
                }
                Err(e) => debug!("Skipping malformed instance record {}: {}", key, e),
            }
        }
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    /// Read and advance the persisted round-robin index. The counter is
    /// racy across balancer replicas; skew only shifts distribution.
    async fn next_round_robin_index(&self, instance_count: usize) -> usize {
        let current = match self.store.get(ROUND_ROBIN_KEY).await {
            Ok(Some(raw)) => raw.trim().trim_matches('"').parse::<usize>().unwrap_or(0),
            _ => 0,
        };
        let index = current % instance_count.max(1);
        if let Err(e) = self
            .store
            .set(ROUND_ROBIN_KEY, &(current.wrapping_add(1)).to_string(), None)
            .await
        {
            debug!("Round-robin index persist failed: {}", e);
        }
        index
    }

    async fn forward(
        &self,
        target: &InstanceRecord,
        path: &str,
        body: &Bytes,
        client_ip: &str,
        original_host: &str,
        proto: &str,
    ) -> Result<LbResponse> {
        let url = format!("{}{}", target.url.trim_end_matches('/'), path);
        let response = self
            .http_client
            .post(&url)
            .header("x-forwarded-for", client_ip)
            .header("x-forwarded-proto", proto)
            .header("x-original-host", original_host)
            .body(body.clone())
            .send()
            .await
            .map_err(|e| RelayError::Network(format!("Forward to {} failed: {}", url, e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RelayError::Network(format!(
                "Instance {} returned {}",
                target.id, status
            )));
        }

        let body = response.bytes().await.unwrap_or_default().to_vec();
        info!("Forwarded {} to {} ({})", path, target.id, status);
        Ok(LbResponse {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::provider::KvErrorKind;
    use crate::config::SigningKeys;
    use crate::coordination::InstanceStatus;
    use async_trait::async_trait;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MemoryKv {
        label: &'static str,
        store: DashMap<String, String>,
        fail_next: AtomicU32,
    }

    impl MemoryKv {
        fn new(label: &'static str) -> Arc<Self> {
            Arc::new(Self {
                label,
                store: DashMap::new(),
                fail_next: AtomicU32::new(0),
            })
        }

        fn take_failure(&self) -> Option<RelayError> {
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
                Some(KvErrorKind::QuotaExhausted.into_error("free usage limit exceeded"))
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

    fn instance(id: &str, url: &str) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            url: url.to_string(),
            hostname: "host".to_string(),
            region: "test".to_string(),
            started_at: Utc::now(),
            last_heartbeat: Utc::now(),
            status: InstanceStatus::Active,
        }
    }

    fn balancer_with(primary: Arc<MemoryKv>, secondary: Arc<MemoryKv>) -> LoadBalancer {
        let store = FailoverStore::new(
            primary,
            Some(secondary),
            3,
        );
        let mut config = BalancerConfig::default();
        config.signing_keys = SigningKeys::new("lb-key", "");
        config.forward_timeout = Duration::from_millis(200);
        LoadBalancer::new(store, config)
    }

    #[tokio::test]
    async fn test_missing_signature_headers_500() {
        let lb = balancer_with(MemoryKv::new("a"), MemoryKv::new("b"));
        let response = lb
            .handle_webhook("/api/tasks/download", None, None, Bytes::new(), "1.2.3.4", "host", "https")
            .await;
        assert_eq!(response.status, 500);
    }

    #[tokio::test]
    async fn test_bad_signature_500() {
        let lb = balancer_with(MemoryKv::new("a"), MemoryKv::new("b"));
        let response = lb
            .handle_webhook(
                "/api/tasks/download",
                Some("v1a=AAAA"),
                Some("1700000000"),
                Bytes::from_static(b"body"),
                "1.2.3.4",
                "host",
                "https",
            )
            .await;
        assert_eq!(response.status, 500);
    }

    #[tokio::test]
    async fn test_no_active_instances_503() {
        let lb = balancer_with(MemoryKv::new("a"), MemoryKv::new("b"));
        let body = Bytes::from_static(b"body");
        let sig = signature::compute_signature("lb-key", "1700000000", &body);
        let response = lb
            .handle_webhook(
                "/api/tasks/download",
                Some(&sig),
                Some("1700000000"),
                body,
                "1.2.3.4",
                "host",
                "https",
            )
            .await;
        assert_eq!(response.status, 503);
    }

    #[tokio::test]
    async fn test_unreachable_instances_yield_500() {
        let primary = MemoryKv::new("a");
        primary.store.insert(
            "instance:i1".to_string(),
            serde_json::to_string(&instance("i1", "http://127.0.0.1:1")).unwrap(),
        );
        let lb = balancer_with(primary, MemoryKv::new("b"));

        let body = Bytes::from_static(b"body");
        let sig = signature::compute_signature("lb-key", "1700000000", &body);
        let response = lb
            .handle_webhook(
                "/api/tasks/download",
                Some(&sig),
                Some("1700000000"),
                body,
                "1.2.3.4",
                "host",
                "https",
            )
            .await;
        // Signature and discovery passed; the single instance is down.
        assert_eq!(response.status, 500);
    }

    #[tokio::test]
    async fn test_discovery_filters_dead_instances() {
        let primary = MemoryKv::new("a");
        primary.store.insert(
            "instance:live".to_string(),
            serde_json::to_string(&instance("live", "http://x")).unwrap(),
        );
        let mut dead = instance("dead", "http://y");
        dead.last_heartbeat = Utc::now() - chrono::Duration::seconds(3600);
        primary.store.insert(
            "instance:dead".to_string(),
            serde_json::to_string(&dead).unwrap(),
        );
        let lb = balancer_with(primary, MemoryKv::new("b"));

        let instances = lb.discover_active_instances().await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "live");
    }

    #[tokio::test]
    async fn test_round_robin_index_advances() {
        let primary = MemoryKv::new("a");
        let lb = balancer_with(Arc::clone(&primary), MemoryKv::new("b"));

        assert_eq!(lb.next_round_robin_index(3).await, 0);
        assert_eq!(lb.next_round_robin_index(3).await, 1);
        assert_eq!(lb.next_round_robin_index(3).await, 2);
        assert_eq!(lb.next_round_robin_index(3).await, 0);
    }

    #[tokio::test]
    async fn test_store_failover_at_threshold() {
        let primary = MemoryKv::new("primary");
        let secondary = MemoryKv::new("secondary");
        secondary
            .store
            .insert("k".to_string(), "from-secondary".to_string());
        let store = FailoverStore::new(
            Arc::clone(&primary) as Arc<dyn KvProvider>,
            Some(Arc::clone(&secondary) as Arc<dyn KvProvider>),
            3,
        );

        primary.fail_next.store(3, Ordering::SeqCst);
        assert!(store.get("k").await.is_err());
        assert!(store.get("k").await.is_err());
        // Third failure hits the threshold, flips, and retries.
        let value = store.get("k").await.unwrap();
        assert_eq!(value.as_deref(), Some("from-secondary"));
        assert_eq!(store.current_provider(), "secondary");
    }

    #[tokio::test]
    async fn test_non_retryable_store_error_no_flip() {
        let primary = MemoryKv::new("primary");
        let store = FailoverStore::new(
            Arc::clone(&primary) as Arc<dyn KvProvider>,
            Some(MemoryKv::new("secondary") as Arc<dyn KvProvider>),
            1,
        );
        let error = RelayError::Auth("bad token".to_string());
        assert!(!store.record_failure(&error));
        assert_eq!(store.current_provider(), "primary");
    }
}
