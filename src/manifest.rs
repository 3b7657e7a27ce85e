// Service manifest
//
// A static table of services, the config keys they consume, and the strategy
// used to reinitialize each of them when those keys change. Given a set of
// changed keys, `affected_services` computes the reconfiguration set; the
// caller applies each service's strategy subject to its timeout.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

static DEFAULT_MANIFEST: Lazy<ServiceManifest> = Lazy::new(ServiceManifest::default);

/// Process-wide shared view of the built-in manifest. Deployments that ship
/// a custom manifest construct their own `ServiceManifest` instead.
pub fn default_manifest() -> &'static ServiceManifest {
    &DEFAULT_MANIFEST
}

/// How a service is brought in line with new configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReinitKind {
    /// Tear the service down and construct it again
    DestroyInitialize,
    /// Re-establish connections without dropping in-memory state
    LightweightReconnect,
    /// Apply the new values in place
    Reconfigure,
    /// Reconnect the transport only
    Reconnect,
    /// Full process-level restart required
    Restart,
}

/// Reinitialization strategy with its timeout budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReinitStrategy {
    pub kind: ReinitKind,
    /// Whether in-flight work is drained before reinitialization
    pub graceful: bool,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl ReinitStrategy {
    pub fn new(kind: ReinitKind, graceful: bool, timeout: Duration) -> Self {
        Self {
            kind,
            graceful,
            timeout,
        }
    }
}

/// One service's manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Display icon for operator tooling
    pub icon: String,
    /// Config keys this service consumes
    pub config_keys: Vec<String>,
    pub strategy: ReinitStrategy,
    /// Critical services abort startup when reinitialization fails
    pub critical: bool,
    /// Whether this service may reinitialize in parallel with others
    pub parallel: bool,
}

/// The full service manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceManifest {
    services: BTreeMap<String, ServiceEntry>,
}

impl ServiceManifest {
    pub fn new() -> Self {
        Self {
            services: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: ServiceEntry) {
        self.services.insert(name.into(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Services affected by a set of changed config keys, in manifest order.
    pub fn affected_services(&self, changed_keys: &[&str]) -> Vec<(String, &ServiceEntry)> {
        let changed: BTreeSet<&str> = changed_keys.iter().copied().collect();
        self.services
            .iter()
            .filter(|(_, entry)| entry.config_keys.iter().any(|k| changed.contains(k.as_str())))
            .map(|(name, entry)| (name.clone(), entry))
            .collect()
    }

    /// Split the affected set into the parallel and serial phases. Serial
    /// services reinitialize one at a time after the parallel wave.
    pub fn reinit_phases(&self, changed_keys: &[&str]) -> (Vec<String>, Vec<String>) {
        let affected = self.affected_services(changed_keys);
        let mut parallel = Vec::new();
        let mut serial = Vec::new();
        for (name, entry) in affected {
            if entry.parallel {
                parallel.push(name);
            } else {
                serial.push(name);
            }
        }
        (parallel, serial)
    }
}

impl Default for ServiceManifest {
    fn default() -> Self {
        let mut manifest = Self::new();

        manifest.insert(
            "cache",
            ServiceEntry {
                icon: "🗄️".to_string(),
                config_keys: vec![
                    "cache.l1_ttl_cap".to_string(),
                    "cache.failure_threshold_for_failover".to_string(),
                    "cache.preferred_provider".to_string(),
                ],
                strategy: ReinitStrategy::new(
                    ReinitKind::DestroyInitialize,
                    true,
                    Duration::from_secs(30),
                ),
                critical: true,
                parallel: false,
            },
        );
        manifest.insert(
            "instance-coordinator",
            ServiceEntry {
                icon: "🧭".to_string(),
                config_keys: vec![
                    "heartbeat_interval".to_string(),
                    "instance_timeout".to_string(),
                    "lock_default_ttl".to_string(),
                ],
                strategy: ReinitStrategy::new(
                    ReinitKind::LightweightReconnect,
                    true,
                    Duration::from_secs(60),
                ),
                critical: true,
                parallel: false,
            },
        );
        manifest.insert(
            "queue",
            ServiceEntry {
                icon: "📮".to_string(),
                config_keys: vec![
                    "queue.webhook_base".to_string(),
                    "queue.signing_keys".to_string(),
                    "circuit_breaker.failure_threshold".to_string(),
                    "circuit_breaker.success_threshold".to_string(),
                    "circuit_breaker.open_timeout_ms".to_string(),
                ],
                strategy: ReinitStrategy::new(
                    ReinitKind::Reconnect,
                    false,
                    Duration::from_secs(15),
                ),
                critical: false,
                parallel: true,
            },
        );
        manifest.insert(
            "state-synchronizer",
            ServiceEntry {
                icon: "🔁".to_string(),
                config_keys: vec!["sync_interval".to_string()],
                strategy: ReinitStrategy::new(
                    ReinitKind::Reconfigure,
                    false,
                    Duration::from_secs(15),
                ),
                critical: false,
                parallel: true,
            },
        );
        manifest.insert(
            "stream-transfer",
            ServiceEntry {
                icon: "📦".to_string(),
                config_keys: vec![
                    "stream.chunk_retry_max".to_string(),
                    "stream.stale_timeout".to_string(),
                ],
                strategy: ReinitStrategy::new(
                    ReinitKind::Reconfigure,
                    true,
                    Duration::from_secs(15),
                ),
                critical: false,
                parallel: true,
            },
        );
        manifest.insert(
            "batch-processor",
            ServiceEntry {
                icon: "🧺".to_string(),
                config_keys: vec![
                    "max_batch_size".to_string(),
                    "max_concurrent_batches".to_string(),
                ],
                strategy: ReinitStrategy::new(
                    ReinitKind::Reconfigure,
                    false,
                    Duration::from_secs(15),
                ),
                critical: false,
                parallel: true,
            },
        );

        manifest
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affected_services() {
        let manifest = ServiceManifest::default();
        let affected = manifest.affected_services(&["heartbeat_interval"]);
        assert_eq!(affected.len(), 1);
        assert_eq!(affected[0].0, "instance-coordinator");
    }

    #[test]
    fn test_multiple_keys_union() {
        let manifest = ServiceManifest::default();
        let affected =
            manifest.affected_services(&["sync_interval", "queue.webhook_base", "unknown.key"]);
        let names: Vec<&str> = affected.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["queue", "state-synchronizer"]);
    }

    #[test]
    fn test_reinit_phases() {
        let manifest = ServiceManifest::default();
        let (parallel, serial) =
            manifest.reinit_phases(&["cache.preferred_provider", "sync_interval"]);
        assert_eq!(serial, vec!["cache"]);
        assert_eq!(parallel, vec!["state-synchronizer"]);
    }

    #[test]
    fn test_strategy_timeouts() {
        let manifest = ServiceManifest::default();
        let cache = manifest.get("cache").unwrap();
        assert_eq!(cache.strategy.kind, ReinitKind::DestroyInitialize);
        assert_eq!(cache.strategy.timeout, Duration::from_secs(30));

        let queue = manifest.get("queue").unwrap();
        assert_eq!(queue.strategy.timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_manifest_round_trip() {
        let manifest = ServiceManifest::default();
        let json = serde_json::to_string(&manifest).unwrap();
        let parsed: ServiceManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.service_names(), manifest.service_names());
    }

    #[test]
    fn test_shared_default_manifest() {
        let shared = default_manifest();
        assert_eq!(shared.service_names(), ServiceManifest::default().service_names());
        // Repeated calls hand back the same instance.
        assert!(std::ptr::eq(default_manifest(), shared));
    }
}
