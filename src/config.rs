// Relay configuration
//
// Every tunable named in the deployment guide is an explicit field with a
// default. Components receive their own config struct at construction; the
// aggregate RelayConfig is what the binaries load from the environment.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Signing key pair for webhook authentication. Two keys are concurrently
/// valid so keys can be rotated without dropping traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningKeys {
    pub current: String,
    pub next: String,
}

impl SigningKeys {
    pub fn new(current: impl Into<String>, next: impl Into<String>) -> Self {
        Self {
            current: current.into(),
            next: next.into(),
        }
    }
}

/// Instance coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often the instance record is refreshed
    pub heartbeat_interval: Duration,
    /// Active-set cutoff; records older than this are dead
    pub instance_timeout: Duration,
    /// Default TTL for named locks
    pub lock_default_ttl: Duration,
    /// TTL for per-task locks
    pub task_lock_ttl: Duration,
    /// Backoff schedule between lock attempts, in milliseconds
    pub lock_backoff_ms: Vec<u64>,
    /// Maximum lock acquisition attempts
    pub lock_max_attempts: usize,
    /// How long the active set may be served from a local snapshot
    pub active_set_cache_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(300),
            instance_timeout: Duration::from_secs(900),
            lock_default_ttl: Duration::from_secs(60),
            task_lock_ttl: Duration::from_secs(600),
            lock_backoff_ms: vec![100, 500, 1000, 2000, 5000],
            lock_max_attempts: 3,
            active_set_cache_ttl: Duration::from_secs(5),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.instance_timeout < self.heartbeat_interval.saturating_mul(3) {
            return Err(RelayError::Configuration(
                "instance_timeout must be at least 3x heartbeat_interval".to_string(),
            ));
        }
        if self.lock_max_attempts == 0 {
            return Err(RelayError::Configuration(
                "lock_max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.lock_backoff_ms.is_empty() {
            return Err(RelayError::Configuration(
                "lock_backoff_ms must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cache tier configuration
#[derive(Debug, Clone)]
pub struct CacheTierConfig {
    /// Cap applied to L1 entry TTLs regardless of the L2 TTL
    pub l1_ttl_cap: Duration,
    /// Retryable L2 failures tolerated before flipping providers
    pub failure_threshold_for_failover: u32,
    /// How often the recovery probe checks the primary
    pub recovery_probe_interval: Duration,
    /// Provider pinned by configuration; being on it is never "fail-over"
    pub preferred_provider: String,
    /// Default TTL applied when a write does not carry one
    pub default_ttl: Duration,
    /// Maximum proportional jitter applied to L2 write TTLs
    pub ttl_jitter_ratio: f64,
}

impl Default for CacheTierConfig {
    fn default() -> Self {
        Self {
            l1_ttl_cap: Duration::from_secs(60),
            failure_threshold_for_failover: 3,
            recovery_probe_interval: Duration::from_secs(120),
            preferred_provider: "Cloudflare KV".to_string(),
            default_ttl: Duration::from_secs(3600),
            ttl_jitter_ratio: 0.1,
        }
    }
}

impl CacheTierConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold_for_failover == 0 {
            return Err(RelayError::Configuration(
                "failure_threshold_for_failover must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.ttl_jitter_ratio) {
            return Err(RelayError::Configuration(
                "ttl_jitter_ratio must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures in CLOSED before the circuit opens
    pub failure_threshold: u32,
    /// Successes in HALF_OPEN before the circuit closes
    pub success_threshold: u32,
    /// How long an OPEN circuit rejects before permitting a probe call
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Queue service configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Base URL the webhook transport delivers to
    pub webhook_base: String,
    /// Webhook signing keys (current + next)
    pub signing_keys: SigningKeys,
    /// Circuit breaker guarding the transport
    pub circuit_breaker: CircuitBreakerConfig,
    /// Publish timeout per request
    pub publish_timeout: Duration,
    /// How long a seen envelope id suppresses redelivery
    pub envelope_dedup_window: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            webhook_base: "http://localhost:8787".to_string(),
            signing_keys: SigningKeys::new("", ""),
            circuit_breaker: CircuitBreakerConfig::default(),
            publish_timeout: Duration::from_secs(15),
            envelope_dedup_window: Duration::from_secs(600),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.webhook_base.is_empty() {
            return Err(RelayError::Configuration(
                "webhook_base must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Task deduplication configuration
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// TTL during which a dedup key collision rejects registration
    pub dedup_window: Duration,
    /// TTL of the processing lock record
    pub processing_lock_ttl: Duration,
    /// Age past which a processing owner is considered stale
    pub max_processing_time: Duration,
    /// TTL for persisted results
    pub result_ttl: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(3600),
            processing_lock_ttl: Duration::from_secs(300),
            max_processing_time: Duration::from_secs(600),
            result_ttl: Duration::from_secs(3600),
        }
    }
}

/// Batch processor configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Items beyond this are trimmed from a new batch
    pub max_batch_size: usize,
    /// Batches processed concurrently per instance
    pub max_concurrent_batches: usize,
    /// Items executed in parallel per chunk
    pub chunk_size: usize,
    /// Lock TTL held for the duration of a batch
    pub process_lock_ttl: Duration,
    /// Ceiling on on_batch_complete waiters
    pub completion_wait_max: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_concurrent_batches: 5,
            chunk_size: 10,
            process_lock_ttl: Duration::from_secs(120),
            completion_wait_max: Duration::from_secs(300),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 || self.chunk_size == 0 {
            return Err(RelayError::Configuration(
                "batch sizes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Media group buffer configuration
#[derive(Debug, Clone)]
pub struct MediaGroupConfig {
    /// Quiet period after which a partial group is flushed
    pub buffer_timeout: Duration,
    /// Group size that triggers an immediate flush
    pub buffer_threshold: usize,
}

impl Default for MediaGroupConfig {
    fn default() -> Self {
        Self {
            buffer_timeout: Duration::from_millis(1000),
            buffer_threshold: 3,
        }
    }
}

/// Stream transfer configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Per-(task, chunk) forward retry cap
    pub chunk_retry_max: u32,
    /// Sessions silent for longer than this are reaped
    pub stale_timeout: Duration,
    /// Chat progress message edited every N chunks
    pub ui_edit_every: u64,
    /// Progress POSTed to the leader every N chunks
    pub progress_report_every: u64,
    /// Shared secret for the inter-instance stream endpoints
    pub instance_secret: String,
    /// Janitor sweep interval
    pub janitor_interval: Duration,
    /// TTL of resumable progress records
    pub progress_ttl: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_retry_max: 3,
            stale_timeout: Duration::from_secs(300),
            ui_edit_every: 20,
            progress_report_every: 50,
            instance_secret: String::new(),
            janitor_interval: Duration::from_secs(60),
            progress_ttl: Duration::from_secs(86_400),
        }
    }
}

/// State synchronizer configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Periodic sync cadence
    pub sync_interval: Duration,
    /// TTL of per-peer state snapshots
    pub state_snapshot_ttl: Duration,
    /// TTL of the per-(user, type) sync lock
    pub sync_lock_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5),
            state_snapshot_ttl: Duration::from_secs(300),
            sync_lock_ttl: Duration::from_secs(30),
        }
    }
}

/// Graceful shutdown configuration
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// The whole hook sequence races against this
    pub shutdown_timeout: Duration,
    /// Ceiling on waiting for in-flight tasks to drain
    pub drain_timeout: Duration,
    /// Poll cadence while draining
    pub drain_poll_interval: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_millis(30_000),
            drain_timeout: Duration::from_secs(60),
            drain_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Load balancer configuration
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Listen address for the LB frontend
    pub listen_addr: String,
    /// Webhook signing keys (current + next)
    pub signing_keys: SigningKeys,
    /// Retryable store failures tolerated before flipping providers
    pub store_failure_threshold: u32,
    /// Forward timeout per attempt
    pub forward_timeout: Duration,
    /// Active-set cutoff applied when reading instance records
    pub instance_timeout: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8788".to_string(),
            signing_keys: SigningKeys::new("", ""),
            store_failure_threshold: 3,
            forward_timeout: Duration::from_secs(30),
            instance_timeout: Duration::from_secs(900),
        }
    }
}

/// Aggregate configuration for a relay instance
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub coordinator: CoordinatorConfig,
    pub cache: CacheTierConfig,
    pub queue: QueueConfig,
    pub dedup: DedupConfig,
    pub batch: BatchConfig,
    pub media_group: MediaGroupConfig,
    pub stream: StreamConfig,
    pub sync: SyncConfig,
    pub shutdown: ShutdownConfig,
    pub balancer: BalancerConfig,
    /// Externally reachable URL of this instance
    pub public_url: String,
    /// Deployment region tag carried in the instance record
    pub region: String,
    /// HTTP listen address for the instance API
    pub listen_addr: String,
}

impl RelayConfig {
    /// Validate the aggregate configuration.
    pub fn validate(&self) -> Result<()> {
        self.coordinator.validate()?;
        self.cache.validate()?;
        self.queue.validate()?;
        self.batch.validate()?;
        Ok(())
    }

    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("RELAY_PUBLIC_URL") {
            config.public_url = url;
        }
        if let Ok(region) = std::env::var("RELAY_REGION") {
            config.region = region;
        }
        if let Ok(addr) = std::env::var("RELAY_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(base) = std::env::var("RELAY_WEBHOOK_BASE") {
            config.queue.webhook_base = base;
        }
        if let Ok(secret) = std::env::var("RELAY_INSTANCE_SECRET") {
            config.stream.instance_secret = secret;
        }
        if let Ok(key) = std::env::var("RELAY_SIGNING_KEY") {
            config.queue.signing_keys.current = key.clone();
            config.balancer.signing_keys.current = key;
        }
        if let Ok(key) = std::env::var("RELAY_SIGNING_KEY_NEXT") {
            config.queue.signing_keys.next = key.clone();
            config.balancer.signing_keys.next = key;
        }
        if let Ok(secs) = std::env::var("RELAY_HEARTBEAT_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                config.coordinator.heartbeat_interval = Duration::from_secs(secs);
            }
        }
        if let Ok(secs) = std::env::var("RELAY_INSTANCE_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                config.coordinator.instance_timeout = Duration::from_secs(secs);
            }
        }

        if config.listen_addr.is_empty() {
            config.listen_addr = "0.0.0.0:8080".to_string();
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_heartbeat_ratio_enforced() {
        let mut config = CoordinatorConfig::default();
        config.instance_timeout = Duration::from_secs(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jitter_ratio_bounds() {
        let mut config = CacheTierConfig::default();
        config.ttl_jitter_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_spec_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.coordinator.heartbeat_interval, Duration::from_secs(300));
        assert_eq!(config.coordinator.instance_timeout, Duration::from_secs(900));
        assert_eq!(config.queue.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.batch.max_batch_size, 100);
        assert_eq!(config.media_group.buffer_threshold, 3);
        assert_eq!(config.stream.chunk_retry_max, 3);
    }
}
