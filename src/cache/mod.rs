// # Two-tier Cache
//
// In-process L1 cache plus external L2 KV providers, composed by the cache
// service with write-through, write suppression, and sticky provider
// fail-over.

pub mod cloud_kv;
pub mod local;
pub mod provider;
pub mod redis_rest;
pub mod service;

pub use local::LocalCache;
pub use provider::{KvErrorKind, KvProvider};
pub use service::{CacheReadOptions, CacheService, CacheWriteOptions};

/// Key read by the recovery probe to judge primary health.
pub const HEALTH_PROBE_KEY: &str = "health:probe";
