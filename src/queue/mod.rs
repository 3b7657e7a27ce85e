// # Queue Service
//
// Thin façade over an at-least-once webhook transport: envelope enrichment,
// topic publishing, signed-webhook verification, and a circuit breaker
// guarding the transport.

pub mod circuit_breaker;
pub mod service;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStatus, CircuitState};
pub use service::{PublishOptions, QueueService};

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Fixed queue topics.
pub const TOPIC_DOWNLOAD: &str = "download";
pub const TOPIC_UPLOAD: &str = "upload";
pub const TOPIC_SYSTEM_EVENTS: &str = "system-events";
pub const TOPIC_STATE_SYNC: &str = "state_sync";
pub const TOPIC_CACHE_SYNC: &str = "cache_sync";
pub const TOPIC_BATCH_EVENTS: &str = "batch_events";

/// Seam for components that broadcast events to peers. Implemented by
/// `QueueService`; tests substitute an in-memory bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_event(&self, topic: &str, message: Value) -> Result<()>;
}
