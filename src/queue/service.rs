// Queue Service
//
// Façade over the at-least-once webhook transport. Every outbound message is
// enriched with a `_meta` envelope identifying the trigger, the publishing
// instance, and the caller; deliveries go to `<webhook_base>/api/tasks/<topic>`
// through the circuit breaker. Intake-side, redelivered envelopes inside the
// dedup window are dropped before they reach the task layer.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerStatus};
use super::{EventPublisher, TOPIC_DOWNLOAD, TOPIC_SYSTEM_EVENTS, TOPIC_UPLOAD};
use crate::balancer::signature::verify_signature;
use crate::config::QueueConfig;
use crate::error::{RelayError, Result};

/// Per-publish options; the defaults identify an unattributed publish.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// What prompted the publish (e.g. "webhook", "retry", "sync-loop")
    pub trigger_source: String,
    /// Logical caller recorded in the envelope
    pub caller: String,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            trigger_source: "internal".to_string(),
            caller: "queue-service".to_string(),
        }
    }
}

/// Queue service bound to one instance identity.
pub struct QueueService {
    config: QueueConfig,
    instance_id: String,
    http_client: reqwest::Client,
    breaker: CircuitBreaker,
    seen_envelopes: DashMap<String, Instant>,
}

impl QueueService {
    pub fn new(config: QueueConfig, instance_id: String) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.publish_timeout)
            .build()
            .unwrap_or_default();
        let breaker = CircuitBreaker::new("queue-transport", config.circuit_breaker.clone());

        Self {
            config,
            instance_id,
            http_client,
            breaker,
            seen_envelopes: DashMap::new(),
        }
    }

    fn topic_url(&self, topic: &str) -> String {
        format!(
            "{}/api/tasks/{}",
            self.config.webhook_base.trim_end_matches('/'),
            topic
        )
    }

    /// Wrap a message in the transport envelope.
    fn build_envelope(&self, message: Value, opts: &PublishOptions) -> Value {
        let mut envelope = match message {
            Value::Object(map) => Value::Object(map),
            other => json!({ "payload": other }),
        };
        if let Some(object) = envelope.as_object_mut() {
            object.insert(
                "_meta".to_string(),
                json!({
                    "envelope_id": Uuid::new_v4().to_string(),
                    "trigger_source": opts.trigger_source,
                    "timestamp": Utc::now().timestamp_millis(),
                    "instance_id": self.instance_id,
                    "caller": opts.caller,
                }),
            );
        }
        envelope
    }

    /// Publish one message to a topic.
    pub async fn publish(&self, topic: &str, message: Value, opts: &PublishOptions) -> Result<()> {
        let envelope = self.build_envelope(message, opts);
        let url = self.topic_url(topic);
        let client = self.http_client.clone();

        self.breaker
            .call(async move {
                let response = client
                    .post(&url)
                    .json(&envelope)
                    .send()
                    .await
                    .map_err(|e| RelayError::Network(format!("Queue publish failed: {}", e)))?;

                if !response.status().is_success() {
                    return Err(RelayError::Network(format!(
                        "Queue publish to {} returned {}",
                        url,
                        response.status()
                    )));
                }
                Ok(())
            })
            .await
    }

    /// Publish a sequence of messages, each with the same envelope
    /// enrichment. Per-entry outcomes are returned in order.
    pub async fn batch_publish(
        &self,
        entries: Vec<(String, Value)>,
        opts: &PublishOptions,
    ) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(entries.len());
        for (topic, message) in entries {
            let result = self.publish(&topic, message, opts).await;
            if let Err(ref e) = result {
                warn!("Batch publish to {} failed: {}", topic, e);
            }
            results.push(result);
        }
        results
    }

    pub async fn enqueue_download_task(&self, task_id: &str, data: Value) -> Result<()> {
        let mut message = json!({ "taskId": task_id });
        merge_into(&mut message, data);
        self.publish(
            TOPIC_DOWNLOAD,
            message,
            &PublishOptions {
                trigger_source: "enqueue".to_string(),
                caller: "task-manager".to_string(),
            },
        )
        .await
    }

    pub async fn enqueue_upload_task(&self, task_id: &str, data: Value) -> Result<()> {
        let mut message = json!({ "taskId": task_id });
        merge_into(&mut message, data);
        self.publish(
            TOPIC_UPLOAD,
            message,
            &PublishOptions {
                trigger_source: "enqueue".to_string(),
                caller: "task-manager".to_string(),
            },
        )
        .await
    }

    pub async fn broadcast_system_event(&self, event: &str, data: Value) -> Result<()> {
        self.publish(
            TOPIC_SYSTEM_EVENTS,
            json!({ "event": event, "data": data }),
            &PublishOptions {
                trigger_source: "broadcast".to_string(),
                caller: "system".to_string(),
            },
        )
        .await
    }

    /// Verify an inbound webhook MAC against the current and next keys.
    pub fn verify_webhook_signature(&self, signature: &str, timestamp: &str, body: &[u8]) -> bool {
        verify_signature(&self.config.signing_keys, signature, timestamp, body)
    }

    /// Record an envelope id; returns false when it was already seen inside
    /// the dedup window (the delivery should be dropped).
    pub fn admit_envelope(&self, envelope_id: &str) -> bool {
        let now = Instant::now();
        let window = self.config.envelope_dedup_window;

        if let Some(seen_at) = self.seen_envelopes.get(envelope_id) {
            if now.duration_since(*seen_at) < window {
                debug!("Dropping redelivered envelope {}", envelope_id);
                return false;
            }
        }
        self.seen_envelopes.insert(envelope_id.to_string(), now);

        // Opportunistic sweep keeps the window set bounded.
        if self.seen_envelopes.len() > 10_000 {
            self.seen_envelopes
                .retain(|_, seen_at| now.duration_since(*seen_at) < window);
        }
        true
    }

    pub fn circuit_breaker_status(&self) -> CircuitBreakerStatus {
        self.breaker.status()
    }

    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }
}

#[async_trait]
impl EventPublisher for QueueService {
    async fn publish_event(&self, topic: &str, message: Value) -> Result<()> {
        self.publish(
            topic,
            message,
            &PublishOptions {
                trigger_source: "event".to_string(),
                caller: "event-bus".to_string(),
            },
        )
        .await
    }
}

fn merge_into(target: &mut Value, extra: Value) {
    if let (Some(target), Value::Object(extra)) = (target.as_object_mut(), extra) {
        for (key, value) in extra {
            target.insert(key, value);
        }
    }
}
