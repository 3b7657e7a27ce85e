// Endpoint handlers
//
// Thin translation between HTTP and the components. Status mapping at this
// boundary: a bad instance secret on stream ingress is 401, any other
// ingress failure is 500; queue intake rejects unsigned deliveries with 401.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::ApiState;
use crate::coordination::consistent::CacheChangeEvent;
use crate::coordination::SyncEvent;
use crate::error::RelayError;
use crate::queue::{TOPIC_CACHE_SYNC, TOPIC_DOWNLOAD, TOPIC_STATE_SYNC, TOPIC_UPLOAD};
use crate::stream::{ChunkMetadata, HDR_INSTANCE_SECRET};

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

pub async fn health(State(state): State<Arc<ApiState>>) -> Response {
    let leader = state.coordinator.is_leader().await.unwrap_or(false);
    Json(json!({
        "status": "ok",
        "instanceId": state.coordinator.instance_id(),
        "version": crate::VERSION,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "provider": state.cache.current_provider(),
        "failoverMode": state.cache.is_failover_mode(),
        "leader": leader,
        "processing": state.manager.processing_count(),
        "waiting": state.manager.waiting_count(),
        "activeStreams": state.worker.active_session_count(),
    }))
    .into_response()
}

pub async fn stream_ingress(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let secret = header_str(&headers, HDR_INSTANCE_SECRET).unwrap_or_default();
    let metadata = match ChunkMetadata::from_lookup(|name| header_str(&headers, name)) {
        Ok(metadata) => metadata,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    match state
        .worker
        .handle_incoming_chunk(&task_id, secret, metadata, body)
        .await
    {
        Ok(ack) => Json(json!({
            "accepted": ack.accepted,
            "duplicate": !ack.accepted,
            "uploadedBytes": ack.uploaded_bytes,
            "lastChunkIndex": ack.last_chunk_index,
            "completed": ack.completed,
        }))
        .into_response(),
        Err(RelayError::Auth(message)) => {
            (StatusCode::UNAUTHORIZED, Json(json!({"error": message}))).into_response()
        }
        Err(e) => {
            warn!("Stream ingress for {} failed: {}", task_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

pub async fn stream_progress(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
) -> Response {
    match state.worker.get_progress(&task_id).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "No progress for task"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

pub async fn task_status(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    match state.state_sync.update_task_state(&task_id, body).await {
        Ok(()) => Json(json!({"accepted": true})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

pub async fn task_retry(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
) -> Response {
    match state.manager.retry_task(&task_id, "api").await {
        Ok(outcome) => {
            let status =
                StatusCode::from_u16(outcome.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                Json(json!({"success": outcome.success, "message": outcome.message})),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

pub async fn queue_intake(
    State(state): State<Arc<ApiState>>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = header_str(&headers, "signature").unwrap_or_default();
    let timestamp = header_str(&headers, "timestamp").unwrap_or_default();
    if !state
        .queue
        .verify_webhook_signature(signature, timestamp, &body)
    {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Bad webhook signature"})),
        )
            .into_response();
    }

    let envelope: Value = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("Malformed envelope: {}", e)})),
            )
                .into_response();
        }
    };

    // At-least-once transport: drop redeliveries inside the dedup window.
    if let Some(envelope_id) = envelope["_meta"]["envelope_id"].as_str() {
        if !state.queue.admit_envelope(envelope_id) {
            return Json(json!({"accepted": true, "deduplicated": true})).into_response();
        }
    }

    match topic.as_str() {
        TOPIC_STATE_SYNC => {
            match serde_json::from_value::<SyncEvent>(envelope.clone()) {
                Ok(event) => state.state_sync.handle_sync_event(&event),
                Err(e) => debug!("Unparseable state_sync event: {}", e),
            }
        }
        TOPIC_CACHE_SYNC => {
            match serde_json::from_value::<CacheChangeEvent>(envelope.clone()) {
                Ok(event) => state.consistent.handle_sync_event(&event),
                Err(e) => debug!("Unparseable cache_sync event: {}", e),
            }
        }
        TOPIC_DOWNLOAD | TOPIC_UPLOAD => {
            if let Some(task_id) = envelope["taskId"].as_str() {
                // Task-level dedup before admission: only one delivery of a
                // given (topic, task) registers inside the window.
                let registration = state
                    .dedup
                    .register_task(
                        json!({"taskId": task_id, "topic": topic}),
                        &crate::tasks::dedup::RegisterOptions {
                            dedup_key: Some(format!("{}:{}", topic, task_id)),
                            ..Default::default()
                        },
                    )
                    .await;
                match registration {
                    Ok(outcome) if !outcome.registered => {
                        return Json(json!({"accepted": true, "deduplicated": true}))
                            .into_response();
                    }
                    Err(e) => warn!("Dedup registration for {} failed: {}", task_id, e),
                    Ok(_) => {}
                }

                let upload = topic == TOPIC_UPLOAD;
                match state.manager.admit_from_envelope(task_id, upload).await {
                    Ok(true) => debug!("Admitted task {} to {} queue", task_id, topic),
                    Ok(false) => debug!("Task {} not admissible", task_id),
                    Err(e) => warn!("Admission of {} failed: {}", task_id, e),
                }
            }
        }
        other => debug!("Envelope on topic {} acknowledged", other),
    }

    Json(json!({"accepted": true})).into_response()
}
