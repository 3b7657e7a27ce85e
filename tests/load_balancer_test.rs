// Load balancer scenarios: signed webhook forwarded to an active instance,
// no-instance 503, and retry onto the next instance when one is down.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Router;
use chrono::Utc;
use common::MemoryKv;
use media_relay::balancer::signature::compute_signature;
use media_relay::balancer::{FailoverStore, LoadBalancer};
use media_relay::cache::KvProvider;
use media_relay::config::{BalancerConfig, SigningKeys};
use media_relay::coordination::{InstanceRecord, InstanceStatus};

async fn spawn_instance(hits: Arc<AtomicUsize>) -> String {
    let app = Router::new().fallback(move |body: Bytes| {
        let hits = Arc::clone(&hits);
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            (StatusCode::OK, format!("echo:{}", body.len())).into_response()
        }
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn register_instance(kv: &Arc<MemoryKv>, id: &str, url: &str) {
    let record = InstanceRecord {
        id: id.to_string(),
        url: url.to_string(),
        hostname: "test".to_string(),
        region: "test".to_string(),
        started_at: Utc::now(),
        last_heartbeat: Utc::now(),
        status: InstanceStatus::Active,
    };
    kv.store.insert(
        format!("instance:{}", id),
        serde_json::to_string(&record).unwrap(),
    );
}

fn balancer(kv: &Arc<MemoryKv>) -> LoadBalancer {
    let store = FailoverStore::new(
        Arc::clone(kv) as Arc<dyn KvProvider>,
        None,
        3,
    );
    let mut config = BalancerConfig::default();
    config.signing_keys = SigningKeys::new("lb-key", "rotating-key");
    config.forward_timeout = std::time::Duration::from_secs(2);
    LoadBalancer::new(store, config)
}

#[tokio::test]
async fn signed_webhook_forwarded_to_active_instance() {
    let kv = MemoryKv::new("memory");
    let hits = Arc::new(AtomicUsize::new(0));
    let url = spawn_instance(Arc::clone(&hits)).await;
    register_instance(&kv, "i1", &url);

    let lb = balancer(&kv);
    let body = Bytes::from_static(b"data");
    let signature = compute_signature("lb-key", "1700000000", &body);

    let response = lb
        .handle_webhook(
            "/api/tasks/download",
            Some(&signature),
            Some("1700000000"),
            body,
            "1.2.3.4",
            "relay.example",
            "https",
        )
        .await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"echo:4");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rotated_key_still_verifies() {
    let kv = MemoryKv::new("memory");
    let hits = Arc::new(AtomicUsize::new(0));
    let url = spawn_instance(hits).await;
    register_instance(&kv, "i1", &url);

    let lb = balancer(&kv);
    let body = Bytes::from_static(b"data");
    // Signed with the next key instead of the current one.
    let signature = compute_signature("rotating-key", "1700000000", &body);

    let response = lb
        .handle_webhook(
            "/api/tasks/download",
            Some(&signature),
            Some("1700000000"),
            body,
            "1.2.3.4",
            "relay.example",
            "https",
        )
        .await;
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn no_active_instances_returns_503() {
    let kv = MemoryKv::new("memory");
    let lb = balancer(&kv);
    let body = Bytes::from_static(b"data");
    let signature = compute_signature("lb-key", "1700000000", &body);

    let response = lb
        .handle_webhook(
            "/api/tasks/download",
            Some(&signature),
            Some("1700000000"),
            body,
            "1.2.3.4",
            "relay.example",
            "https",
        )
        .await;
    assert_eq!(response.status, 503);
}

#[tokio::test]
async fn down_instance_falls_through_to_healthy_one() {
    let kv = MemoryKv::new("memory");
    let hits = Arc::new(AtomicUsize::new(0));
    let healthy_url = spawn_instance(Arc::clone(&hits)).await;

    // "a-down" sorts first so round-robin index 0 hits it first.
    register_instance(&kv, "a-down", "http://127.0.0.1:1");
    register_instance(&kv, "b-healthy", &healthy_url);

    let lb = balancer(&kv);
    let body = Bytes::from_static(b"data");
    let signature = compute_signature("lb-key", "1700000000", &body);

    let response = lb
        .handle_webhook(
            "/api/tasks/download",
            Some(&signature),
            Some("1700000000"),
            body,
            "1.2.3.4",
            "relay.example",
            "https",
        )
        .await;

    assert_eq!(response.status, 200);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bad_signature_returns_500_by_design() {
    let kv = MemoryKv::new("memory");
    let hits = Arc::new(AtomicUsize::new(0));
    let url = spawn_instance(Arc::clone(&hits)).await;
    register_instance(&kv, "i1", &url);

    let lb = balancer(&kv);
    let response = lb
        .handle_webhook(
            "/api/tasks/download",
            Some("v1a=Zm9yZ2Vk"),
            Some("1700000000"),
            Bytes::from_static(b"data"),
            "1.2.3.4",
            "relay.example",
            "https",
        )
        .await;

    assert_eq!(response.status, 500);
    // Nothing was forwarded.
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}
