// # Media Relay Load Balancer
//
// Standalone frontend: verifies signed webhooks, discovers active instances
// from the coordination store, and forwards with round-robin plus retry.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{error, info};

use media_relay::balancer::{FailoverStore, LoadBalancer};
use media_relay::cache::cloud_kv::{CloudKvConfig, CloudKvStore};
use media_relay::cache::redis_rest::{RedisRestConfig, RedisRestStore};
use media_relay::cache::KvProvider;
use media_relay::config::{BalancerConfig, SigningKeys};
use media_relay::shutdown::GracefulShutdown;
use media_relay::VERSION;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

async fn ingress(
    State(lb): State<Arc<LoadBalancer>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let response = lb
        .handle_webhook(
            uri.path(),
            header("signature"),
            header("timestamp"),
            body,
            header("x-forwarded-for").unwrap_or("unknown"),
            header("host").unwrap_or("unknown"),
            "https",
        )
        .await;

    (
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        response.body,
    )
        .into_response()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    info!("Media Relay load balancer starting");
    info!("Version: {}", VERSION);

    let primary: Arc<dyn KvProvider> = Arc::new(CloudKvStore::new(CloudKvConfig {
        account_id: env_or("CF_ACCOUNT_ID", ""),
        namespace_id: env_or("CF_KV_NAMESPACE_ID", ""),
        api_token: env_or("CF_API_TOKEN", ""),
        ..CloudKvConfig::default()
    }));
    let upstash_url = env_or("UPSTASH_REDIS_REST_URL", "");
    let secondary: Option<Arc<dyn KvProvider>> = if upstash_url.is_empty() {
        None
    } else {
        Some(Arc::new(RedisRestStore::new(RedisRestConfig {
            url: upstash_url,
            token: env_or("UPSTASH_REDIS_REST_TOKEN", ""),
            ..RedisRestConfig::default()
        })))
    };

    let mut config = BalancerConfig::default();
    config.listen_addr = env_or("LB_LISTEN_ADDR", &config.listen_addr);
    config.signing_keys = SigningKeys::new(
        env_or("RELAY_SIGNING_KEY", ""),
        env_or("RELAY_SIGNING_KEY_NEXT", ""),
    );

    let store = FailoverStore::new(primary, secondary, config.store_failure_threshold);
    let listen_addr = config.listen_addr.clone();
    let lb = Arc::new(LoadBalancer::new(store, config));

    let router = Router::new().fallback(ingress).with_state(lb);

    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Bind {} failed: {}", listen_addr, e);
            std::process::exit(1);
        }
    };
    info!("Load balancer listening on {}", listen_addr);

    let shutdown = Arc::new(GracefulShutdown::new(Default::default()));
    let signal_shutdown = Arc::clone(&shutdown);
    let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
        signal_shutdown.wait_for_signal().await;
    });

    let code = match serve.await {
        Ok(()) => shutdown.shutdown("signal", None).await,
        Err(e) => {
            error!("Load balancer server error: {}", e);
            shutdown.shutdown("http-server", Some(&e.to_string())).await
        }
    };
    std::process::exit(code);
}
