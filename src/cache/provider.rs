// # L2 Provider Adapter Seam
//
// Uniform capability set over the external KV backends. Reads are an
// explicit sum: `Ok(Some(v))` hit, `Ok(None)` miss, `Err` carrying a
// classified kind so the cache service can branch fail-over decisions on it.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Classified provider failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvErrorKind {
    QuotaExhausted,
    RateLimit,
    Network,
    Auth,
    NotFound,
    Other,
}

impl KvErrorKind {
    /// Map a classified kind into the crate error taxonomy.
    pub fn into_error(self, message: impl Into<String>) -> RelayError {
        let message = message.into();
        match self {
            KvErrorKind::QuotaExhausted => RelayError::QuotaExhausted(message),
            KvErrorKind::RateLimit => RelayError::RateLimited(message),
            KvErrorKind::Network => RelayError::Network(message),
            KvErrorKind::Auth => RelayError::Auth(message),
            KvErrorKind::NotFound => RelayError::NotFound(message),
            KvErrorKind::Other => RelayError::Internal(message),
        }
    }
}

/// Classify an HTTP status from a KV backend.
pub fn classify_status(status: http::StatusCode, body: &str) -> KvErrorKind {
    if status == http::StatusCode::TOO_MANY_REQUESTS {
        return KvErrorKind::RateLimit;
    }
    if status == http::StatusCode::UNAUTHORIZED || status == http::StatusCode::FORBIDDEN {
        // Quota refusals come back as 403 with a telltale body on some plans.
        if body_mentions_quota(body) {
            return KvErrorKind::QuotaExhausted;
        }
        return KvErrorKind::Auth;
    }
    if status == http::StatusCode::NOT_FOUND {
        return KvErrorKind::NotFound;
    }
    if status == http::StatusCode::PAYMENT_REQUIRED || body_mentions_quota(body) {
        return KvErrorKind::QuotaExhausted;
    }
    if status.is_server_error() {
        return KvErrorKind::Network;
    }
    KvErrorKind::Other
}

fn body_mentions_quota(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("quota") || lower.contains("free usage limit") || lower.contains("max requests")
}

/// Percent-encode a key for use in a URL path segment.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Uniform capability set over an external KV backend.
#[async_trait]
pub trait KvProvider: Send + Sync {
    /// Human-readable provider name, e.g. "Cloudflare KV".
    fn name(&self) -> &str;

    /// Read a key. `Ok(None)` is a miss, never an error.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a key with an optional TTL in seconds granularity.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// List key names under a prefix.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Release any held connections. Idempotent.
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        assert_eq!(
            classify_status(http::StatusCode::TOO_MANY_REQUESTS, ""),
            KvErrorKind::RateLimit
        );
    }

    #[test]
    fn test_classify_quota_body() {
        assert_eq!(
            classify_status(http::StatusCode::FORBIDDEN, "free usage limit exceeded"),
            KvErrorKind::QuotaExhausted
        );
        assert_eq!(
            classify_status(http::StatusCode::OK, "daily quota reached"),
            KvErrorKind::QuotaExhausted
        );
    }

    #[test]
    fn test_classify_auth_and_missing() {
        assert_eq!(
            classify_status(http::StatusCode::UNAUTHORIZED, "bad token"),
            KvErrorKind::Auth
        );
        assert_eq!(
            classify_status(http::StatusCode::NOT_FOUND, ""),
            KvErrorKind::NotFound
        );
    }

    #[test]
    fn test_classify_server_error_is_network() {
        assert_eq!(
            classify_status(http::StatusCode::BAD_GATEWAY, ""),
            KvErrorKind::Network
        );
    }

    #[test]
    fn test_encode_key() {
        assert_eq!(encode_key("instance:abc-1"), "instance%3Aabc-1");
        assert_eq!(encode_key("plain_key.0~x"), "plain_key.0~x");
    }

    #[test]
    fn test_kind_to_error_retryability() {
        assert!(KvErrorKind::QuotaExhausted.into_error("x").is_retryable_kv());
        assert!(KvErrorKind::RateLimit.into_error("x").is_retryable_kv());
        assert!(KvErrorKind::Network.into_error("x").is_retryable_kv());
        assert!(!KvErrorKind::Auth.into_error("x").is_retryable_kv());
        assert!(!KvErrorKind::NotFound.into_error("x").is_retryable_kv());
    }
}
