//! Cloudflare Workers KV adapter
//!
//! Implements the provider capability set over the Cloudflare KV REST API.
//! Values live in a single namespace; TTLs map to `expiration_ttl` and key
//! listing pages through the cursor protocol.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::provider::{classify_status, encode_key, KvProvider};
use crate::error::{RelayError, Result};

/// Cloudflare KV configuration
#[derive(Debug, Clone)]
pub struct CloudKvConfig {
    /// API endpoint; overridable for tests
    pub api_base: String,
    pub account_id: String,
    pub namespace_id: String,
    pub api_token: String,
    pub request_timeout: Duration,
}

impl Default for CloudKvConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.cloudflare.com/client/v4".to_string(),
            account_id: String::new(),
            namespace_id: String::new(),
            api_token: String::new(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    result: Vec<ListedKey>,
    #[serde(default)]
    result_info: Option<ListResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ListedKey {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ListResultInfo {
    #[serde(default)]
    cursor: Option<String>,
}

/// Cloudflare KV provider
pub struct CloudKvStore {
    config: CloudKvConfig,
    http_client: reqwest::Client,
}

impl CloudKvStore {
    pub fn new(config: CloudKvConfig) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        let bearer = format!("Bearer {}", config.api_token);
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&bearer) {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();

        Self {
            config,
            http_client,
        }
    }

    fn value_url(&self, key: &str) -> String {
        format!(
            "{}/accounts/{}/storage/kv/namespaces/{}/values/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_id,
            self.config.namespace_id,
            encode_key(key)
        )
    }

    fn keys_url(&self, prefix: &str, cursor: Option<&str>) -> String {
        let mut url = format!(
            "{}/accounts/{}/storage/kv/namespaces/{}/keys?prefix={}",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_id,
            self.config.namespace_id,
            encode_key(prefix)
        );
        if let Some(cursor) = cursor {
            url.push_str("&cursor=");
            url.push_str(cursor);
        }
        url
    }

    async fn error_from_response(&self, response: reqwest::Response) -> RelayError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_status(status, &body)
            .into_error(format!("Cloudflare KV returned {}: {}", status, body))
    }
}

#[async_trait]
impl KvProvider for CloudKvStore {
    fn name(&self) -> &str {
        "Cloudflare KV"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let response = self
            .http_client
            .get(self.value_url(key))
            .send()
            .await
            .map_err(|e| RelayError::Network(format!("Cloudflare KV request failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        let body = response
            .text()
            .await
            .map_err(|e| RelayError::Network(format!("Cloudflare KV body read failed: {}", e)))?;
        Ok(Some(body))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut url = self.value_url(key);
        if let Some(ttl) = ttl {
            // KV rejects expirations under a minute.
            let secs = ttl.as_secs().max(60);
            url.push_str(&format!("?expiration_ttl={}", secs));
        }

        let response = self
            .http_client
            .put(url)
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| RelayError::Network(format!("Cloudflare KV request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self
            .http_client
            .delete(self.value_url(key))
            .send()
            .await
            .map_err(|e| RelayError::Network(format!("Cloudflare KV request failed: {}", e)))?;

        // Deleting an absent key is a no-op, not an error.
        if response.status() == reqwest::StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }
        Err(self.error_from_response(response).await)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let response = self
                .http_client
                .get(self.keys_url(prefix, cursor.as_deref()))
                .send()
                .await
                .map_err(|e| RelayError::Network(format!("Cloudflare KV request failed: {}", e)))?;

            if !response.status().is_success() {
                return Err(self.error_from_response(response).await);
            }

            let page: ListResponse = response.json().await.map_err(|e| {
                RelayError::Serialization(format!("Cloudflare KV list parse failed: {}", e))
            })?;

            names.extend(page.result.into_iter().map(|k| k.name));

            cursor = page
                .result_info
                .and_then(|info| info.cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }

        Ok(names)
    }
}
