//! Upstash Redis REST adapter
//!
//! Implements the provider capability set over the Upstash path-style REST
//! protocol. Commands are encoded as URL segments; responses come back as a
//! `{"result": ...}` envelope. Key listing walks SCAN cursors.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::provider::{classify_status, encode_key, KvProvider};
use crate::error::{RelayError, Result};

/// Upstash Redis configuration
#[derive(Debug, Clone)]
pub struct RedisRestConfig {
    /// REST endpoint, e.g. `https://<db>.upstash.io`
    pub url: String,
    pub token: String,
    pub request_timeout: Duration,
    /// COUNT hint per SCAN page
    pub scan_count: usize,
}

impl Default for RedisRestConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            request_timeout: Duration::from_secs(10),
            scan_count: 100,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    result: Value,
}

/// Upstash Redis REST provider
pub struct RedisRestStore {
    config: RedisRestConfig,
    http_client: reqwest::Client,
}

impl RedisRestStore {
    pub fn new(config: RedisRestConfig) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        let bearer = format!("Bearer {}", config.token);
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

    fn command_url(&self, segments: &[&str]) -> String {
        let mut url = self.config.url.trim_end_matches('/').to_string();
        for segment in segments {
            url.push('/');
            url.push_str(&encode_key(segment));
        }
        url
    }

    async fn run_command(&self, segments: &[&str]) -> Result<Value> {
        let response = self
            .http_client
            .get(self.command_url(segments))
            .send()
            .await
            .map_err(|e| RelayError::Network(format!("Upstash request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body)
                .into_error(format!("Upstash returned {}: {}", status, body)));
        }

        let envelope: CommandResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Serialization(format!("Upstash parse failed: {}", e)))?;
        Ok(envelope.result)
    }
}

#[async_trait]
impl KvProvider for RedisRestStore {
    fn name(&self) -> &str {
        "Upstash Redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.run_command(&["get", key]).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let result = match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1).to_string();
                self.run_command(&["set", key, value, "EX", &secs]).await?
            }
            None => self.run_command(&["set", key, value]).await?,
        };

        match result {
            Value::String(s) if s == "OK" => Ok(()),
            other => Err(RelayError::Internal(format!(
                "Upstash SET returned unexpected result: {}",
                other
            ))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        // DEL returns the number of removed keys; 0 for an absent key is fine.
        self.run_command(&["del", key]).await?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}*", prefix);
        let count = self.config.scan_count.to_string();
        let mut names = Vec::new();
        let mut cursor = "0".to_string();

        loop {
            let result = self
                .run_command(&["scan", &cursor, "match", &pattern, "count", &count])
                .await?;

            // SCAN replies [next_cursor, [keys...]]
            let parts = result.as_array().ok_or_else(|| {
                RelayError::Serialization("Upstash SCAN reply was not an array".to_string())
            })?;
            if parts.len() != 2 {
                return Err(RelayError::Serialization(format!(
                    "Upstash SCAN reply had {} elements",
                    parts.len()
                )));
            }

            cursor = match &parts[0] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };

            if let Some(page) = parts[1].as_array() {
                for key in page {
                    if let Some(name) = key.as_str() {
                        names.push(name.to_string());
                    }
                }
            }

            if cursor == "0" {
                break;
            }
        }

        Ok(names)
    }
}
