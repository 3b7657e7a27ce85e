// Leader-side chunk forwarding
//
// The leader relays downloaded chunks to the worker behind the load
// balancer. A per-(task, chunk) retry counter caps redelivery attempts, and
// the worker's progress endpoint lets a resumed transfer skip chunks the
// worker already accepted.

use bytes::Bytes;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    ChunkMetadata, HDR_CHAT_ID, HDR_CHUNK_INDEX, HDR_FILE_NAME, HDR_INSTANCE_SECRET, HDR_IS_LAST,
    HDR_LEADER_URL, HDR_MSG_ID, HDR_SOURCE_INSTANCE_ID, HDR_TOTAL_SIZE, HDR_USER_ID,
};
use crate::config::StreamConfig;
use crate::error::{RelayError, Result};

/// Outcome of a forward attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Chunk delivered to the worker
    Sent,
    /// The worker already holds this chunk; nothing was sent
    SkippedAlreadyReceived,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteProgress {
    #[serde(rename = "lastChunkIndex")]
    pub last_chunk_index: Option<u64>,
    #[serde(rename = "uploadedBytes")]
    pub uploaded_bytes: u64,
}

pub struct StreamLeader {
    config: StreamConfig,
    http_client: reqwest::Client,
    /// Attempts per (task, chunk); cleared on success
    retry_counts: DashMap<(String, u64), u32>,
}

impl StreamLeader {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
            retry_counts: DashMap::new(),
        }
    }

    fn encode_file_name(name: &str) -> String {
        crate::cache::provider::encode_key(name)
    }

    /// Forward one chunk to `<target>/api/v2/stream/<taskId>`. Fails
    /// permanently once the per-chunk retry cap is reached.
    pub async fn forward_chunk(
        &self,
        target_base: &str,
        task_id: &str,
        bytes: Bytes,
        metadata: &ChunkMetadata,
    ) -> Result<ForwardOutcome> {
        let retry_key = (task_id.to_string(), metadata.chunk_index);
        let attempts = self.retry_counts.get(&retry_key).map(|c| *c).unwrap_or(0);
        if attempts >= self.config.chunk_retry_max {
            return Err(RelayError::Upload(format!(
                "Chunk {} of {} exhausted {} forward attempts",
                metadata.chunk_index, task_id, attempts
            )));
        }

        // A resumed transfer skips chunks the worker already accepted.
        if let Ok(Some(progress)) = self.get_remote_progress(target_base, task_id).await {
            if let Some(last) = progress.last_chunk_index {
                if metadata.chunk_index <= last {
                    debug!(
                        "Skipping chunk {} of {}; worker watermark is {}",
                        metadata.chunk_index, task_id, last
                    );
                    return Ok(ForwardOutcome::SkippedAlreadyReceived);
                }
            }
        }

        let url = format!(
            "{}/api/v2/stream/{}",
            target_base.trim_end_matches('/'),
            task_id
        );
        let request = self
            .http_client
            .post(&url)
            .header(HDR_INSTANCE_SECRET, &self.config.instance_secret)
            .header(HDR_FILE_NAME, Self::encode_file_name(&metadata.file_name))
            .header(HDR_USER_ID, &metadata.user_id)
            .header(HDR_IS_LAST, if metadata.is_last { "true" } else { "false" })
            .header(HDR_CHUNK_INDEX, metadata.chunk_index.to_string())
            .header(HDR_TOTAL_SIZE, metadata.total_size.to_string())
            .header(HDR_LEADER_URL, &metadata.leader_url)
            .header(HDR_SOURCE_INSTANCE_ID, &metadata.source_instance_id)
            .header(HDR_CHAT_ID, metadata.chat_id.to_string())
            .header(HDR_MSG_ID, metadata.msg_id.to_string())
            .body(bytes);

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                self.retry_counts.remove(&retry_key);
                Ok(ForwardOutcome::Sent)
            }
            Ok(response) => {
                self.note_attempt(retry_key, metadata.chunk_index, task_id);
                Err(RelayError::Network(format!(
                    "Chunk forward to {} returned {}",
                    url,
                    response.status()
                )))
            }
            Err(e) => {
                self.note_attempt(retry_key, metadata.chunk_index, task_id);
                Err(RelayError::Network(format!(
                    "Chunk forward to {} failed: {}",
                    url, e
                )))
            }
        }
    }

    fn note_attempt(&self, retry_key: (String, u64), chunk_index: u64, task_id: &str) {
        let mut count = self.retry_counts.entry(retry_key).or_insert(0);
        *count += 1;
        warn!(
            "Forward attempt {} failed for chunk {} of {}",
            *count, chunk_index, task_id
        );
    }

    /// Attempts recorded so far for a chunk.
    pub fn attempts_for(&self, task_id: &str, chunk_index: u64) -> u32 {
        self.retry_counts
            .get(&(task_id.to_string(), chunk_index))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Ask the worker for its accepted watermark.
    pub async fn get_remote_progress(
        &self,
        target_base: &str,
        task_id: &str,
    ) -> Result<Option<RemoteProgress>> {
        let url = format!(
            "{}/api/v2/stream/{}/progress",
            target_base.trim_end_matches('/'),
            task_id
        );
        let response = match self.http_client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Progress query to {} failed: {}", url, e);
                return Ok(None);
            }
        };
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Ok(None);
        }
        let progress: RemoteProgress = response
            .json()
            .await
            .map_err(|e| RelayError::Serialization(format!("Bad progress body: {}", e)))?;
        Ok(Some(progress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_cap_blocks_forward() {
        let leader = StreamLeader::new(StreamConfig {
            chunk_retry_max: 3,
            ..StreamConfig::default()
        });
        leader.retry_counts.insert(("t1".to_string(), 5), 3);

        let metadata = ChunkMetadata {
            file_name: "f.bin".to_string(),
            user_id: "u1".to_string(),
            is_last: false,
            chunk_index: 5,
            total_size: 0,
            leader_url: String::new(),
            source_instance_id: String::new(),
            chat_id: 0,
            msg_id: 0,
        };

        let result = tokio_test::block_on(leader.forward_chunk(
            "http://worker",
            "t1",
            Bytes::from_static(b"x"),
            &metadata,
        ));
        assert!(matches!(result, Err(RelayError::Upload(_))));
    }

    #[test]
    fn test_attempts_accounting() {
        let leader = StreamLeader::new(StreamConfig::default());
        assert_eq!(leader.attempts_for("t1", 0), 0);
        leader.note_attempt(("t1".to_string(), 0), 0, "t1");
        leader.note_attempt(("t1".to_string(), 0), 0, "t1");
        assert_eq!(leader.attempts_for("t1", 0), 2);
        assert_eq!(leader.attempts_for("t1", 1), 0);
    }

    #[test]
    fn test_file_name_encoding() {
        assert_eq!(StreamLeader::encode_file_name("a b.mp4"), "a%20b.mp4");
    }
}
