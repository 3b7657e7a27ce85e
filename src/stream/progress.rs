// Resumable stream progress
//
// Progress records under `stream:progress:<taskId>` let a transfer resume
// after a worker restart or hand-off: the leader asks for the last accepted
// chunk index and skips everything at or below it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheReadOptions, CacheService, CacheWriteOptions};
use crate::error::Result;

pub const PROGRESS_PREFIX: &str = "stream:progress:";

/// Persisted transfer progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamProgress {
    pub task_id: String,
    pub file_name: String,
    pub uploaded_bytes: u64,
    /// Highest chunk index accepted so far
    pub last_chunk_index: Option<u64>,
    pub total_size: u64,
    /// Milliseconds since the epoch
    pub updated_at: i64,
}

impl StreamProgress {
    /// Completion ratio in [0, 1], when the total size is known.
    pub fn ratio(&self) -> Option<f64> {
        if self.total_size == 0 {
            return None;
        }
        Some((self.uploaded_bytes as f64 / self.total_size as f64).min(1.0))
    }
}

/// Store wrapper for progress records.
pub struct ProgressStore {
    cache: Arc<CacheService>,
    ttl: Duration,
}

impl ProgressStore {
    pub fn new(cache: Arc<CacheService>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    fn key(task_id: &str) -> String {
        format!("{}{}", PROGRESS_PREFIX, task_id)
    }

    pub async fn save(&self, progress: &StreamProgress) -> Result<()> {
        self.cache
            .set_json(
                &Self::key(&progress.task_id),
                progress,
                Some(self.ttl),
                &CacheWriteOptions {
                    skip_l1: true,
                    skip_ttl_randomization: true,
                    ..CacheWriteOptions::default()
                },
            )
            .await
    }

    pub async fn load(&self, task_id: &str) -> Result<Option<StreamProgress>> {
        self.cache
            .get_json(
                &Self::key(task_id),
                &CacheReadOptions {
                    skip_l1: true,
                    ..CacheReadOptions::default()
                },
            )
            .await
    }

    /// Progress to resume from, if any was saved.
    pub async fn resume_task(&self, task_id: &str) -> Result<Option<StreamProgress>> {
        self.load(task_id).await
    }

    /// Forget a task's progress; the next transfer starts from scratch.
    pub async fn reset_task(&self, task_id: &str) -> Result<()> {
        self.cache.delete(&Self::key(task_id)).await
    }
}
