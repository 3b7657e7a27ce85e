// # Task Layer
//
// Idempotent task registration and deduplication, process-local task
// lifecycle management, prioritized batch execution, and media-group
// coalescing. External collaborators (the SQL task repository, the chat
// platform, the cloud storage backend, the queue transport) appear only as
// seam traits here.

pub mod batch;
pub mod dedup;
pub mod manager;
pub mod media_group;

pub use batch::{BatchPriority, BatchProcessor, BatchRecord, BatchStatus};
pub use dedup::{DedupStatus, TaskDeduplicator};
pub use manager::{TaskManager, TaskManagerConfig};
pub use media_group::{AddOutcome, MediaGroup, MediaGroupBuffer};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::error::Result;

/// Task lifecycle states mirrored between the SQL store and the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Downloading,
    Downloaded,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

/// One unit of relay work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub user_id: String,
    pub chat_id: i64,
    pub msg_id: i64,
    pub source_msg_id: i64,
    pub file_name: String,
    pub file_size: u64,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    pub attempts: u32,
}

/// Authoritative task store (SQL in production).
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error_msg: Option<&str>,
    ) -> Result<()>;

    async fn set_claimed_by(&self, task_id: &str, instance_id: Option<&str>) -> Result<()>;
}

/// Upstream chat platform, seen only through the operations the relay needs.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Fetch the message a task was created from; `None` when it is gone.
    async fn fetch_source_message(&self, chat_id: i64, msg_id: i64) -> Result<Option<Value>>;

    /// Edit the user-facing progress message.
    async fn edit_progress_message(&self, chat_id: i64, msg_id: i64, text: &str) -> Result<()>;
}

/// Cloud storage backend reached through the streaming uploader.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Whether the remote already holds a file by this name.
    async fn exists(&self, file_name: &str) -> Result<bool>;

    /// Upload a staged local file.
    async fn upload_file(&self, local_path: &Path, remote_name: &str) -> Result<()>;

    /// List remote names under a prefix, used for post-upload verification.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Outbound task queue seam; `QueueService` is the production implementation.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue_download(&self, task_id: &str, data: Value) -> Result<()>;

    async fn enqueue_upload(&self, task_id: &str, data: Value) -> Result<()>;
}

#[async_trait]
impl TaskQueue for crate::queue::QueueService {
    async fn enqueue_download(&self, task_id: &str, data: Value) -> Result<()> {
        self.enqueue_download_task(task_id, data).await
    }

    async fn enqueue_upload(&self, task_id: &str, data: Value) -> Result<()> {
        self.enqueue_upload_task(task_id, data).await
    }
}
