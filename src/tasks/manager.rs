// Task Manager
//
// Process-local view of relay work: the download slot, upload workers, and
// waiting queues, plus the upload pipeline itself. Task state transitions on
// the authoritative store are serialized by the per-task distributed lock;
// only the lock holder moves a task. The lock is released and the staged
// local file removed on every exit path.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ChatClient, RemoteStorage, TaskQueue, TaskRecord, TaskRepository, TaskStatus};
use crate::coordination::InstanceCoordinator;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    /// Directory where downloaded files are staged before upload
    pub staging_dir: PathBuf,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("./staging"),
        }
    }
}

/// Outcome of an upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// File streamed to the remote and verified present
    Uploaded,
    /// Remote already had the file; nothing to do
    AlreadyPresent,
    /// Another instance holds the task lock
    LockBusy,
    /// Task was cancelled before or during the upload
    Cancelled,
    Failed(String),
}

/// Outcome of a retry request, shaped for the HTTP surface.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub success: bool,
    pub status_code: u16,
    pub message: String,
}

impl RetryOutcome {
    fn new(success: bool, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            success,
            status_code,
            message: message.into(),
        }
    }
}

struct ManagerState {
    waiting_tasks: VecDeque<TaskRecord>,
    current_task: Option<String>,
    waiting_upload_tasks: VecDeque<TaskRecord>,
    processing_upload_tasks: HashSet<String>,
    completed_tasks: Vec<String>,
    cancelled_task_ids: HashSet<String>,
}

pub struct TaskManager {
    coordinator: Arc<InstanceCoordinator>,
    repository: Arc<dyn TaskRepository>,
    storage: Arc<dyn RemoteStorage>,
    chat: Arc<dyn ChatClient>,
    queue: Arc<dyn TaskQueue>,
    config: TaskManagerConfig,
    state: Mutex<ManagerState>,
}

impl TaskManager {
    pub fn new(
        coordinator: Arc<InstanceCoordinator>,
        repository: Arc<dyn TaskRepository>,
        storage: Arc<dyn RemoteStorage>,
        chat: Arc<dyn ChatClient>,
        queue: Arc<dyn TaskQueue>,
        config: TaskManagerConfig,
    ) -> Self {
        Self {
            coordinator,
            repository,
            storage,
            chat,
            queue,
            config,
            state: Mutex::new(ManagerState {
                waiting_tasks: VecDeque::new(),
                current_task: None,
                waiting_upload_tasks: VecDeque::new(),
                processing_upload_tasks: HashSet::new(),
                completed_tasks: Vec::new(),
                cancelled_task_ids: HashSet::new(),
            }),
        }
    }

    /// Staged local path for a task's file.
    pub fn local_path(&self, file_name: &str) -> PathBuf {
        self.config.staging_dir.join(file_name)
    }

    /// Active work: the download slot plus in-flight uploads.
    pub fn processing_count(&self) -> usize {
        let state = self.state.lock();
        usize::from(state.current_task.is_some()) + state.processing_upload_tasks.len()
    }

    pub fn waiting_count(&self) -> usize {
        let state = self.state.lock();
        state.waiting_tasks.len() + state.waiting_upload_tasks.len()
    }

    pub fn completed_count(&self) -> usize {
        self.state.lock().completed_tasks.len()
    }

    /// Queue a task for download on this instance.
    pub fn admit_download(&self, task: TaskRecord) {
        self.state.lock().waiting_tasks.push_back(task);
    }

    /// Claim the download slot with the next waiting task.
    pub fn start_next_download(&self) -> Option<TaskRecord> {
        let mut state = self.state.lock();
        if state.current_task.is_some() {
            return None;
        }
        let task = state.waiting_tasks.pop_front()?;
        state.current_task = Some(task.id.clone());
        Some(task)
    }

    /// Release the download slot; a successful download queues the upload.
    pub fn finish_download(&self, task: TaskRecord, success: bool) {
        let mut state = self.state.lock();
        if state.current_task.as_deref() == Some(task.id.as_str()) {
            state.current_task = None;
        }
        if success {
            state.waiting_upload_tasks.push_back(task);
        }
    }

    pub fn admit_upload(&self, task: TaskRecord) {
        self.state.lock().waiting_upload_tasks.push_back(task);
    }

    pub fn next_upload(&self) -> Option<TaskRecord> {
        self.state.lock().waiting_upload_tasks.pop_front()
    }

    /// Admit a task delivered by the queue transport into the local queues.
    /// Returns false when the repository no longer knows the task.
    pub async fn admit_from_envelope(&self, task_id: &str, upload: bool) -> Result<bool> {
        let Some(task) = self.repository.get_task(task_id).await? else {
            return Ok(false);
        };
        if matches!(task.status, TaskStatus::Completed | TaskStatus::Cancelled) {
            return Ok(false);
        }
        if upload {
            self.admit_upload(task);
        } else {
            self.admit_download(task);
        }
        Ok(true)
    }

    /// Request cooperative cancellation.
    pub fn cancel_task(&self, task_id: &str) {
        self.state
            .lock()
            .cancelled_task_ids
            .insert(task_id.to_string());
    }

    pub fn is_cancelled(&self, task_id: &str) -> bool {
        self.state.lock().cancelled_task_ids.contains(task_id)
    }

    /// Upload a staged task to the remote. Holds the task lock for the whole
    /// pipeline; releases it and removes the local file on every exit.
    pub async fn upload_task(&self, task: &TaskRecord) -> Result<UploadOutcome> {
        if !self.coordinator.acquire_task_lock(&task.id).await? {
            debug!("Task {} locked elsewhere; skipping upload", task.id);
            return Ok(UploadOutcome::LockBusy);
        }

        {
            let mut state = self.state.lock();
            state.processing_upload_tasks.insert(task.id.clone());
        }

        let outcome = self.run_upload(task).await;

        // Cleanup happens regardless of the pipeline outcome.
        if let Err(e) = self.coordinator.release_task_lock(&task.id).await {
            warn!("Releasing task lock {} failed: {}", task.id, e);
        }
        let local_path = self.local_path(&task.file_name);
        if let Err(e) = tokio::fs::remove_file(&local_path).await {
            debug!("Local file {} removal: {}", local_path.display(), e);
        }
        {
            let mut state = self.state.lock();
            state.processing_upload_tasks.remove(&task.id);
            if matches!(
                outcome,
                Ok(UploadOutcome::Uploaded) | Ok(UploadOutcome::AlreadyPresent)
            ) {
                state.completed_tasks.push(task.id.clone());
            }
        }

        outcome
    }

    async fn run_upload(&self, task: &TaskRecord) -> Result<UploadOutcome> {
        if self.is_cancelled(&task.id) {
            self.repository
                .update_status(&task.id, TaskStatus::Cancelled, None)
                .await?;
            return Ok(UploadOutcome::Cancelled);
        }

        let local_path = self.local_path(&task.file_name);
        let size = match tokio::fs::metadata(&local_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if size == 0 {
            let message = "Local file missing or empty";
            self.repository
                .update_status(&task.id, TaskStatus::Failed, Some(message))
                .await?;
            return Ok(UploadOutcome::Failed(message.to_string()));
        }

        // Idempotence short-circuit: a previous attempt may have finished.
        if self.storage.exists(&task.file_name).await? {
            info!("Remote already has {}; marking {} completed", task.file_name, task.id);
            self.repository
                .update_status(&task.id, TaskStatus::Completed, None)
                .await?;
            return Ok(UploadOutcome::AlreadyPresent);
        }

        if self.is_cancelled(&task.id) {
            self.repository
                .update_status(&task.id, TaskStatus::Cancelled, None)
                .await?;
            return Ok(UploadOutcome::Cancelled);
        }

        self.repository
            .update_status(&task.id, TaskStatus::Uploading, None)
            .await?;

        match self.storage.upload_file(&local_path, &task.file_name).await {
            Ok(()) => {
                // Integrity check: the remote listing must show the file.
                let listed = self.storage.list(&task.file_name).await?;
                if listed.iter().any(|name| name == &task.file_name) {
                    self.repository
                        .update_status(&task.id, TaskStatus::Completed, None)
                        .await?;
                    Ok(UploadOutcome::Uploaded)
                } else {
                    let message = "Upload finished but remote listing does not show the file";
                    self.repository
                        .update_status(&task.id, TaskStatus::Failed, Some(message))
                        .await?;
                    Ok(UploadOutcome::Failed(message.to_string()))
                }
            }
            Err(e) => {
                let message = format!("Upload failed: {}", e);
                self.repository
                    .update_status(&task.id, TaskStatus::Failed, Some(&message))
                    .await?;
                Ok(UploadOutcome::Failed(message))
            }
        }
    }

    /// Re-enqueue a task. Completed and cancelled tasks are refused; an
    /// upload task whose staged file is gone falls back to a fresh download.
    pub async fn retry_task(&self, task_id: &str, source: &str) -> Result<RetryOutcome> {
        let Some(task) = self.repository.get_task(task_id).await? else {
            return Ok(RetryOutcome::new(false, 404, "Task not found"));
        };
        match task.status {
            TaskStatus::Completed => {
                return Ok(RetryOutcome::new(false, 400, "Task already completed"));
            }
            TaskStatus::Cancelled => {
                return Ok(RetryOutcome::new(false, 400, "Task cancelled"));
            }
            _ => {}
        }

        if !self.coordinator.acquire_task_lock(task_id).await? {
            return Ok(RetryOutcome::new(
                false,
                409,
                "Task locked by another instance",
            ));
        }

        let outcome = self.run_retry(&task, source).await;

        if let Err(e) = self.coordinator.release_task_lock(task_id).await {
            warn!("Releasing task lock {} failed: {}", task_id, e);
        }
        outcome
    }

    async fn run_retry(&self, task: &TaskRecord, source: &str) -> Result<RetryOutcome> {
        let message = self
            .chat
            .fetch_source_message(task.chat_id, task.source_msg_id)
            .await?;
        if message.is_none() {
            return Ok(RetryOutcome::new(false, 404, "Source message not found"));
        }

        let payload = json!({
            "chatId": task.chat_id,
            "msgId": task.msg_id,
            "fileName": task.file_name,
            "retrySource": source,
        });

        let is_upload_stage =
            matches!(task.status, TaskStatus::Downloaded | TaskStatus::Uploading);
        if is_upload_stage {
            let staged = tokio::fs::metadata(self.local_path(&task.file_name))
                .await
                .map(|m| m.len() > 0)
                .unwrap_or(false);
            if staged {
                self.queue.enqueue_upload(&task.id, payload).await?;
                return Ok(RetryOutcome::new(true, 200, "Task re-enqueued for upload"));
            }
            // Staged file is gone; the upload cannot resume.
            info!(
                "Local file for {} missing; retrying from download",
                task.id
            );
            self.repository
                .update_status(&task.id, TaskStatus::Queued, None)
                .await?;
            self.queue.enqueue_download(&task.id, payload).await?;
            return Ok(RetryOutcome::new(
                true,
                200,
                "Task re-enqueued as download (local file missing)",
            ));
        }

        self.repository
            .update_status(&task.id, TaskStatus::Queued, None)
            .await?;
        self.queue.enqueue_download(&task.id, payload).await?;
        Ok(RetryOutcome::new(true, 200, "Task re-enqueued for download"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::provider::KvProvider;
    use crate::cache::CacheService;
    use crate::config::{CacheTierConfig, CoordinatorConfig};
    use async_trait::async_trait;
    use chrono::Utc;
    use dashmap::DashMap;
    use serde_json::Value;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct MemoryKv {
        store: DashMap<String, String>,
    }

    #[async_trait]
    impl KvProvider for MemoryKv {
        fn name(&self) -> &str {
            "memory"
        }
        async fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.store.get(key).map(|v| v.clone()))
        }
        async fn set(&self, key: &str, value: &str, _ttl: Option<Duration>) -> Result<()> {
            self.store.insert(key.to_string(), value.to_string());
            Ok(())
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.store.remove(key);
            Ok(())
        }
        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .store
                .iter()
                .map(|e| e.key().clone())
                .filter(|k| k.starts_with(prefix))
                .collect())
        }
    }

    struct MockRepository {
        tasks: DashMap<String, TaskRecord>,
    }

    #[async_trait]
    impl TaskRepository for MockRepository {
        async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
            Ok(self.tasks.get(task_id).map(|t| t.clone()))
        }
        async fn update_status(
            &self,
            task_id: &str,
            status: TaskStatus,
            error_msg: Option<&str>,
        ) -> Result<()> {
            if let Some(mut task) = self.tasks.get_mut(task_id) {
                task.status = status;
                task.error_msg = error_msg.map(|s| s.to_string());
                task.updated_at = Utc::now();
            }
            Ok(())
        }
        async fn set_claimed_by(&self, task_id: &str, instance_id: Option<&str>) -> Result<()> {
            if let Some(mut task) = self.tasks.get_mut(task_id) {
                task.claimed_by = instance_id.map(|s| s.to_string());
            }
            Ok(())
        }
    }

    struct MockStorage {
        files: DashMap<String, ()>,
        fail_upload: AtomicBool,
        uploads: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStorage for MockStorage {
        async fn exists(&self, file_name: &str) -> Result<bool> {
            Ok(self.files.contains_key(file_name))
        }
        async fn upload_file(&self, _local_path: &Path, remote_name: &str) -> Result<()> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            if self.fail_upload.load(Ordering::SeqCst) {
                return Err(crate::error::RelayError::Upload("stream broke".into()));
            }
            self.files.insert(remote_name.to_string(), ());
            Ok(())
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .files
                .iter()
                .map(|e| e.key().clone())
                .filter(|k| k.starts_with(prefix))
                .collect())
        }
    }

    struct MockChat {
        source_exists: AtomicBool,
    }

    #[async_trait]
    impl ChatClient for MockChat {
        async fn fetch_source_message(&self, chat_id: i64, msg_id: i64) -> Result<Option<Value>> {
            if self.source_exists.load(Ordering::SeqCst) {
                Ok(Some(json!({"chatId": chat_id, "msgId": msg_id})))
            } else {
                Ok(None)
            }
        }
        async fn edit_progress_message(&self, _: i64, _: i64, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockQueue {
        downloads: Mutex<Vec<String>>,
        uploads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskQueue for MockQueue {
        async fn enqueue_download(&self, task_id: &str, _data: Value) -> Result<()> {
            self.downloads.lock().push(task_id.to_string());
            Ok(())
        }
        async fn enqueue_upload(&self, task_id: &str, _data: Value) -> Result<()> {
            self.uploads.lock().push(task_id.to_string());
            Ok(())
        }
    }

    struct Harness {
        manager: TaskManager,
        repository: Arc<MockRepository>,
        storage: Arc<MockStorage>,
        chat: Arc<MockChat>,
        queue: Arc<MockQueue>,
        _staging: tempfile::TempDir,
    }

    fn task(id: &str, status: TaskStatus) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            user_id: "u1".to_string(),
            chat_id: 12345,
            msg_id: 10,
            source_msg_id: 9,
            file_name: format!("{}.bin", id),
            file_size: 4,
            status,
            claimed_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            error_msg: None,
            attempts: 0,
        }
    }

    fn harness() -> Harness {
        let staging = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheService::new(
            Arc::new(MemoryKv {
                store: DashMap::new(),
            }) as Arc<dyn KvProvider>,
            None,
            CacheTierConfig {
                ttl_jitter_ratio: 0.0,
                ..CacheTierConfig::default()
            },
        ));
        let coordinator = Arc::new(InstanceCoordinator::new(
            cache,
            CoordinatorConfig {
                lock_backoff_ms: vec![1],
                active_set_cache_ttl: Duration::ZERO,
                ..CoordinatorConfig::default()
            },
            "http://localhost".to_string(),
            "test".to_string(),
        ));
        let repository = Arc::new(MockRepository {
            tasks: DashMap::new(),
        });
        let storage = Arc::new(MockStorage {
            files: DashMap::new(),
            fail_upload: AtomicBool::new(false),
            uploads: AtomicUsize::new(0),
        });
        let chat = Arc::new(MockChat {
            source_exists: AtomicBool::new(true),
        });
        let queue = Arc::new(MockQueue::default());

        let manager = TaskManager::new(
            coordinator,
            Arc::clone(&repository) as Arc<dyn TaskRepository>,
            Arc::clone(&storage) as Arc<dyn RemoteStorage>,
            Arc::clone(&chat) as Arc<dyn ChatClient>,
            Arc::clone(&queue) as Arc<dyn TaskQueue>,
            TaskManagerConfig {
                staging_dir: staging.path().to_path_buf(),
            },
        );

        Harness {
            manager,
            repository,
            storage,
            chat,
            queue,
            _staging: staging,
        }
    }

    fn stage_file(h: &Harness, file_name: &str) {
        std::fs::write(h.manager.local_path(file_name), b"data").unwrap();
    }

    #[tokio::test]
    async fn test_upload_happy_path() {
        let h = harness();
        let t = task("t1", TaskStatus::Downloaded);
        h.repository.tasks.insert(t.id.clone(), t.clone());
        stage_file(&h, &t.file_name);

        let outcome = h.manager.upload_task(&t).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Uploaded);
        assert_eq!(
            h.repository.tasks.get("t1").unwrap().status,
            TaskStatus::Completed
        );
        // The staged file was removed.
        assert!(!h.manager.local_path(&t.file_name).exists());
        // The task lock was released.
        assert!(h.manager.coordinator.acquire_task_lock("t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_upload_missing_local_file_fails() {
        let h = harness();
        let t = task("t1", TaskStatus::Downloaded);
        h.repository.tasks.insert(t.id.clone(), t.clone());

        let outcome = h.manager.upload_task(&t).await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Failed(_)));
        let stored = h.repository.tasks.get("t1").unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error_msg.is_some());
    }

    #[tokio::test]
    async fn test_upload_idempotence_short_circuit() {
        let h = harness();
        let t = task("t1", TaskStatus::Downloaded);
        h.repository.tasks.insert(t.id.clone(), t.clone());
        stage_file(&h, &t.file_name);
        h.storage.files.insert(t.file_name.clone(), ());

        let outcome = h.manager.upload_task(&t).await.unwrap();
        assert_eq!(outcome, UploadOutcome::AlreadyPresent);
        assert_eq!(h.storage.uploads.load(Ordering::SeqCst), 0);
        assert_eq!(
            h.repository.tasks.get("t1").unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_upload_failure_records_message_and_cleans_up() {
        let h = harness();
        let t = task("t1", TaskStatus::Downloaded);
        h.repository.tasks.insert(t.id.clone(), t.clone());
        stage_file(&h, &t.file_name);
        h.storage.fail_upload.store(true, Ordering::SeqCst);

        let outcome = h.manager.upload_task(&t).await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Failed(_)));
        let stored = h.repository.tasks.get("t1").unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error_msg.as_deref().unwrap().contains("stream broke"));
        assert!(!h.manager.local_path(&t.file_name).exists());
    }

    #[tokio::test]
    async fn test_upload_cancelled_before_start() {
        let h = harness();
        let t = task("t1", TaskStatus::Downloaded);
        h.repository.tasks.insert(t.id.clone(), t.clone());
        stage_file(&h, &t.file_name);
        h.manager.cancel_task("t1");

        let outcome = h.manager.upload_task(&t).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Cancelled);
        assert_eq!(
            h.repository.tasks.get("t1").unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(h.storage.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retry_completed_task_rejected() {
        let h = harness();
        let t = task("t1", TaskStatus::Completed);
        h.repository.tasks.insert(t.id.clone(), t);

        let outcome = h.manager.retry_task("t1", "user").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status_code, 400);
        assert_eq!(outcome.message, "Task already completed");
    }

    #[tokio::test]
    async fn test_retry_missing_task_404() {
        let h = harness();
        let outcome = h.manager.retry_task("nope", "user").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status_code, 404);
    }

    #[tokio::test]
    async fn test_retry_missing_source_message_404() {
        let h = harness();
        let t = task("t1", TaskStatus::Failed);
        h.repository.tasks.insert(t.id.clone(), t);
        h.chat.source_exists.store(false, Ordering::SeqCst);

        let outcome = h.manager.retry_task("t1", "user").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status_code, 404);
        assert_eq!(outcome.message, "Source message not found");
    }

    #[tokio::test]
    async fn test_retry_upload_with_staged_file() {
        let h = harness();
        let t = task("t1", TaskStatus::Downloaded);
        h.repository.tasks.insert(t.id.clone(), t.clone());
        stage_file(&h, &t.file_name);

        let outcome = h.manager.retry_task("t1", "user").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.status_code, 200);
        assert_eq!(h.queue.uploads.lock().as_slice(), ["t1"]);
        assert!(h.queue.downloads.lock().is_empty());
    }

    #[tokio::test]
    async fn test_retry_upload_missing_file_falls_back_to_download() {
        let h = harness();
        let t = task("t1", TaskStatus::Downloaded);
        h.repository.tasks.insert(t.id.clone(), t);

        let outcome = h.manager.retry_task("t1", "user").await.unwrap();
        assert!(outcome.success);
        assert_eq!(h.queue.downloads.lock().as_slice(), ["t1"]);
        assert!(h.queue.uploads.lock().is_empty());
        assert_eq!(
            h.repository.tasks.get("t1").unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_retry_releases_lock() {
        let h = harness();
        let t = task("t1", TaskStatus::Failed);
        h.repository.tasks.insert(t.id.clone(), t);

        h.manager.retry_task("t1", "user").await.unwrap();
        // The lock can be taken again immediately.
        assert!(h.manager.coordinator.acquire_task_lock("t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_counters() {
        let h = harness();
        assert_eq!(h.manager.processing_count(), 0);
        assert_eq!(h.manager.waiting_count(), 0);

        h.manager.admit_download(task("d1", TaskStatus::Queued));
        h.manager.admit_download(task("d2", TaskStatus::Queued));
        h.manager.admit_upload(task("u1", TaskStatus::Downloaded));
        assert_eq!(h.manager.waiting_count(), 3);

        let current = h.manager.start_next_download().unwrap();
        assert_eq!(current.id, "d1");
        assert_eq!(h.manager.processing_count(), 1);
        assert_eq!(h.manager.waiting_count(), 2);

        // The slot is exclusive.
        assert!(h.manager.start_next_download().is_none());

        h.manager.finish_download(current, true);
        assert_eq!(h.manager.processing_count(), 0);
        // Successful download queued an upload.
        assert_eq!(h.manager.waiting_count(), 3);
    }
}
