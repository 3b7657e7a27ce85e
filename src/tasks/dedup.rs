// Task Deduplicator
//
// Idempotent registration inside a dedup window, a short-TTL processing lock
// with stale-owner preemption, and result persistence. Records live in the
// shared KV store so any instance can observe a task's progress:
//
//   task:<key>        registration record and lifecycle status
//   processing:<key>  short-TTL processing lock
//   result:<key>      persisted final result

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::{CacheReadOptions, CacheService, CacheWriteOptions};
use crate::config::DedupConfig;
use crate::error::Result;

pub const TASK_PREFIX: &str = "task:";
pub const PROCESSING_PREFIX: &str = "processing:";
pub const RESULT_PREFIX: &str = "result:";

/// Dedup record lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    FailedRetryable,
}

impl DedupStatus {
    /// Terminal states allow a fresh registration under the same key.
    fn is_terminal(self) -> bool {
        matches!(
            self,
            DedupStatus::Completed | DedupStatus::Failed | DedupStatus::FailedRetryable
        )
    }
}

/// Registration record under `task:<key>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupRecord {
    pub task_key: String,
    pub data: Value,
    pub status: DedupStatus,
    /// Milliseconds since the epoch
    pub created_at: i64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_worker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Processing lock under `processing:<key>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLock {
    pub worker_id: String,
    /// Milliseconds since the epoch
    pub started_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Caller-chosen dedup key; fingerprinted from the data when absent
    pub dedup_key: Option<String>,
    /// Registration TTL; defaults to the dedup window
    pub ttl: Option<Duration>,
    /// Register even when a live record exists
    pub allow_duplicate: bool,
}

#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub registered: bool,
    pub reason: Option<String>,
    pub task_key: String,
    pub status: Option<DedupStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct BeginOptions {
    pub lock_ttl: Option<Duration>,
    pub max_processing_time: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct BeginOutcome {
    pub can_process: bool,
    pub reason: Option<String>,
    pub attempt: Option<u32>,
    pub data: Option<Value>,
}

pub struct TaskDeduplicator {
    cache: Arc<CacheService>,
    config: DedupConfig,
}

impl TaskDeduplicator {
    pub fn new(cache: Arc<CacheService>, config: DedupConfig) -> Self {
        Self { cache, config }
    }

    fn read_opts() -> CacheReadOptions {
        CacheReadOptions {
            skip_l1: true,
            ..CacheReadOptions::default()
        }
    }

    fn write_opts() -> CacheWriteOptions {
        CacheWriteOptions {
            skip_l1: true,
            skip_ttl_randomization: true,
            ..CacheWriteOptions::default()
        }
    }

    /// Stable fingerprint over the task data: SHA-256 of a key-sorted JSON
    /// rendering, so field order never changes the identity.
    pub fn fingerprint(data: &Value) -> String {
        let canonical = canonicalize(data).to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Register a task. Exactly one caller inside the dedup window observes
    /// `registered: true`; the rest get `reason: "duplicate"`.
    pub async fn register_task(&self, data: Value, opts: &RegisterOptions) -> Result<RegisterOutcome> {
        let task_key = opts
            .dedup_key
            .clone()
            .unwrap_or_else(|| Self::fingerprint(&data));
        let record_key = format!("{}{}", TASK_PREFIX, task_key);

        let existing: Option<DedupRecord> =
            self.cache.get_json(&record_key, &Self::read_opts()).await?;

        if let Some(existing) = existing {
            if !existing.status.is_terminal() && !opts.allow_duplicate {
                debug!("Rejecting duplicate registration for {}", task_key);
                return Ok(RegisterOutcome {
                    registered: false,
                    reason: Some("duplicate".to_string()),
                    task_key,
                    status: Some(existing.status),
                });
            }
        }

        let record = DedupRecord {
            task_key: task_key.clone(),
            data,
            status: DedupStatus::Pending,
            created_at: Utc::now().timestamp_millis(),
            attempts: 0,
            processing_worker: None,
            processing_started_at: None,
            result_key: None,
            error: None,
        };
        let ttl = opts.ttl.unwrap_or(self.config.dedup_window);
        self.cache
            .set_json(&record_key, &record, Some(ttl), &Self::write_opts())
            .await?;

        Ok(RegisterOutcome {
            registered: true,
            reason: None,
            task_key,
            status: Some(DedupStatus::Pending),
        })
    }

    /// Claim a registered task for processing. A fresh lock held by another
    /// worker refuses the claim; a lock older than the processing ceiling is
    /// preempted.
    pub async fn begin_processing(
        &self,
        task_key: &str,
        worker_id: &str,
        opts: &BeginOptions,
    ) -> Result<BeginOutcome> {
        let record_key = format!("{}{}", TASK_PREFIX, task_key);
        let lock_key = format!("{}{}", PROCESSING_PREFIX, task_key);
        let lock_ttl = opts.lock_ttl.unwrap_or(self.config.processing_lock_ttl);
        let max_processing = opts
            .max_processing_time
            .unwrap_or(self.config.max_processing_time);

        let record: Option<DedupRecord> =
            self.cache.get_json(&record_key, &Self::read_opts()).await?;
        let Some(mut record) = record else {
            return Ok(BeginOutcome {
                can_process: false,
                reason: Some("not_found".to_string()),
                attempt: None,
                data: None,
            });
        };
        if record.status == DedupStatus::Completed {
            return Ok(BeginOutcome {
                can_process: false,
                reason: Some("already_completed".to_string()),
                attempt: None,
                data: None,
            });
        }

        let existing_lock: Option<ProcessingLock> =
            self.cache.get_json(&lock_key, &Self::read_opts()).await?;
        if let Some(lock) = existing_lock {
            let elapsed = Utc::now().timestamp_millis() - lock.started_at;
            if elapsed < max_processing.as_millis() as i64 {
                return Ok(BeginOutcome {
                    can_process: false,
                    reason: Some("already_processing".to_string()),
                    attempt: None,
                    data: None,
                });
            }
            info!(
                "Preempting stale processing lock on {} held by {}",
                task_key, lock.worker_id
            );
        }

        let lock = ProcessingLock {
            worker_id: worker_id.to_string(),
            started_at: Utc::now().timestamp_millis(),
        };
        self.cache
            .set_json(&lock_key, &lock, Some(lock_ttl), &Self::write_opts())
            .await?;

        record.status = DedupStatus::Processing;
        record.attempts += 1;
        record.processing_worker = Some(worker_id.to_string());
        record.processing_started_at = Some(lock.started_at);
        self.cache
            .set_json(
                &record_key,
                &record,
                Some(self.config.dedup_window),
                &Self::write_opts(),
            )
            .await?;

        Ok(BeginOutcome {
            can_process: true,
            reason: None,
            attempt: Some(record.attempts),
            data: Some(record.data),
        })
    }

    /// Persist the result and mark the task completed. Returns false when
    /// the caller no longer owns the processing lock.
    pub async fn complete_processing(
        &self,
        task_key: &str,
        worker_id: &str,
        result: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        if !self.owns_processing_lock(task_key, worker_id).await? {
            return Ok(false);
        }

        let result_key = format!("{}{}", RESULT_PREFIX, task_key);
        self.cache
            .set(
                &result_key,
                &result,
                Some(ttl.unwrap_or(self.config.result_ttl)),
                &Self::write_opts(),
            )
            .await?;

        self.update_record(task_key, |record| {
            record.status = DedupStatus::Completed;
            record.result_key = Some(result_key.clone());
        })
        .await?;

        self.cache
            .delete(&format!("{}{}", PROCESSING_PREFIX, task_key))
            .await?;
        Ok(true)
    }

    /// Mark the task failed (retryable or terminal) and drop the lock.
    pub async fn fail_processing(
        &self,
        task_key: &str,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<bool> {
        if !self.owns_processing_lock(task_key, worker_id).await? {
            return Ok(false);
        }

        self.update_record(task_key, |record| {
            record.status = if retryable {
                DedupStatus::FailedRetryable
            } else {
                DedupStatus::Failed
            };
            record.error = Some(error.to_string());
        })
        .await?;

        self.cache
            .delete(&format!("{}{}", PROCESSING_PREFIX, task_key))
            .await?;
        Ok(true)
    }

    pub async fn get_task_status(&self, task_key: &str) -> Result<Option<DedupStatus>> {
        let record: Option<DedupRecord> = self
            .cache
            .get_json(&format!("{}{}", TASK_PREFIX, task_key), &Self::read_opts())
            .await?;
        Ok(record.map(|r| r.status))
    }

    /// Fetch the persisted result, optionally polling until it appears or
    /// the timeout elapses.
    pub async fn get_task_result(
        &self,
        task_key: &str,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>> {
        let result_key = format!("{}{}", RESULT_PREFIX, task_key);
        let deadline = tokio::time::Instant::now() + timeout.unwrap_or(Duration::from_secs(30));

        loop {
            let result = self.cache.get(&result_key, &Self::read_opts()).await?;
            if result.is_some() || !wait {
                return Ok(result);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn owns_processing_lock(&self, task_key: &str, worker_id: &str) -> Result<bool> {
        let lock: Option<ProcessingLock> = self
            .cache
            .get_json(
                &format!("{}{}", PROCESSING_PREFIX, task_key),
                &Self::read_opts(),
            )
            .await?;
        Ok(lock.map(|l| l.worker_id == worker_id).unwrap_or(false))
    }

    async fn update_record<F>(&self, task_key: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut DedupRecord),
    {
        let record_key = format!("{}{}", TASK_PREFIX, task_key);
        let record: Option<DedupRecord> =
            self.cache.get_json(&record_key, &Self::read_opts()).await?;
        if let Some(mut record) = record {
            mutate(&mut record);
            self.cache
                .set_json(
                    &record_key,
                    &record,
                    Some(self.config.dedup_window),
                    &Self::write_opts(),
                )
                .await?;
        }
        Ok(())
    }
}

/// Recursively sort object keys so equal data yields equal fingerprints.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            serde_json::to_value(sorted).unwrap_or(Value::Null)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
