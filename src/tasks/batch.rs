// Batch Processor
//
// Prioritized, bounded-concurrency batch execution. Batches are recorded in
// the shared store and fed through an in-process priority queue; items run
// in parallel chunks. An atomic batch short-circuits on the first item
// failure; a non-atomic batch collects failures and still completes.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheReadOptions, CacheService, CacheWriteOptions};
use crate::config::BatchConfig;
use crate::coordination::InstanceCoordinator;
use crate::error::{RelayError, Result};
use crate::queue::{EventPublisher, TOPIC_BATCH_EVENTS};

pub const BATCH_PREFIX: &str = "batch:";

/// Priority bands mapped to fixed weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BatchPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl BatchPriority {
    pub fn weight(self) -> u8 {
        match self {
            BatchPriority::Critical => 100,
            BatchPriority::High => 75,
            BatchPriority::Normal => 50,
            BatchPriority::Low => 25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Per-item result collected during processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemOutcome {
    pub success: bool,
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Batch record persisted under `batch:<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: String,
    pub batch_type: String,
    pub items: Vec<Value>,
    pub priority: BatchPriority,
    pub status: BatchStatus,
    pub processed: usize,
    pub failed: usize,
    pub results: Vec<BatchItemOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateBatchOptions {
    pub user_id: Option<String>,
    pub priority: BatchPriority,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessBatchOptions {
    /// Stop at the first item failure and mark the batch failed
    pub atomic: bool,
}

struct QueuedBatch {
    weight: u8,
    seq: u64,
    id: String,
}

impl PartialEq for QueuedBatch {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight && self.seq == other.seq
    }
}
impl Eq for QueuedBatch {}
impl PartialOrd for QueuedBatch {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedBatch {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher weight first; FIFO within a band.
        self.weight
            .cmp(&other.weight)
            .then(other.seq.cmp(&self.seq))
    }
}

pub struct BatchProcessor {
    cache: Arc<CacheService>,
    coordinator: Arc<InstanceCoordinator>,
    publisher: Arc<dyn EventPublisher>,
    config: BatchConfig,
    queue: Mutex<BinaryHeap<QueuedBatch>>,
    seq: AtomicU64,
    active: AtomicUsize,
}

impl BatchProcessor {
    pub fn new(
        cache: Arc<CacheService>,
        coordinator: Arc<InstanceCoordinator>,
        publisher: Arc<dyn EventPublisher>,
        config: BatchConfig,
    ) -> Self {
        Self {
            cache,
            coordinator,
            publisher,
            config,
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            active: AtomicUsize::new(0),
        }
    }

    fn record_key(batch_id: &str) -> String {
        format!("{}{}", BATCH_PREFIX, batch_id)
    }

    /// Create a batch, trimming items beyond the size cap, and queue it.
    pub async fn create_batch(
        &self,
        batch_type: &str,
        mut items: Vec<Value>,
        opts: &CreateBatchOptions,
    ) -> Result<String> {
        if items.len() > self.config.max_batch_size {
            debug!(
                "Trimming batch from {} to {} items",
                items.len(),
                self.config.max_batch_size
            );
            items.truncate(self.config.max_batch_size);
        }

        let record = BatchRecord {
            id: uuid::Uuid::new_v4().to_string(),
            batch_type: batch_type.to_string(),
            items,
            priority: opts.priority,
            status: BatchStatus::Pending,
            processed: 0,
            failed: 0,
            results: Vec::new(),
            user_id: opts.user_id.clone(),
            metadata: opts.metadata.clone(),
            created_at: Utc::now(),
        };

        self.cache
            .set_json(
                &Self::record_key(&record.id),
                &record,
                None,
                &CacheWriteOptions::default(),
            )
            .await?;

        self.queue.lock().push(QueuedBatch {
            weight: record.priority.weight(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            id: record.id.clone(),
        });

        Ok(record.id)
    }

    /// Pop the highest-priority queued batch id.
    pub fn next_batch(&self) -> Option<String> {
        self.queue.lock().pop().map(|q| q.id)
    }

    pub fn queued_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Process a batch's items in parallel chunks under the batch lock.
    pub async fn process_batch<F, Fut>(
        &self,
        batch_id: &str,
        processor: F,
        opts: &ProcessBatchOptions,
    ) -> Result<BatchRecord>
    where
        F: Fn(Value, usize) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Value>> + Send,
    {
        if self.active.load(Ordering::SeqCst) >= self.config.max_concurrent_batches {
            return Err(RelayError::Unavailable(format!(
                "Concurrent batch limit of {} reached",
                self.config.max_concurrent_batches
            )));
        }
        self.active.fetch_add(1, Ordering::SeqCst);

        let lock_name = format!("batch_process:{}", batch_id);
        let locked = self
            .coordinator
            .acquire_lock(&lock_name, self.config.process_lock_ttl, None)
            .await;
        let locked = match locked {
            Ok(locked) => locked,
            Err(e) => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        if !locked {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return Err(RelayError::Conflict(format!(
                "Batch {} is being processed elsewhere",
                batch_id
            )));
        }

        let outcome = self.run_batch(batch_id, processor, opts).await;

        if let Err(e) = self.coordinator.release_lock(&lock_name).await {
            warn!("Releasing {} failed: {}", lock_name, e);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn run_batch<F, Fut>(
        &self,
        batch_id: &str,
        processor: F,
        opts: &ProcessBatchOptions,
    ) -> Result<BatchRecord>
    where
        F: Fn(Value, usize) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Value>> + Send,
    {
        let key = Self::record_key(batch_id);
        let read_opts = CacheReadOptions {
            skip_l1: true,
            ..CacheReadOptions::default()
        };
        let record: Option<BatchRecord> = self.cache.get_json(&key, &read_opts).await?;
        let Some(mut record) = record else {
            return Err(RelayError::NotFound(format!("Batch {} not found", batch_id)));
        };

        record.status = BatchStatus::Processing;
        self.cache
            .set_json(&key, &record, None, &CacheWriteOptions::default())
            .await?;

        let items: Vec<(usize, Value)> = record.items.iter().cloned().enumerate().collect();
        let mut results: Vec<BatchItemOutcome> = Vec::with_capacity(items.len());
        let mut aborted = false;

        for chunk in items.chunks(self.config.chunk_size) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|(index, item)| {
                    let index = *index;
                    let item = item.clone();
                    let processor = &processor;
                    async move {
                        match processor(item, index).await {
                            Ok(result) => BatchItemOutcome {
                                success: true,
                                index,
                                result: Some(result),
                                error: None,
                            },
                            Err(e) => BatchItemOutcome {
                                success: false,
                                index,
                                result: None,
                                error: Some(e.to_string()),
                            },
                        }
                    }
                })
                .collect();

            let chunk_results = join_all(futures).await;
            let chunk_failed = chunk_results.iter().any(|r| !r.success);
            results.extend(chunk_results);

            if opts.atomic && chunk_failed {
                aborted = true;
                break;
            }
            tokio::task::yield_now().await;
        }

        record.processed = results.iter().filter(|r| r.success).count();
        record.failed = results.iter().filter(|r| !r.success).count();
        record.results = results;
        record.status = if aborted {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };

        self.cache
            .set_json(&key, &record, None, &CacheWriteOptions::default())
            .await?;

        let event = json!({
            "event": "batch_update",
            "batchId": record.id,
            "status": record.status,
            "processed": record.processed,
            "failed": record.failed,
        });
        if let Err(e) = self.publisher.publish_event(TOPIC_BATCH_EVENTS, event).await {
            warn!("Batch-update broadcast failed: {}", e);
        }

        Ok(record)
    }

    /// Wait for a batch to reach a terminal status, polling the store.
    pub async fn on_batch_complete(&self, batch_id: &str) -> Result<BatchRecord> {
        let key = Self::record_key(batch_id);
        let deadline = tokio::time::Instant::now() + self.config.completion_wait_max;
        let read_opts = CacheReadOptions {
            skip_l1: true,
            ..CacheReadOptions::default()
        };

        loop {
            let record: Option<BatchRecord> = self.cache.get_json(&key, &read_opts).await?;
            if let Some(record) = record {
                if matches!(record.status, BatchStatus::Completed | BatchStatus::Failed) {
                    return Ok(record);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RelayError::Timeout(format!(
                    "Batch {} did not complete in time",
                    batch_id
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchRecord>> {
        self.cache
            .get_json(
                &Self::record_key(batch_id),
                &CacheReadOptions {
                    skip_l1: true,
                    ..CacheReadOptions::default()
                },
            )
            .await
    }
}

/// Free-standing parallel map over arbitrary items, in chunks with a small
/// yield between them.
pub async fn process_items<F, Fut>(
    items: Vec<Value>,
    processor: F,
    concurrency: usize,
) -> Vec<BatchItemOutcome>
where
    F: Fn(Value, usize) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    let concurrency = concurrency.max(1);
    let indexed: Vec<(usize, Value)> = items.into_iter().enumerate().collect();
    let mut results = Vec::with_capacity(indexed.len());

    for chunk in indexed.chunks(concurrency) {
        let futures: Vec<_> = chunk
            .iter()
            .map(|(index, item)| {
                let index = *index;
                let item = item.clone();
                let processor = &processor;
                async move {
                    match processor(item, index).await {
                        Ok(result) => BatchItemOutcome {
                            success: true,
                            index,
                            result: Some(result),
                            error: None,
                        },
                        Err(e) => BatchItemOutcome {
                            success: false,
                            index,
                            result: None,
                            error: Some(e.to_string()),
                        },
                    }
                }
            })
            .collect();
        results.extend(join_all(futures).await);
        tokio::task::yield_now().await;
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::provider::KvProvider;
    use crate::config::{CacheTierConfig, CoordinatorConfig};
    use async_trait::async_trait;
    use dashmap::DashMap;

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

    struct NullBus;

    #[async_trait]
    impl EventPublisher for NullBus {
        async fn publish_event(&self, _topic: &str, _message: Value) -> Result<()> {
            Ok(())
        }
    }

    fn processor() -> BatchProcessor {
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
            Arc::clone(&cache),
            CoordinatorConfig {
                lock_backoff_ms: vec![1],
                active_set_cache_ttl: Duration::ZERO,
                ..CoordinatorConfig::default()
            },
            "http://localhost".to_string(),
            "test".to_string(),
        ));
        BatchProcessor::new(cache, coordinator, Arc::new(NullBus), BatchConfig::default())
    }

    #[tokio::test]
    async fn test_create_trims_to_max_size() {
        let p = processor();
        let items: Vec<Value> = (0..150).map(|n| json!(n)).collect();
        let id = p
            .create_batch("test", items, &CreateBatchOptions::default())
            .await
            .unwrap();
        let record = p.get_batch(&id).await.unwrap().unwrap();
        assert_eq!(record.items.len(), 100);
        assert_eq!(record.status, BatchStatus::Pending);
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let p = processor();
        let low = p
            .create_batch(
                "t",
                vec![json!(1)],
                &CreateBatchOptions {
                    priority: BatchPriority::Low,
                    ..CreateBatchOptions::default()
                },
            )
            .await
            .unwrap();
        let critical = p
            .create_batch(
                "t",
                vec![json!(1)],
                &CreateBatchOptions {
                    priority: BatchPriority::Critical,
                    ..CreateBatchOptions::default()
                },
            )
            .await
            .unwrap();
        let normal_a = p
            .create_batch("t", vec![json!(1)], &CreateBatchOptions::default())
            .await
            .unwrap();
        let normal_b = p
            .create_batch("t", vec![json!(1)], &CreateBatchOptions::default())
            .await
            .unwrap();

        assert_eq!(p.next_batch(), Some(critical));
        // FIFO within the same band.
        assert_eq!(p.next_batch(), Some(normal_a));
        assert_eq!(p.next_batch(), Some(normal_b));
        assert_eq!(p.next_batch(), Some(low));
        assert_eq!(p.next_batch(), None);
    }

    #[tokio::test]
    async fn test_process_batch_collects_results() {
        let p = processor();
        let items: Vec<Value> = (0..25).map(|n| json!(n)).collect();
        let id = p
            .create_batch("square", items, &CreateBatchOptions::default())
            .await
            .unwrap();

        let record = p
            .process_batch(
                &id,
                |item, _index| async move {
                    let n = item.as_i64().unwrap_or(0);
                    Ok(json!(n * n))
                },
                &ProcessBatchOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(record.status, BatchStatus::Completed);
        assert_eq!(record.processed, 25);
        assert_eq!(record.failed, 0);
        assert_eq!(record.results.len(), 25);
        assert_eq!(record.results[3].result, Some(json!(9)));
    }

    #[tokio::test]
    async fn test_non_atomic_batch_completes_with_failures() {
        let p = processor();
        let items: Vec<Value> = (0..5).map(|n| json!(n)).collect();
        let id = p
            .create_batch("t", items, &CreateBatchOptions::default())
            .await
            .unwrap();

        let record = p
            .process_batch(
                &id,
                |item, _| async move {
                    if item.as_i64() == Some(2) {
                        Err(RelayError::Internal("bad item".into()))
                    } else {
                        Ok(item)
                    }
                },
                &ProcessBatchOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(record.status, BatchStatus::Completed);
        assert_eq!(record.processed, 4);
        assert_eq!(record.failed, 1);
        assert!(!record.results[2].success);
    }

    #[tokio::test]
    async fn test_atomic_batch_short_circuits() {
        let p = processor();
        let items: Vec<Value> = (0..30).map(|n| json!(n)).collect();
        let id = p
            .create_batch("t", items, &CreateBatchOptions::default())
            .await
            .unwrap();

        let record = p
            .process_batch(
                &id,
                |item, _| async move {
                    if item.as_i64() == Some(2) {
                        Err(RelayError::Internal("bad item".into()))
                    } else {
                        Ok(item)
                    }
                },
                &ProcessBatchOptions { atomic: true },
            )
            .await
            .unwrap();

        assert_eq!(record.status, BatchStatus::Failed);
        // The first chunk ran; later chunks never did.
        assert!(record.results.len() <= 10);
    }

    #[tokio::test]
    async fn test_on_batch_complete() {
        let p = processor();
        let id = p
            .create_batch("t", vec![json!(1)], &CreateBatchOptions::default())
            .await
            .unwrap();
        p.process_batch(&id, |item, _| async move { Ok(item) }, &ProcessBatchOptions::default())
            .await
            .unwrap();

        let record = p.on_batch_complete(&id).await.unwrap();
        assert_eq!(record.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_process_items_free_standing() {
        let items: Vec<Value> = (0..7).map(|n| json!(n)).collect();
        let results = process_items(
            items,
            |item, index| async move {
                assert_eq!(item.as_i64().unwrap() as usize, index);
                Ok(json!(index))
            },
            3,
        )
        .await;
        assert_eq!(results.len(), 7);
        assert!(results.iter().all(|r| r.success));
    }
}
