// # Media Relay Server
//
// Main entry point for one relay instance. Wires the cache tier, the
// coordination plane, the queue service, the task layer, and the stream
// worker together, registers their shutdown hooks, and serves the instance
// HTTP surface.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use media_relay::api::{build_router, ApiState};
use media_relay::cache::cloud_kv::{CloudKvConfig, CloudKvStore};
use media_relay::cache::redis_rest::{RedisRestConfig, RedisRestStore};
use media_relay::cache::{CacheService, KvProvider};
use media_relay::coordination::{ConsistentCache, InstanceCoordinator, StateSynchronizer};
use media_relay::error::{RelayError, Result};
use media_relay::manifest;
use media_relay::queue::{EventPublisher, QueueService};
use media_relay::shutdown::{priorities, GracefulShutdown};
use media_relay::stream::worker::SubprocessUploadFactory;
use media_relay::stream::{ProgressStore, StreamWorker};
use media_relay::tasks::{
    ChatClient, MediaGroupBuffer, RemoteStorage, TaskDeduplicator, TaskManager,
    TaskManagerConfig, TaskQueue, TaskRecord, TaskRepository, TaskStatus,
};
use media_relay::{RelayConfig, VERSION};

/// In-memory task store used until the SQL-backed repository is wired in a
/// deployment. Tasks arriving through the queue are spooled here.
struct SpoolRepository {
    tasks: DashMap<String, TaskRecord>,
}

#[async_trait]
impl TaskRepository for SpoolRepository {
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
            task.updated_at = chrono::Utc::now();
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

/// Log-only chat client standing in for the platform adapter.
struct LogChatClient;

#[async_trait]
impl ChatClient for LogChatClient {
    async fn fetch_source_message(&self, chat_id: i64, msg_id: i64) -> Result<Option<Value>> {
        Ok(Some(json!({"chatId": chat_id, "msgId": msg_id})))
    }

    async fn edit_progress_message(&self, chat_id: i64, msg_id: i64, text: &str) -> Result<()> {
        info!("progress[{}:{}] {}", chat_id, msg_id, text);
        Ok(())
    }
}

/// Remote storage driven through the same CLI the stream worker uses for
/// uploads (`rclone`-compatible: lsf for listing, copyto for staged files).
struct CliRemoteStorage {
    command: String,
    remote_prefix: String,
}

impl CliRemoteStorage {
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new(&self.command)
            .args(args)
            .output()
            .await
            .map_err(|e| RelayError::Upload(format!("{} failed to start: {}", self.command, e)))?;
        if !output.status.success() {
            return Err(RelayError::Upload(format!(
                "{} {:?} exited with {}",
                self.command, args, output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl RemoteStorage for CliRemoteStorage {
    async fn exists(&self, file_name: &str) -> Result<bool> {
        Ok(self
            .list(file_name)
            .await?
            .iter()
            .any(|name| name == file_name))
    }

    async fn upload_file(&self, local_path: &Path, remote_name: &str) -> Result<()> {
        let destination = format!("{}/{}", self.remote_prefix.trim_end_matches('/'), remote_name);
        let local = local_path.display().to_string();
        self.run(&["copyto", &local, &destination]).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let listing = self.run(&["lsf", &self.remote_prefix]).await?;
        Ok(listing
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty() && line.starts_with(prefix))
            .collect())
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn build_providers() -> (Arc<dyn KvProvider>, Option<Arc<dyn KvProvider>>) {
    let primary: Arc<dyn KvProvider> = Arc::new(CloudKvStore::new(CloudKvConfig {
        account_id: env_or("CF_ACCOUNT_ID", ""),
        namespace_id: env_or("CF_KV_NAMESPACE_ID", ""),
        api_token: env_or("CF_API_TOKEN", ""),
        ..CloudKvConfig::default()
    }));

    let upstash_url = env_or("UPSTASH_REDIS_REST_URL", "");
    let fallback: Option<Arc<dyn KvProvider>> = if upstash_url.is_empty() {
        None
    } else {
        Some(Arc::new(RedisRestStore::new(RedisRestConfig {
            url: upstash_url,
            token: env_or("UPSTASH_REDIS_REST_TOKEN", ""),
            ..RedisRestConfig::default()
        })))
    };

    (primary, fallback)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    info!("Media Relay server starting");
    info!("Version: {}", VERSION);
    info!(
        "Managed services: {}",
        manifest::default_manifest().service_names().join(", ")
    );

    let config = RelayConfig::from_env();
    if let Err(e) = config.validate() {
        error!("Configuration invalid: {}", e);
        std::process::exit(1);
    }

    let exit_code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal startup error: {}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(config: RelayConfig) -> Result<i32> {
    let (primary, fallback) = build_providers();
    let cache = Arc::new(CacheService::new(primary, fallback, config.cache.clone()));
    Arc::clone(&cache).initialize();
    info!("Cache tier ready, provider: {}", cache.current_provider());

    let coordinator = Arc::new(InstanceCoordinator::new(
        Arc::clone(&cache),
        config.coordinator.clone(),
        config.public_url.clone(),
        config.region.clone(),
    ));
    Arc::clone(&coordinator).start().await?;
    info!("Instance id: {}", coordinator.instance_id());

    let queue = Arc::new(QueueService::new(
        config.queue.clone(),
        coordinator.instance_id().to_string(),
    ));
    let publisher: Arc<dyn EventPublisher> = Arc::clone(&queue) as Arc<dyn EventPublisher>;

    let consistent = Arc::new(ConsistentCache::new(
        Arc::clone(&cache),
        Arc::clone(&coordinator),
        Arc::clone(&publisher),
    ));
    let state_sync = Arc::new(StateSynchronizer::new(
        Arc::clone(&cache),
        Arc::clone(&coordinator),
        Arc::clone(&publisher),
        config.sync.clone(),
    ));
    Arc::clone(&state_sync).start();

    let dedup = Arc::new(TaskDeduplicator::new(
        Arc::clone(&cache),
        config.dedup.clone(),
    ));

    let staging_dir = std::path::PathBuf::from(env_or("RELAY_STAGING_DIR", "./staging"));
    let _ = std::fs::create_dir_all(&staging_dir);

    let repository = Arc::new(SpoolRepository {
        tasks: DashMap::new(),
    });
    let chat: Arc<dyn ChatClient> = Arc::new(LogChatClient);
    let uploader_cmd = env_or("RELAY_UPLOADER_CMD", "rclone");
    let remote_prefix = env_or("RELAY_REMOTE_PREFIX", "remote:media");
    let storage: Arc<dyn RemoteStorage> = Arc::new(CliRemoteStorage {
        command: uploader_cmd.clone(),
        remote_prefix: remote_prefix.clone(),
    });

    let manager = Arc::new(TaskManager::new(
        Arc::clone(&coordinator),
        Arc::clone(&repository) as Arc<dyn TaskRepository>,
        Arc::clone(&storage),
        Arc::clone(&chat),
        Arc::clone(&queue) as Arc<dyn TaskQueue>,
        TaskManagerConfig { staging_dir },
    ));

    let progress = Arc::new(ProgressStore::new(
        Arc::clone(&cache),
        config.stream.progress_ttl,
    ));
    let factory = Arc::new(SubprocessUploadFactory {
        command: uploader_cmd,
        args: vec!["rcat".to_string(), "{remote}".to_string()],
        remote_prefix,
    });
    let worker = Arc::new(StreamWorker::new(
        config.stream.clone(),
        factory,
        Arc::clone(&chat),
        progress,
    ));
    Arc::clone(&worker).start_janitor();

    // Media groups feed back into the queue as grouped download tasks.
    let (media_groups, mut group_rx) = MediaGroupBuffer::new(config.media_group.clone());
    {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            while let Some(group) = group_rx.recv().await {
                let event = json!({
                    "chatId": group.chat_id,
                    "messages": group.messages,
                });
                if let Err(e) = queue.broadcast_system_event("media_group_complete", event).await {
                    warn!("Media-group broadcast failed: {}", e);
                }
            }
        });
    }

    let shutdown = Arc::new(GracefulShutdown::new(config.shutdown.clone()));
    {
        let coordinator = Arc::clone(&coordinator);
        shutdown.register("instance-coordinator", priorities::INSTANCE_COORDINATOR, move || {
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.stop().await }
        });
    }
    {
        let state_sync = Arc::clone(&state_sync);
        let worker = Arc::clone(&worker);
        let media_groups = Arc::clone(&media_groups);
        shutdown.register("chat-and-streams", priorities::CHAT_CLIENT, move || {
            let state_sync = Arc::clone(&state_sync);
            let worker = Arc::clone(&worker);
            let media_groups = Arc::clone(&media_groups);
            async move {
                state_sync.stop().await;
                worker.shutdown().await;
                media_groups.cleanup();
                Ok(())
            }
        });
    }
    {
        let cache_for_hook = Arc::clone(&cache);
        shutdown.register("cache", priorities::CACHE, move || {
            let cache = Arc::clone(&cache_for_hook);
            async move {
                cache.destroy().await;
                Ok(())
            }
        });
    }
    {
        let manager = Arc::clone(&manager);
        shutdown.register_task_counter(move || manager.processing_count());
    }

    let api_state = Arc::new(ApiState {
        queue,
        worker,
        manager,
        dedup,
        state_sync,
        consistent,
        coordinator,
        cache,
        started_at: Instant::now(),
    });
    let router = build_router(api_state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| RelayError::Network(format!("Bind {} failed: {}", config.listen_addr, e)))?;
    info!("Serving instance API on {}", config.listen_addr);

    let signal_shutdown = Arc::clone(&shutdown);
    let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
        signal_shutdown.wait_for_signal().await;
    });
    if let Err(e) = serve.await {
        error!("HTTP server error: {}", e);
        return Ok(shutdown.shutdown("http-server", Some(&e.to_string())).await);
    }

    Ok(shutdown.shutdown("signal", None).await)
}
