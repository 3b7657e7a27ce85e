// Worker-side chunk ingress
//
// Bridges chunked HTTP ingress to a streaming cloud-upload subprocess. One
// session per task holds the subprocess handle and its stdin; the session's
// watermark drops retransmitted chunks so a chunk is written to stdin at
// most once. Silent sessions are reaped by the janitor.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde_json::json;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::progress::{ProgressStore, StreamProgress};
use super::ChunkMetadata;
use crate::config::StreamConfig;
use crate::error::{RelayError, Result};
use crate::tasks::ChatClient;

/// Write side of one upload subprocess. Stdin is exclusively owned by the
/// session that opened it.
#[async_trait]
pub trait UploadSink: Send + Sync {
    /// Stream one chunk; honors pipe backpressure.
    async fn write_chunk(&mut self, bytes: &[u8]) -> Result<()>;

    /// Close stdin and wait for the subprocess exit code.
    async fn finish(&mut self) -> Result<i32>;

    /// Terminate the subprocess.
    async fn abort(&mut self);
}

#[async_trait]
pub trait UploadSinkFactory: Send + Sync {
    async fn open(&self, file_name: &str, total_size: u64) -> Result<Box<dyn UploadSink>>;
}

/// Production factory spawning an `rcat`-style stdin-streaming uploader.
/// The `{remote}` placeholder in the argument list is replaced with the
/// destination path.
pub struct SubprocessUploadFactory {
    pub command: String,
    pub args: Vec<String>,
    pub remote_prefix: String,
}

#[async_trait]
impl UploadSinkFactory for SubprocessUploadFactory {
    async fn open(&self, file_name: &str, _total_size: u64) -> Result<Box<dyn UploadSink>> {
        let remote = format!("{}/{}", self.remote_prefix.trim_end_matches('/'), file_name);
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace("{remote}", &remote))
            .collect();

        let mut child = tokio::process::Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RelayError::Upload(format!("Failed to spawn uploader: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RelayError::Upload("Uploader has no stdin".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let file_name = file_name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("uploader[{}]: {}", file_name, line);
                }
            });
        }

        Ok(Box::new(SubprocessSink {
            child,
            stdin: Some(stdin),
        }))
    }
}

struct SubprocessSink {
    child: tokio::process::Child,
    stdin: Option<tokio::process::ChildStdin>,
}

#[async_trait]
impl UploadSink for SubprocessSink {
    async fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| RelayError::Upload("Uploader stdin already closed".to_string()))?;
        stdin
            .write_all(bytes)
            .await
            .map_err(|e| RelayError::Upload(format!("Uploader stdin write failed: {}", e)))
    }

    async fn finish(&mut self) -> Result<i32> {
        // Dropping stdin signals EOF to the subprocess.
        self.stdin.take();
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| RelayError::Upload(format!("Uploader wait failed: {}", e)))?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn abort(&mut self) {
        self.stdin.take();
        if let Err(e) = self.child.start_kill() {
            debug!("Uploader kill: {}", e);
        }
    }
}

/// Session status over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Streaming,
    Finishing,
    Failed,
}

struct StreamSession {
    task_id: String,
    file_name: String,
    #[allow(dead_code)]
    user_id: String,
    total_size: u64,
    uploaded_bytes: u64,
    /// Highest accepted chunk index; chunks at or below are duplicates
    chunk_watermark: Option<u64>,
    chunks_received: u64,
    leader_url: String,
    chat_id: i64,
    msg_id: i64,
    last_seen: Instant,
    #[allow(dead_code)]
    status: SessionStatus,
    sink: Box<dyn UploadSink>,
}

/// Result of accepting one chunk.
#[derive(Debug, Clone)]
pub struct ChunkAck {
    /// False when the chunk was dropped as a retransmission
    pub accepted: bool,
    pub uploaded_bytes: u64,
    pub last_chunk_index: Option<u64>,
    /// True when this was the final chunk and the upload finished cleanly
    pub completed: bool,
}

/// Live progress view served to the leader.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressView {
    #[serde(rename = "lastChunkIndex")]
    pub last_chunk_index: Option<u64>,
    #[serde(rename = "uploadedBytes")]
    pub uploaded_bytes: u64,
}

pub struct StreamWorker {
    config: StreamConfig,
    sessions: DashMap<String, Arc<Mutex<StreamSession>>>,
    factory: Arc<dyn UploadSinkFactory>,
    chat: Arc<dyn ChatClient>,
    progress: Arc<ProgressStore>,
    http_client: reqwest::Client,
    janitor_stop: SyncMutex<Option<watch::Sender<bool>>>,
    janitor_handle: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StreamWorker {
    pub fn new(
        config: StreamConfig,
        factory: Arc<dyn UploadSinkFactory>,
        chat: Arc<dyn ChatClient>,
        progress: Arc<ProgressStore>,
    ) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            factory,
            chat,
            progress,
            http_client: reqwest::Client::new(),
            janitor_stop: SyncMutex::new(None),
            janitor_handle: SyncMutex::new(None),
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Accept one chunk for a task. The shared secret gates the endpoint;
    /// an invalid secret is an `Auth` error (401 at the boundary).
    pub async fn handle_incoming_chunk(
        &self,
        task_id: &str,
        provided_secret: &str,
        metadata: ChunkMetadata,
        body: Bytes,
    ) -> Result<ChunkAck> {
        if provided_secret != self.config.instance_secret {
            return Err(RelayError::Auth("Invalid instance secret".to_string()));
        }

        let session = self.get_or_create_session(task_id, &metadata).await?;
        let mut session = session.lock().await;

        // Retransmissions at or below the watermark were already written.
        if let Some(watermark) = session.chunk_watermark {
            if metadata.chunk_index <= watermark {
                debug!(
                    "Dropping duplicate chunk {} for {} (watermark {})",
                    metadata.chunk_index, task_id, watermark
                );
                return Ok(ChunkAck {
                    accepted: false,
                    uploaded_bytes: session.uploaded_bytes,
                    last_chunk_index: session.chunk_watermark,
                    completed: false,
                });
            }
        }

        if let Err(e) = session.sink.write_chunk(&body).await {
            session.status = SessionStatus::Failed;
            session.sink.abort().await;
            drop(session);
            self.sessions.remove(task_id);
            self.report_status(&metadata.leader_url, task_id, "failed", Some(&e.to_string()), 0, 0)
                .await;
            return Err(e);
        }

        session.uploaded_bytes += body.len() as u64;
        session.chunk_watermark = Some(metadata.chunk_index);
        session.chunks_received += 1;
        session.last_seen = Instant::now();

        if session.chunks_received % self.config.ui_edit_every == 0 {
            let text = progress_text(session.uploaded_bytes, session.total_size, &session.file_name);
            if let Err(e) = self
                .chat
                .edit_progress_message(session.chat_id, session.msg_id, &text)
                .await
            {
                debug!("Progress edit failed for {}: {}", task_id, e);
            }
        }

        if session.chunks_received % self.config.progress_report_every == 0 {
            self.persist_progress(&session).await;
            self.report_status(
                &session.leader_url.clone(),
                task_id,
                "uploading",
                None,
                session.uploaded_bytes,
                session.total_size,
            )
            .await;
        }

        if metadata.is_last {
            session.status = SessionStatus::Finishing;
            let exit_code = session.sink.finish().await?;
            let uploaded = session.uploaded_bytes;
            let total = session.total_size;
            let leader_url = session.leader_url.clone();
            self.persist_progress(&session).await;
            drop(session);
            self.sessions.remove(task_id);

            if exit_code == 0 {
                info!("Upload for {} finished ({} bytes)", task_id, uploaded);
                self.report_status(&leader_url, task_id, "completed", None, uploaded, total)
                    .await;
                return Ok(ChunkAck {
                    accepted: true,
                    uploaded_bytes: uploaded,
                    last_chunk_index: Some(metadata.chunk_index),
                    completed: true,
                });
            }
            let message = format!("Uploader exited with code {}", exit_code);
            self.report_status(&leader_url, task_id, "failed", Some(&message), uploaded, total)
                .await;
            return Err(RelayError::Upload(message));
        }

        Ok(ChunkAck {
            accepted: true,
            uploaded_bytes: session.uploaded_bytes,
            last_chunk_index: session.chunk_watermark,
            completed: false,
        })
    }

    async fn get_or_create_session(
        &self,
        task_id: &str,
        metadata: &ChunkMetadata,
    ) -> Result<Arc<Mutex<StreamSession>>> {
        if let Some(existing) = self.sessions.get(task_id) {
            return Ok(Arc::clone(&existing));
        }

        let sink = self
            .factory
            .open(&metadata.file_name, metadata.total_size)
            .await?;
        let session = StreamSession {
            task_id: task_id.to_string(),
            file_name: metadata.file_name.clone(),
            user_id: metadata.user_id.clone(),
            total_size: metadata.total_size,
            uploaded_bytes: 0,
            chunk_watermark: None,
            chunks_received: 0,
            leader_url: metadata.leader_url.clone(),
            chat_id: metadata.chat_id,
            msg_id: metadata.msg_id,
            last_seen: Instant::now(),
            status: SessionStatus::Streaming,
            sink,
        };

        match self.sessions.entry(task_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                // Lost the creation race; discard the extra subprocess.
                let mut orphan = session;
                orphan.sink.abort().await;
                Ok(Arc::clone(existing.get()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(
                    "Opened stream session for {} ({}, {} bytes expected)",
                    task_id, metadata.file_name, metadata.total_size
                );
                let session = Arc::new(Mutex::new(session));
                slot.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    /// Live progress for a task, falling back to the persisted record.
    pub async fn get_progress(&self, task_id: &str) -> Result<Option<ProgressView>> {
        if let Some(session) = self.sessions.get(task_id) {
            let session = session.lock().await;
            return Ok(Some(ProgressView {
                last_chunk_index: session.chunk_watermark,
                uploaded_bytes: session.uploaded_bytes,
            }));
        }
        Ok(self.progress.load(task_id).await?.map(|p| ProgressView {
            last_chunk_index: p.last_chunk_index,
            uploaded_bytes: p.uploaded_bytes,
        }))
    }

    /// Full picture: persisted record preferred, live session layered over.
    pub async fn get_task_full_progress(&self, task_id: &str) -> Result<Option<StreamProgress>> {
        let mut progress = self.progress.load(task_id).await?;
        if let Some(session) = self.sessions.get(task_id) {
            let session = session.lock().await;
            progress = Some(StreamProgress {
                task_id: task_id.to_string(),
                file_name: session.file_name.clone(),
                uploaded_bytes: session.uploaded_bytes,
                last_chunk_index: session.chunk_watermark,
                total_size: session.total_size,
                updated_at: chrono::Utc::now().timestamp_millis(),
            });
        }
        Ok(progress)
    }

    /// Abort a task's session and drop its subprocess.
    pub async fn abort_session(&self, task_id: &str) {
        if let Some((_, session)) = self.sessions.remove(task_id) {
            let mut session = session.lock().await;
            session.sink.abort().await;
            warn!("Aborted stream session for {}", task_id);
        }
    }

    /// Start the janitor loop reaping silent sessions.
    pub fn start_janitor(self: Arc<Self>) {
        let mut stop_slot = self.janitor_stop.lock();
        if stop_slot.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *stop_slot = Some(tx);
        drop(stop_slot);

        let worker = Arc::clone(&self);
        let interval = self.config.janitor_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        worker.reap_stale_once().await;
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.janitor_handle.lock() = Some(handle);
    }

    /// Stop the janitor and abort every live session.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.janitor_stop.lock().take() {
            let _ = tx.send(true);
        }
        let handle = self.janitor_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let task_ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for task_id in task_ids {
            self.abort_session(&task_id).await;
        }
    }

    /// One janitor sweep: kill sessions silent past the stale timeout.
    pub async fn reap_stale_once(&self) -> usize {
        let mut stale = Vec::new();
        for entry in self.sessions.iter() {
            // A locked session is mid-chunk, hence not stale.
            if let Ok(session) = entry.value().try_lock() {
                if session.last_seen.elapsed() > self.config.stale_timeout {
                    stale.push(entry.key().clone());
                }
            }
        }
        for task_id in &stale {
            warn!("Reaping stale stream session {}", task_id);
            self.abort_session(task_id).await;
        }
        stale.len()
    }

    async fn persist_progress(&self, session: &StreamSession) {
        let progress = StreamProgress {
            task_id: session.task_id.clone(),
            file_name: session.file_name.clone(),
            uploaded_bytes: session.uploaded_bytes,
            last_chunk_index: session.chunk_watermark,
            total_size: session.total_size,
            updated_at: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.progress.save(&progress).await {
            debug!("Progress save for {} failed: {}", session.task_id, e);
        }
    }

    async fn report_status(
        &self,
        leader_url: &str,
        task_id: &str,
        status: &str,
        error: Option<&str>,
        uploaded_bytes: u64,
        total_size: u64,
    ) {
        if leader_url.is_empty() {
            return;
        }
        let url = format!(
            "{}/api/v2/tasks/{}/status",
            leader_url.trim_end_matches('/'),
            task_id
        );
        let body = json!({
            "status": status,
            "error": error,
            "uploadedBytes": uploaded_bytes,
            "totalSize": total_size,
        });
        if let Err(e) = self.http_client.post(&url).json(&body).send().await {
            debug!("Status report to {} failed: {}", url, e);
        }
    }
}

fn progress_text(uploaded: u64, total: u64, file_name: &str) -> String {
    if total > 0 {
        let percent = (uploaded as f64 / total as f64 * 100.0).min(100.0);
        format!("Uploading {}: {:.1}%", file_name, percent)
    } else {
        format!("Uploading {}: {} bytes", file_name, uploaded)
    }
}
