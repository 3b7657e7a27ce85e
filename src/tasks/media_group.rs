// Media Group Buffer
//
// Coalesces related inbound messages per chat. A group is emitted when the
// buffer reaches the threshold or when the flush timer fires after a quiet
// period; the timer is re-armed on every add. While a chat's group is being
// processed, further messages for that chat are rejected. Each buffer's
// timer doubles as its flush trigger, so these are real timers rather than
// a periodic sweep.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::MediaGroupConfig;

/// A completed group of related messages, in arrival order.
#[derive(Debug, Clone)]
pub struct MediaGroup {
    pub chat_id: i64,
    pub messages: Vec<Value>,
}

/// Result of offering a message to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Message buffered; the group is still collecting
    Buffered,
    /// This message completed the group and caused an emission
    Flushed,
    /// The chat's current group is being processed; message rejected
    AlreadyProcessing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferStatus {
    Collecting,
    Processing,
}

struct BufferEntry {
    messages: Vec<Value>,
    started_at: Instant,
    last_update: Instant,
    status: BufferStatus,
}

pub struct MediaGroupBuffer {
    config: MediaGroupConfig,
    buffers: DashMap<i64, BufferEntry>,
    timers: DashMap<i64, tokio::task::JoinHandle<()>>,
    events: mpsc::UnboundedSender<MediaGroup>,
    /// Handle to self for the flush timers
    self_ref: Weak<Self>,
}

impl MediaGroupBuffer {
    /// Build a buffer and the receiver on which completed groups arrive.
    pub fn new(config: MediaGroupConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<MediaGroup>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffer = Arc::new_cyclic(|weak| Self {
            config,
            buffers: DashMap::new(),
            timers: DashMap::new(),
            events: tx,
            self_ref: weak.clone(),
        });
        (buffer, rx)
    }

    /// Offer a message. Returns `Flushed` iff this add emitted the group.
    pub fn add(&self, chat_id: i64, message: Value) -> AddOutcome {
        let reached_threshold;
        {
            let mut entry = self.buffers.entry(chat_id).or_insert_with(|| BufferEntry {
                messages: Vec::new(),
                started_at: Instant::now(),
                last_update: Instant::now(),
                status: BufferStatus::Collecting,
            });
            if entry.status == BufferStatus::Processing {
                debug!("Rejecting message for chat {}: group in flight", chat_id);
                return AddOutcome::AlreadyProcessing;
            }
            entry.messages.push(message);
            entry.last_update = Instant::now();
            reached_threshold = entry.messages.len() >= self.config.buffer_threshold;
        }

        if reached_threshold {
            self.flush(chat_id);
            AddOutcome::Flushed
        } else {
            self.arm_timer(chat_id);
            AddOutcome::Buffered
        }
    }

    fn arm_timer(&self, chat_id: i64) {
        let Some(buffer) = self.self_ref.upgrade() else {
            return;
        };
        let timeout = self.config.buffer_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Drop our own handle first so flush never aborts the running task.
            buffer.timers.remove(&chat_id);
            buffer.flush(chat_id);
        });
        if let Some(previous) = self.timers.insert(chat_id, handle) {
            previous.abort();
        }
    }

    /// Emit the chat's buffered messages as a group and mark it processing.
    fn flush(&self, chat_id: i64) {
        if let Some((_, timer)) = self.timers.remove(&chat_id) {
            timer.abort();
        }

        let group = {
            let Some(mut entry) = self.buffers.get_mut(&chat_id) else {
                return;
            };
            if entry.status == BufferStatus::Processing || entry.messages.is_empty() {
                return;
            }
            entry.status = BufferStatus::Processing;
            MediaGroup {
                chat_id,
                messages: entry.messages.clone(),
            }
        };

        debug!(
            "Emitting media group for chat {} with {} messages",
            chat_id,
            group.messages.len()
        );
        let _ = self.events.send(group);
    }

    /// Snapshot of a chat's buffered messages.
    pub fn get(&self, chat_id: i64) -> Vec<Value> {
        self.buffers
            .get(&chat_id)
            .map(|entry| entry.messages.clone())
            .unwrap_or_default()
    }

    /// Seconds the chat's buffer has been collecting, if any.
    pub fn buffer_age(&self, chat_id: i64) -> Option<std::time::Duration> {
        self.buffers.get(&chat_id).map(|e| e.started_at.elapsed())
    }

    /// Mark a chat's emitted group as handled, clearing its buffer.
    pub fn complete(&self, chat_id: i64) {
        self.buffers.remove(&chat_id);
        if let Some((_, timer)) = self.timers.remove(&chat_id) {
            timer.abort();
        }
    }

    /// Drop every buffer and cancel every timer.
    pub fn cleanup(&self) {
        for entry in self.timers.iter() {
            entry.value().abort();
        }
        self.timers.clear();
        self.buffers.clear();
    }
}
