// # Stream Transfer
//
// Leader-to-worker chunked relay. The leader downloads chunks from the
// upstream and POSTs them to a worker, which streams them into a cloud
// upload subprocess. Chunk metadata rides in request headers; progress is
// resumable through the shared store; a janitor reaps silent sessions.

pub mod leader;
pub mod progress;
pub mod worker;

pub use leader::{ForwardOutcome, StreamLeader};
pub use progress::{ProgressStore, StreamProgress};
pub use worker::{ChunkAck, StreamWorker, UploadSink, UploadSinkFactory};

use crate::error::{RelayError, Result};

/// Header names for out-of-band chunk metadata.
pub const HDR_INSTANCE_SECRET: &str = "x-instance-secret";
pub const HDR_FILE_NAME: &str = "x-file-name";
pub const HDR_USER_ID: &str = "x-user-id";
pub const HDR_IS_LAST: &str = "x-is-last";
pub const HDR_CHUNK_INDEX: &str = "x-chunk-index";
pub const HDR_TOTAL_SIZE: &str = "x-total-size";
pub const HDR_LEADER_URL: &str = "x-leader-url";
pub const HDR_SOURCE_INSTANCE_ID: &str = "x-source-instance-id";
pub const HDR_CHAT_ID: &str = "x-chat-id";
pub const HDR_MSG_ID: &str = "x-msg-id";

/// Out-of-band metadata for one chunk.
#[derive(Debug, Clone)]
pub struct ChunkMetadata {
    /// URL-encoded on the wire
    pub file_name: String,
    pub user_id: String,
    pub is_last: bool,
    pub chunk_index: u64,
    pub total_size: u64,
    pub leader_url: String,
    pub source_instance_id: String,
    pub chat_id: i64,
    pub msg_id: i64,
}

impl ChunkMetadata {
    /// Parse metadata from a header lookup function. Missing or malformed
    /// required headers are an `InvalidState` error (500 at the boundary).
    pub fn from_lookup<'a, F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        fn required<'a, F: Fn(&str) -> Option<&'a str>>(lookup: &F, name: &str) -> Result<String> {
            lookup(name)
                .map(|v| v.to_string())
                .ok_or_else(|| RelayError::InvalidState(format!("Missing header {}", name)))
        }

        let file_name = required(&lookup, HDR_FILE_NAME)?;
        let file_name = percent_decode(&file_name);
        let chunk_index = required(&lookup, HDR_CHUNK_INDEX)?
            .parse::<u64>()
            .map_err(|_| RelayError::InvalidState("Bad x-chunk-index".to_string()))?;
        let total_size = lookup(HDR_TOTAL_SIZE)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let is_last = lookup(HDR_IS_LAST)
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let chat_id = lookup(HDR_CHAT_ID)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let msg_id = lookup(HDR_MSG_ID)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        Ok(Self {
            file_name,
            user_id: required(&lookup, HDR_USER_ID)?,
            is_last,
            chunk_index,
            total_size,
            leader_url: lookup(HDR_LEADER_URL).unwrap_or_default().to_string(),
            source_instance_id: lookup(HDR_SOURCE_INSTANCE_ID)
                .unwrap_or_default()
                .to_string(),
            chat_id,
            msg_id,
        })
    }
}

/// Minimal percent-decoding for the URL-encoded file name header.
pub(crate) fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(
                std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""),
                16,
            ) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("video%20file.mp4"), "video file.mp4");
        assert_eq!(percent_decode("plain.bin"), "plain.bin");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
    }

    #[test]
    fn test_metadata_from_headers() {
        let mut headers = HashMap::new();
        headers.insert(HDR_FILE_NAME, "a%20b.mp4");
        headers.insert(HDR_USER_ID, "u1");
        headers.insert(HDR_CHUNK_INDEX, "7");
        headers.insert(HDR_TOTAL_SIZE, "1024");
        headers.insert(HDR_IS_LAST, "true");
        headers.insert(HDR_LEADER_URL, "http://leader");
        headers.insert(HDR_SOURCE_INSTANCE_ID, "inst-1");
        headers.insert(HDR_CHAT_ID, "12345");
        headers.insert(HDR_MSG_ID, "10");

        let meta = ChunkMetadata::from_lookup(|name| headers.get(name).copied()).unwrap();
        assert_eq!(meta.file_name, "a b.mp4");
        assert_eq!(meta.chunk_index, 7);
        assert!(meta.is_last);
        assert_eq!(meta.chat_id, 12345);
    }

    #[test]
    fn test_metadata_missing_required_header() {
        let headers: HashMap<&str, &str> = HashMap::new();
        assert!(ChunkMetadata::from_lookup(|name| headers.get(name).copied()).is_err());
    }
}
