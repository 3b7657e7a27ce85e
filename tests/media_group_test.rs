// Media group scenario: three related photos coalesce into one group.

use media_relay::config::MediaGroupConfig;
use media_relay::tasks::{AddOutcome, MediaGroupBuffer};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn three_photos_form_one_group() {
    let (buffer, mut rx) = MediaGroupBuffer::new(MediaGroupConfig {
        buffer_timeout: Duration::from_secs(1),
        buffer_threshold: 3,
    });

    assert_eq!(buffer.add(12345, json!({"id": 1})), AddOutcome::Buffered);
    assert_eq!(buffer.add(12345, json!({"id": 2})), AddOutcome::Buffered);
    // The third add crosses the threshold and emits the group.
    assert_eq!(buffer.add(12345, json!({"id": 3})), AddOutcome::Flushed);

    let group = rx.recv().await.unwrap();
    assert_eq!(group.chat_id, 12345);
    let ids: Vec<i64> = group
        .messages
        .iter()
        .map(|m| m["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    let snapshot = buffer.get(12345);
    assert_eq!(snapshot.len(), 3);
}

#[tokio::test]
async fn quiet_chat_flushes_on_timeout() {
    let (buffer, mut rx) = MediaGroupBuffer::new(MediaGroupConfig {
        buffer_timeout: Duration::from_millis(40),
        buffer_threshold: 10,
    });

    buffer.add(777, json!({"id": 1}));

    let group = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("group should flush on timeout")
        .unwrap();
    assert_eq!(group.chat_id, 777);
    assert_eq!(group.messages.len(), 1);
}
