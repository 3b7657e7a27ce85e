// Coordination scenarios: lock contention across instances, leader
// uniqueness, and dead-instance detection with orphaned-task recovery.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{coordinator_on, MemoryKv};
use media_relay::coordination::{InstanceRecord, InstanceStatus};

#[tokio::test]
async fn lock_contention_exactly_one_winner() {
    let kv = MemoryKv::new("memory");
    let a = coordinator_on(&kv);
    let b = coordinator_on(&kv);
    let c = coordinator_on(&kv);

    for coordinator in [&a, &b, &c] {
        coordinator.heartbeat().await.unwrap();
    }

    // Three instances race for the same lock.
    let (ra, rb, rc) = tokio::join!(
        a.acquire_lock("task-1", Duration::from_secs(60), Some(1)),
        b.acquire_lock("task-1", Duration::from_secs(60), Some(1)),
        c.acquire_lock("task-1", Duration::from_secs(60), Some(1)),
    );
    let wins = [ra.unwrap(), rb.unwrap(), rc.unwrap()];
    assert_eq!(wins.iter().filter(|w| **w).count(), 1);

    // The holder releases; a fresh attempt succeeds.
    let winner = if wins[0] {
        &a
    } else if wins[1] {
        &b
    } else {
        &c
    };
    winner.release_lock("task-1").await.unwrap();
    assert!(a
        .acquire_lock("task-1", Duration::from_secs(60), Some(1))
        .await
        .unwrap());
}

#[tokio::test]
async fn leader_is_unique_in_stable_set() {
    let kv = MemoryKv::new("memory");
    let coordinators = [
        coordinator_on(&kv),
        coordinator_on(&kv),
        coordinator_on(&kv),
    ];
    for coordinator in &coordinators {
        coordinator.heartbeat().await.unwrap();
    }

    let mut leaders = 0;
    for coordinator in &coordinators {
        if coordinator.is_leader().await.unwrap() {
            leaders += 1;
        }
    }
    assert_eq!(leaders, 1);

    // The leader is the smallest id.
    let smallest = coordinators
        .iter()
        .map(|c| c.instance_id().to_string())
        .min()
        .unwrap();
    assert_eq!(
        coordinators[0].get_leader_id().await.unwrap(),
        Some(smallest)
    );
}

#[tokio::test]
async fn dead_instance_detection_and_orphan_recovery() {
    let kv = MemoryKv::new("memory");
    let live = coordinator_on(&kv);
    live.heartbeat().await.unwrap();

    // A peer that stopped heartbeating a minute ago.
    let dead = InstanceRecord {
        id: "dead-1".to_string(),
        url: "http://dead".to_string(),
        hostname: "gone".to_string(),
        region: "test".to_string(),
        started_at: Utc::now() - chrono::Duration::seconds(300),
        last_heartbeat: Utc::now() - chrono::Duration::seconds(60),
        status: InstanceStatus::Active,
    };
    kv.store.insert(
        "instance:dead-1".to_string(),
        serde_json::to_string(&dead).unwrap(),
    );

    let detected = live.detect_dead_instances().await.unwrap();
    assert!(detected.contains(&"dead-1".to_string()));

    // A task-state mirror still owned by the dead instance is recovered.
    kv.store.insert(
        "state:system:task:task".to_string(),
        serde_json::json!({"instanceId": "dead-1", "heartbeat": 0, "status": "uploading"})
            .to_string(),
    );
    assert!(live.recover_orphaned_task("task", "new-1").await.unwrap());

    let raw = kv.store.get("state:system:task:task").unwrap().clone();
    let state: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(state["instanceId"], "new-1");
    assert!(state["heartbeat"].as_i64().unwrap() > 0);
    assert_eq!(state["status"], "uploading");
}

#[tokio::test]
async fn dead_owner_lock_is_preempted() {
    let kv = MemoryKv::new("memory");
    let a = coordinator_on(&kv);
    let b = coordinator_on(&kv);
    a.heartbeat().await.unwrap();
    b.heartbeat().await.unwrap();

    assert!(a.acquire_task_lock("t9").await.unwrap());

    // The owner's record vanishes (crashed instance, TTL expiry).
    kv.store.remove(&format!("instance:{}", a.instance_id()));

    assert!(b.acquire_task_lock("t9").await.unwrap());
    assert!(b.has_lock("task:t9").await.unwrap());
}
