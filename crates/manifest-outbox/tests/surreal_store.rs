//! SurrealDB store integration tests against the in-memory engine.

use std::time::Duration;

use chrono::Utc;
use manifest_causality::VectorClock;
use manifest_outbox::{
    AggregateRow, AggregateStore, CommandTransaction, OutboxRecord, OutboxStatus, OutboxStore,
    SurrealStore,
};
use serde_json::json;

fn row(aggregate_id: &str, seq: u64) -> OutboxRecord {
    let mut clock = VectorClock::new();
    clock.increment("actor-a");
    OutboxRecord::pending(
        "PrepTask",
        aggregate_id,
        "kitchen.task.claimed",
        json!({ "employeeId": "emp-7" }),
        seq,
        clock,
    )
}

fn txn(aggregate_id: &str, seqs: &[u64]) -> CommandTransaction {
    let mut clock = VectorClock::new();
    clock.increment("actor-a");
    CommandTransaction {
        aggregate: AggregateRow {
            aggregate_type: "PrepTask".to_string(),
            aggregate_id: aggregate_id.to_string(),
            state: json!({ "status": "open" }),
            last_seq: seqs.iter().copied().max().unwrap_or(0),
            clock,
            updated_at: Utc::now(),
        },
        events: seqs.iter().map(|&seq| row(aggregate_id, seq)).collect(),
    }
}

#[tokio::test]
async fn commit_then_load_round_trip() {
    let store = SurrealStore::in_memory().await.expect("connect");
    store.commit(txn("task-1", &[1])).await.expect("commit");

    let loaded = store
        .load("PrepTask", "task-1")
        .await
        .expect("load")
        .expect("aggregate row");
    assert_eq!(loaded.aggregate_id, "task-1");
    assert_eq!(loaded.last_seq, 1);
    assert_eq!(loaded.clock.get("actor-a"), 1);
    assert_eq!(loaded.state, json!({ "status": "open" }));
}

#[tokio::test]
async fn recommit_replaces_aggregate_row() {
    let store = SurrealStore::in_memory().await.expect("connect");
    store.commit(txn("task-1", &[1])).await.expect("commit 1");
    store.commit(txn("task-1", &[2])).await.expect("commit 2");

    let loaded = store
        .load("PrepTask", "task-1")
        .await
        .expect("load")
        .expect("aggregate row");
    assert_eq!(loaded.last_seq, 2);
}

#[tokio::test]
async fn duplicate_sequence_aborts_commit() {
    let store = SurrealStore::in_memory().await.expect("connect");
    store.commit(txn("task-1", &[1])).await.expect("commit 1");

    let err = store.commit(txn("task-1", &[2, 1])).await;
    assert!(err.is_err(), "duplicate seq must abort");

    // The valid row from the aborted transaction must not exist.
    let claimed = store.claim_batch("w1", 10).await.expect("claim");
    let seqs: Vec<u64> = claimed.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![1]);
}

#[tokio::test]
async fn claim_publish_round_trip() {
    let store = SurrealStore::in_memory().await.expect("connect");
    store.commit(txn("task-1", &[1, 2])).await.expect("commit");

    let claimed = store.claim_batch("w1", 10).await.expect("claim");
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].seq, 1);
    assert_eq!(claimed[0].status, OutboxStatus::Publishing);
    assert_eq!(claimed[0].claimed_by.as_deref(), Some("w1"));

    // Second worker sees nothing while w1 holds the aggregate.
    let other = store.claim_batch("w2", 10).await.expect("claim w2");
    assert!(other.is_empty());

    assert!(store
        .mark_published(&claimed[0].id, "w1")
        .await
        .expect("publish"));
    let published = store
        .get(&claimed[0].id)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(published.status, OutboxStatus::Published);
    assert!(published.published_at.is_some());
}

#[tokio::test]
async fn retry_bumps_attempts_and_defers() {
    let store = SurrealStore::in_memory().await.expect("connect");
    store.commit(txn("task-1", &[1])).await.expect("commit");

    let claimed = store.claim_batch("w1", 10).await.expect("claim");
    assert!(store
        .retry_later(&claimed[0].id, "w1", "channel down", Duration::from_secs(3600))
        .await
        .expect("retry"));

    let row = store.get(&claimed[0].id).await.expect("get").expect("row");
    assert_eq!(row.status, OutboxStatus::Pending);
    assert_eq!(row.attempts, 1);
    assert_eq!(row.last_error.as_deref(), Some("channel down"));

    // Backing off: not claimable yet.
    let reclaim = store.claim_batch("w1", 10).await.expect("claim again");
    assert!(reclaim.is_empty());
}

#[tokio::test]
async fn dead_letters_are_parked_and_listed() {
    let store = SurrealStore::in_memory().await.expect("connect");
    store.commit(txn("task-1", &[1])).await.expect("commit");

    let claimed = store.claim_batch("w1", 10).await.expect("claim");
    assert!(store
        .mark_dead(&claimed[0].id, "w1", "payload exceeds channel maximum")
        .await
        .expect("dead"));

    let dead = store.dead_letters().await.expect("dead letters");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].status, OutboxStatus::Dead);
    assert_eq!(
        dead[0].last_error.as_deref(),
        Some("payload exceeds channel maximum")
    );

    // Dead rows are never claimable again.
    let reclaim = store.claim_batch("w1", 10).await.expect("claim");
    assert!(reclaim.is_empty());
}

#[tokio::test]
async fn sweeper_requeues_expired_claims() {
    let store = SurrealStore::in_memory().await.expect("connect");
    store.commit(txn("task-1", &[1])).await.expect("commit");

    let claimed = store.claim_batch("w1", 10).await.expect("claim");
    assert_eq!(claimed.len(), 1);

    // Long timeout: claim still fresh.
    assert_eq!(
        store
            .requeue_stuck(Duration::from_secs(3600))
            .await
            .expect("sweep"),
        0
    );
    // Zero timeout: requeued, then claimable by another worker.
    assert_eq!(
        store.requeue_stuck(Duration::ZERO).await.expect("sweep"),
        1
    );
    let reclaimed = store.claim_batch("w2", 10).await.expect("claim w2");
    assert_eq!(reclaimed.len(), 1);

    // The original claimant's transition is refused after the reclaim.
    assert!(!store
        .mark_published(&claimed[0].id, "w1")
        .await
        .expect("stale publish"));
    assert!(store
        .mark_published(&reclaimed[0].id, "w2")
        .await
        .expect("w2 publish"));
}

#[tokio::test]
async fn pending_age_tracks_oldest_row() {
    let store = SurrealStore::in_memory().await.expect("connect");
    assert!(store.pending_age().await.expect("age").is_none());

    store.commit(txn("task-1", &[1])).await.expect("commit");
    assert!(store.pending_age().await.expect("age").is_some());
}
