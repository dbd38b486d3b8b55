//! End-to-end cycle scenarios against the in-memory store and gateway.

mod common;

use serde_json::json;

use common::{fixed_clock, make_harness, make_harness_with, record_events, tasks_table, TestClock};
use tidesync::{LocalStore, SyncError, SyncEvent, SyncOptions};

fn options_with_clock(ms: i64) -> SyncOptions {
    SyncOptions {
        time_provider: Some(fixed_clock(ms)),
        ..SyncOptions::default()
    }
}

// ============================================================================
// First sync
// ============================================================================

#[tokio::test]
async fn first_sync_materializes_remote_rows_locally() {
    let h = make_harness(
        vec![tasks_table().build().unwrap()],
        options_with_clock(5_000_000_000_000),
    );
    h.gateway.seed(
        "tasks",
        vec![json!({
            "id": "R1",
            "title": "A",
            "updated_at": "2025-01-01T00:00:00Z",
            "is_deleted": false,
        })],
    );

    h.manager.sync_now(None).await.expect("first sync");

    let local = h
        .store
        .find_by_id("tasks", "tasks:R1")
        .unwrap()
        .expect("row materialized under deterministic id");
    assert_eq!(local["title"], json!("A"));
    assert_eq!(local["remote_id"], json!("R1"));
    assert_eq!(local["updated_at"], json!(1735689600000i64));
    assert_eq!(local["is_deleted"], json!(false));

    assert_eq!(h.gateway.write_count(), 0, "pull must not write remotely");
}

#[tokio::test]
async fn soft_deleted_remote_rows_without_local_match_are_ignored() {
    let h = make_harness(vec![tasks_table().build().unwrap()], options_with_clock(10));
    h.gateway.seed(
        "tasks",
        vec![json!({
            "id": "R1",
            "title": "gone",
            "updated_at": "2025-01-01T00:00:00Z",
            "is_deleted": true,
        })],
    );

    h.manager.sync_now(None).await.unwrap();
    assert_eq!(h.store.count("tasks"), 0);
}

// ============================================================================
// First push
// ============================================================================

#[tokio::test]
async fn local_create_inserts_remotely_and_writes_back_the_link() {
    let h = make_harness(vec![tasks_table().build().unwrap()], options_with_clock(10));
    h.store
        .create(
            "tasks",
            json!({"id": "L1", "title": "B", "remote_id": "", "updated_at": 1000}),
        )
        .unwrap();

    h.manager.sync_now(None).await.expect("push");

    let rows = h.gateway.rows("tasks");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["title"], json!("B"));
    let assigned = rows[0]["id"].as_str().unwrap().to_string();
    assert!(!assigned.is_empty());

    let local = h.store.find_by_id("tasks", "L1").unwrap().unwrap();
    assert_eq!(local["remote_id"], json!(assigned));
    assert_eq!(local["updated_at"], json!(1000), "timestamp follows the stored remote row");
    assert_eq!(h.gateway.write_count(), 1, "exactly one insert");
}

// ============================================================================
// Conflict — remote wins
// ============================================================================

#[tokio::test]
async fn conflicting_row_converges_to_the_remote_payload() {
    let h = make_harness(vec![tasks_table().build().unwrap()], options_with_clock(10));
    h.store
        .create(
            "tasks",
            json!({"id": "L1", "title": "local", "remote_id": "R1", "updated_at": 1000}),
        )
        .unwrap();
    h.gateway.seed(
        "tasks",
        vec![json!({
            "id": "R1",
            "title": "remote",
            "updated_at": tidesync::iso_string(2000),
            "is_deleted": false,
        })],
    );
    let events = record_events(&h.manager);

    h.manager.sync_now(None).await.unwrap();

    let local = h.store.find_by_id("tasks", "L1").unwrap().unwrap();
    assert_eq!(local["title"], json!("remote"));
    assert_eq!(local["updated_at"], json!(2000));
    assert_eq!(h.gateway.rows("tasks")[0]["title"], json!("remote"));
    assert_eq!(h.gateway.write_count(), 0, "remote stays untouched");

    let conflicts = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, SyncEvent::Conflict { .. }))
        .count();
    assert_eq!(conflicts, 1, "the skipped push surfaces as a conflict event");
}

// ============================================================================
// Unique-key recovery
// ============================================================================

#[tokio::test]
async fn unlinked_local_row_adopts_the_matching_remote_row() {
    let h = make_harness(
        vec![tasks_table().unique_key("title", "title").build().unwrap()],
        options_with_clock(10),
    );
    h.store
        .create(
            "tasks",
            json!({"id": "L1", "title": "Alpha", "remote_id": "", "updated_at": 1000}),
        )
        .unwrap();
    h.gateway.seed(
        "tasks",
        vec![json!({
            "id": "R1",
            "title": "Alpha",
            "updated_at": tidesync::iso_string(1500),
            "is_deleted": false,
        })],
    );

    h.manager.sync_now(None).await.unwrap();

    assert_eq!(h.store.count("tasks"), 1, "no duplicate row");
    assert_eq!(h.gateway.rows("tasks").len(), 1, "no remote insert");
    let local = h.store.find_by_id("tasks", "L1").unwrap().unwrap();
    assert_eq!(local["remote_id"], json!("R1"));
    assert_eq!(local["updated_at"], json!(1500));
}

#[tokio::test]
async fn unique_key_link_is_recorded_even_on_a_timestamp_tie() {
    let h = make_harness(
        vec![tasks_table().unique_key("title", "title").build().unwrap()],
        options_with_clock(10),
    );
    // Exact millisecond tie: pull's strictly-newer check leaves the local
    // row alone, and push skips the upsert because remote wins ties — but
    // the resolved link must still be written back.
    h.store
        .create(
            "tasks",
            json!({"id": "L1", "title": "Alpha", "remote_id": "", "updated_at": 1000}),
        )
        .unwrap();
    h.gateway.seed(
        "tasks",
        vec![json!({
            "id": "R1",
            "title": "Alpha",
            "updated_at": tidesync::iso_string(1000),
            "is_deleted": false,
        })],
    );

    h.manager.sync_now(None).await.unwrap();

    assert_eq!(h.gateway.write_count(), 0, "tie: no remote write");
    assert_eq!(h.gateway.rows("tasks").len(), 1, "no duplicate insert");
    let local = h.store.find_by_id("tasks", "L1").unwrap().unwrap();
    assert_eq!(local["remote_id"], json!("R1"), "link recorded despite the skipped push");

    // With the link in place the row stays quiet on later cycles.
    h.manager.sync_now(None).await.unwrap();
    assert_eq!(h.gateway.write_count(), 0);
}

#[tokio::test]
async fn unique_key_links_on_push_when_local_is_newer() {
    let h = make_harness(
        vec![tasks_table().unique_key("title", "title").build().unwrap()],
        options_with_clock(10),
    );
    h.store
        .create(
            "tasks",
            json!({"id": "L1", "title": "Alpha", "remote_id": "", "updated_at": 2000}),
        )
        .unwrap();
    h.gateway.seed(
        "tasks",
        vec![json!({
            "id": "R1",
            "title": "Alpha",
            "updated_at": tidesync::iso_string(1500),
            "is_deleted": false,
        })],
    );

    h.manager.sync_now(None).await.unwrap();

    // Pull leaves the older remote alone; push resolves R1 by unique key
    // and updates it in place instead of inserting a duplicate.
    let rows = h.gateway.rows("tasks");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["updated_at"], json!(tidesync::iso_string(2000)));
    let local = h.store.find_by_id("tasks", "L1").unwrap().unwrap();
    assert_eq!(local["remote_id"], json!("R1"));
}

// ============================================================================
// Soft-delete round trip
// ============================================================================

#[tokio::test]
async fn soft_delete_propagates_across_devices() {
    let gateway = std::sync::Arc::new(common::MemoryGateway::new());
    let clock_a = TestClock::new(500);
    let clock_b = TestClock::new(600);

    let device_a = make_harness_with(
        std::sync::Arc::new(tidesync::MemoryStore::new()),
        std::sync::Arc::clone(&gateway),
        vec![tasks_table().build().unwrap()],
        SyncOptions {
            time_provider: Some(clock_a.provider()),
            ..SyncOptions::default()
        },
    );
    let device_b = make_harness_with(
        std::sync::Arc::new(tidesync::MemoryStore::new()),
        std::sync::Arc::clone(&gateway),
        vec![tasks_table().build().unwrap()],
        SyncOptions {
            time_provider: Some(clock_b.provider()),
            ..SyncOptions::default()
        },
    );

    // Device A creates and pushes.
    device_a
        .store
        .create(
            "tasks",
            json!({"id": "L1", "title": "shared", "remote_id": "", "updated_at": 1000}),
        )
        .unwrap();
    device_a.manager.sync_now(None).await.unwrap();
    let remote_id = device_a.store.find_by_id("tasks", "L1").unwrap().unwrap()["remote_id"]
        .as_str()
        .unwrap()
        .to_string();

    // Device B picks the row up.
    clock_b.set(1100);
    device_b.manager.sync_now(None).await.unwrap();
    let b_id = format!("tasks:{remote_id}");
    assert!(device_b.store.find_by_id("tasks", &b_id).unwrap().is_some());

    // Device A deletes; push soft-deletes the remote row at "now".
    clock_a.set(3000);
    device_a.store.delete("tasks", "L1").unwrap();
    device_a.manager.sync_now(None).await.unwrap();

    let remote = &gateway.rows("tasks")[0];
    assert_eq!(remote["is_deleted"], json!(true), "logical delete only");
    assert_eq!(remote["updated_at"], json!(tidesync::iso_string(3000)));

    // Device B's next pull removes its local copy.
    clock_b.set(3100);
    device_b.manager.sync_now(None).await.unwrap();
    assert!(device_b.store.find_by_id("tasks", &b_id).unwrap().is_none());
    assert_eq!(gateway.rows("tasks").len(), 1, "row is never physically removed");
}

// ============================================================================
// Errors
// ============================================================================

#[tokio::test]
async fn gateway_failure_rejects_the_caller_and_counts_the_error() {
    let h = make_harness(vec![tasks_table().build().unwrap()], options_with_clock(10));
    h.store
        .create(
            "tasks",
            json!({"id": "L1", "title": "B", "remote_id": "", "updated_at": 1000}),
        )
        .unwrap();
    h.gateway.set_fail_writes(true);
    let events = record_events(&h.manager);

    let result = h.manager.sync_now(None).await;
    assert!(matches!(result, Err(SyncError::Gateway(_))));
    assert_eq!(h.manager.state().errors, 1);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, SyncEvent::Error { label: Some(l), .. } if l == "tasks")));

    // The failure is not retried on its own; an explicit trigger recovers.
    h.gateway.set_fail_writes(false);
    h.manager.sync_now(None).await.expect("recovery");
    assert_eq!(h.gateway.rows("tasks").len(), 1);
}

#[tokio::test]
async fn duplicate_local_unique_keys_abort_the_cycle() {
    let h = make_harness(
        vec![tasks_table().unique_key("title", "title").build().unwrap()],
        options_with_clock(10),
    );
    h.store
        .create("tasks", json!({"id": "L1", "title": "Dup", "remote_id": "", "updated_at": 1}))
        .unwrap();
    h.store
        .create("tasks", json!({"id": "L2", "title": "Dup", "remote_id": "", "updated_at": 2}))
        .unwrap();
    // An unmatched live remote row forces the unique index to be built.
    h.gateway.seed(
        "tasks",
        vec![json!({
            "id": "R9",
            "title": "Zeta",
            "updated_at": tidesync::iso_string(5),
            "is_deleted": false,
        })],
    );

    let result = h.manager.sync_now(None).await;
    assert!(matches!(result, Err(SyncError::DuplicateLocalKey { .. })));
    assert_eq!(h.gateway.write_count(), 0, "aborted before push");
}

#[tokio::test]
async fn duplicate_remote_unique_keys_abort_the_cycle() {
    let h = make_harness(
        vec![tasks_table().unique_key("title", "title").build().unwrap()],
        options_with_clock(10),
    );
    h.gateway.seed(
        "tasks",
        vec![
            json!({"id": "R1", "title": "Dup", "updated_at": tidesync::iso_string(1), "is_deleted": false}),
            json!({"id": "R2", "title": "Dup", "updated_at": tidesync::iso_string(2), "is_deleted": false}),
        ],
    );

    let result = h.manager.sync_now(None).await;
    assert!(matches!(result, Err(SyncError::DuplicateRemoteKey { .. })));
}

#[tokio::test]
async fn soft_deleted_remote_row_may_share_a_unique_key_with_its_successor() {
    let h = make_harness(
        vec![tasks_table().unique_key("title", "title").build().unwrap()],
        options_with_clock(10),
    );
    // Delete-then-recreate leaves a tombstone and a live row under one key.
    h.gateway.seed(
        "tasks",
        vec![
            json!({"id": "R1", "title": "Alpha", "updated_at": tidesync::iso_string(1), "is_deleted": true}),
            json!({"id": "R2", "title": "Alpha", "updated_at": tidesync::iso_string(2), "is_deleted": false}),
        ],
    );

    h.manager.sync_now(None).await.expect("legal remote state");
    assert_eq!(h.store.count("tasks"), 1);
    assert!(h.store.find_by_id("tasks", "tasks:R2").unwrap().is_some());
}

// ============================================================================
// Concurrent sync_now
// ============================================================================

#[tokio::test]
async fn overlapping_sync_calls_share_completion_and_compensate() {
    let h = make_harness(vec![tasks_table().build().unwrap()], options_with_clock(10));
    let events = record_events(&h.manager);

    let (a, b) = tokio::join!(h.manager.sync_now(None), h.manager.sync_now(None));
    a.expect("first caller");
    b.expect("second caller");

    let cycles = common::pulled_count(&events, "tasks");
    assert!(
        (1..=2).contains(&cycles),
        "coalesced into at most one compensation cycle, got {cycles}"
    );
}
