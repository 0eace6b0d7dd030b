// sync/sync_tests.rs - End-to-end sync kernel scenarios
//
// Test Coverage:
// 1. Conflict taxonomy (missing title, notes collision)
// 2. Replay behavior for open and resolved conflicts
// 3. Resolution idempotency across transport replays
// 4. Event retention under repeated resolution
// 5. Full cycles against a replaying transport

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::db::queries;
use crate::db::Database;
use crate::sync::applier::{apply_incoming, ApplyOutcome, IncomingChange};
use crate::sync::conflicts::{self, ConflictEventType, ConflictStatus, ConflictType, ResolutionStrategy};
use crate::sync::outbox::{self, entity_idempotency_key, EntityType, Operation};
use crate::sync::profile::RuntimeProfile;
use crate::sync::resolution::{resolve, ResolutionPayload};
use crate::sync::runner::{CycleOutcome, SyncRunner};
use crate::sync::transport::{PullRequest, PullResponse, PushRequest, PushResponse, Transport};

fn missing_title_change() -> IncomingChange {
    IncomingChange {
        entity_type: EntityType::Task,
        entity_id: "t1".to_string(),
        operation: Operation::Upsert,
        updated_at: "2026-02-17T14:00:00.000Z".to_string(),
        updated_by_device: "device-b".to_string(),
        sync_version: 1,
        payload: json!({ "description": "x" }).to_string(),
        idempotency_key: "k1".to_string(),
    }
}

async fn conflict_id_of(db: &Database, change: &IncomingChange) -> String {
    match apply_incoming(db, change).await.unwrap() {
        ApplyOutcome::Conflict { conflict_id } => conflict_id,
        other => panic!("expected conflict, got {:?}", other),
    }
}

// Scenario 1: a task upsert without a title opens a field conflict with one
// detected event.
#[tokio::test]
async fn missing_title_change_opens_field_conflict() {
    let db = Database::open_in_memory().await.unwrap();
    let change = missing_title_change();

    let conflict_id = conflict_id_of(&db, &change).await;

    let record = conflicts::get(db.pool(), &conflict_id).await.unwrap().unwrap();
    assert_eq!(record.conflict_type, ConflictType::FieldConflict);
    assert_eq!(record.reason_code, "MISSING_TASK_TITLE");
    assert_eq!(record.status, ConflictStatus::Open);
    assert_eq!(record.incoming_idempotency_key, "k1");

    let events = conflicts::list_events(db.pool(), &conflict_id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, ConflictEventType::Detected);

    // No task row materialized
    assert!(queries::get_task(db.pool(), "t1").await.unwrap().is_none());
}

// Scenario 2: replaying the change against the open conflict skips and
// appends exactly one retried event.
#[tokio::test]
async fn replay_of_open_conflict_is_skipped_with_retried_event() {
    let db = Database::open_in_memory().await.unwrap();
    let change = missing_title_change();

    let conflict_id = conflict_id_of(&db, &change).await;
    let outcome = apply_incoming(&db, &change).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Skipped);

    let events = conflicts::list_events(db.pool(), &conflict_id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].event_type, ConflictEventType::Retried);
    assert!(events[1]
        .event_payload_json
        .as_deref()
        .unwrap()
        .contains("incoming_change_repeated"));
}

// Scenario 3: concurrent note edits at the same instant from different
// devices collide instead of merging.
#[tokio::test]
async fn simultaneous_note_edits_collide() {
    let db = Database::open_in_memory().await.unwrap();

    let seeded = IncomingChange {
        entity_type: EntityType::Task,
        entity_id: "t1".to_string(),
        operation: Operation::Upsert,
        updated_at: "2026-02-17T14:00:00Z".to_string(),
        updated_by_device: "device-a".to_string(),
        sync_version: 1,
        payload: json!({ "title": "Task", "notes": "Local notes body" }).to_string(),
        idempotency_key: entity_idempotency_key("device-a", EntityType::Task, "t1", 1),
    };
    assert_eq!(
        apply_incoming(&db, &seeded).await.unwrap(),
        ApplyOutcome::Applied
    );

    let incoming = IncomingChange {
        updated_by_device: "device-b".to_string(),
        payload: json!({ "title": "Task", "notes": "Remote notes body" }).to_string(),
        idempotency_key: entity_idempotency_key("device-b", EntityType::Task, "t1", 1),
        ..seeded
    };
    let conflict_id = conflict_id_of(&db, &incoming).await;

    let record = conflicts::get(db.pool(), &conflict_id).await.unwrap().unwrap();
    assert_eq!(record.conflict_type, ConflictType::NotesCollision);
    assert_eq!(record.reason_code, "TASK_NOTES_COLLISION");

    // Local notes survive until the user resolves
    let task = queries::get_task(db.pool(), "t1").await.unwrap().unwrap();
    assert_eq!(task.notes.as_deref(), Some("Local notes body"));
}

// Scenario 4: a conflict resolved keep_local absorbs replays of the
// original change.
#[tokio::test]
async fn resolved_conflict_absorbs_replay() {
    let db = Database::open_in_memory().await.unwrap();
    let change = missing_title_change();

    let conflict_id = conflict_id_of(&db, &change).await;
    resolve(&db, &conflict_id, ResolutionStrategy::KeepLocal, None, None)
        .await
        .unwrap();

    let outcome = apply_incoming(&db, &change).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Skipped);

    let events = conflicts::list_events(db.pool(), &conflict_id).await.unwrap();
    assert_eq!(events.last().unwrap().event_type, ConflictEventType::Retried);

    let record = conflicts::get(db.pool(), &conflict_id).await.unwrap().unwrap();
    assert_eq!(record.status, ConflictStatus::Resolved);
    assert_eq!(record.resolution_strategy, Some(ResolutionStrategy::KeepLocal));
}

// Retry closure: after resolve(retry), a corrected replay applies and the
// conflict credits the incoming device.
#[tokio::test]
async fn retry_resolution_lets_corrected_replay_close_the_conflict() {
    let db = Database::open_in_memory().await.unwrap();
    let change = missing_title_change();

    let conflict_id = conflict_id_of(&db, &change).await;
    resolve(&db, &conflict_id, ResolutionStrategy::Retry, None, None)
        .await
        .unwrap();

    let corrected = IncomingChange {
        payload: json!({ "title": "Now valid" }).to_string(),
        updated_by_device: "device-c".to_string(),
        ..change
    };
    assert_eq!(
        apply_incoming(&db, &corrected).await.unwrap(),
        ApplyOutcome::Applied
    );

    let record = conflicts::get(db.pool(), &conflict_id).await.unwrap().unwrap();
    assert_eq!(record.status, ConflictStatus::Resolved);
    assert_eq!(record.resolution_strategy, Some(ResolutionStrategy::Retry));
    assert_eq!(record.resolved_by_device.as_deref(), Some("device-c"));

    let task = queries::get_task(db.pool(), "t1").await.unwrap().unwrap();
    assert_eq!(task.title, "Now valid");
}

// Scenario 6: resolving 220 times with alternating strategies stays within
// the event retention cap and keeps the newest events.
#[tokio::test]
async fn repeated_resolution_respects_event_retention() {
    let db = Database::open_in_memory().await.unwrap();
    let change = missing_title_change();
    let conflict_id = conflict_id_of(&db, &change).await;

    for i in 0..220 {
        let strategy = if i % 2 == 0 {
            ResolutionStrategy::Retry
        } else {
            ResolutionStrategy::KeepLocal
        };
        resolve(&db, &conflict_id, strategy, None, None).await.unwrap();
    }

    let count = conflicts::count_events(db.pool(), &conflict_id).await.unwrap();
    assert!(count <= conflicts::MAX_EVENTS_PER_CONFLICT as i64);

    // The newest event is one of the alternating resolutions, not the
    // long-pruned detected event
    let events = conflicts::list_events(db.pool(), &conflict_id).await.unwrap();
    let newest = events.last().unwrap();
    assert!(matches!(
        newest.event_type,
        ConflictEventType::Resolved | ConflictEventType::Retried
    ));
    assert!(!events.iter().any(|e| e.event_type == ConflictEventType::Detected));

    // Only two deterministic resolution records ever queued
    let setting_records: Vec<_> = outbox::list(db.pool(), 500)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.entity_type == EntityType::Setting)
        .collect();
    assert_eq!(setting_records.len(), 2);
}

// Scenario 5: a transport that replays the same conflicting change across
// two cycles converges after a keep_local resolve, and the resolution
// record is pushed exactly once.
struct ReplayingTransport {
    pages: Mutex<VecDeque<PullResponse>>,
    pushed_keys: Mutex<Vec<String>>,
}

#[async_trait]
impl Transport for ReplayingTransport {
    fn name(&self) -> &str {
        "replaying"
    }

    async fn push(&self, request: PushRequest) -> crate::Result<PushResponse> {
        let mut pushed = self.pushed_keys.lock().unwrap();
        let accepted = request
            .changes
            .iter()
            .map(|c| c.idempotency_key.clone())
            .collect::<Vec<_>>();
        pushed.extend(accepted.iter().cloned());

        Ok(PushResponse {
            accepted,
            rejected: vec![],
            server_cursor: None,
            server_time: Some("2026-02-17T14:00:00.000Z".to_string()),
        })
    }

    async fn pull(&self, _request: PullRequest) -> crate::Result<PullResponse> {
        let page = self.pages.lock().unwrap().pop_front();
        Ok(page.unwrap_or(PullResponse {
            server_cursor: "cursor-final".to_string(),
            server_time: "2026-02-17T14:00:10.000Z".to_string(),
            has_more: false,
            changes: vec![],
        }))
    }
}

#[tokio::test]
async fn transport_replay_converges_after_keep_local_resolve() {
    let db = Arc::new(Database::open_in_memory().await.unwrap());
    let change = missing_title_change();

    let page = |cursor: &str| PullResponse {
        server_cursor: cursor.to_string(),
        server_time: "2026-02-17T14:00:00.000Z".to_string(),
        has_more: false,
        changes: vec![change.clone()],
    };
    let transport = Arc::new(ReplayingTransport {
        pages: Mutex::new(VecDeque::from(vec![page("cursor-1"), page("cursor-2")])),
        pushed_keys: Mutex::new(vec![]),
    });

    let runner = SyncRunner::new(db.clone(), transport.clone(), RuntimeProfile::default());

    // First cycle: the change conflicts
    let CycleOutcome::Completed(first) = runner.sync_now().await.unwrap() else {
        panic!("expected completed cycle");
    };
    assert_eq!(first.conflicts, 1);

    let open = conflicts::list(db.pool(), Some(ConflictStatus::Open))
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    let conflict_id = open[0].id.clone();

    resolve(&db, &conflict_id, ResolutionStrategy::KeepLocal, None, None)
        .await
        .unwrap();

    // Second cycle: the same change replays, the conflict absorbs it, and
    // the resolution record goes out
    let CycleOutcome::Completed(second) = runner.sync_now().await.unwrap() else {
        panic!("expected completed cycle");
    };
    assert_eq!(second.conflicts, 0);
    assert!(second.skipped >= 1);

    let resolution_entity = format!("local.sync.conflict_resolution.{}", conflict_id);
    let pushed = transport.pushed_keys.lock().unwrap().clone();
    let resolution_pushes = pushed
        .iter()
        .filter(|k| k.contains("conflict-resolution"))
        .count();
    assert_eq!(resolution_pushes, 1);

    // The record is gone from the outbox after acceptance
    assert!(outbox::list(db.pool(), 50)
        .await
        .unwrap()
        .iter()
        .all(|r| r.entity_id != resolution_entity));

    // A third cycle has nothing left to do
    let CycleOutcome::Completed(third) = runner.sync_now().await.unwrap() else {
        panic!("expected completed cycle");
    };
    assert_eq!(third.pushed, 0);
    assert_eq!(third.conflicts, 0);
}

// Manual merge end-to-end: collision, merge, and the merged body is
// recorded on the resolution record that ships to other devices.
#[tokio::test]
async fn notes_collision_manual_merge_ships_merged_text() {
    let db = Database::open_in_memory().await.unwrap();

    let seeded = IncomingChange {
        entity_type: EntityType::Task,
        entity_id: "t1".to_string(),
        operation: Operation::Upsert,
        updated_at: "2026-02-17T14:00:00Z".to_string(),
        updated_by_device: "device-a".to_string(),
        sync_version: 1,
        payload: json!({ "title": "Task", "notes": "Local notes body" }).to_string(),
        idempotency_key: entity_idempotency_key("device-a", EntityType::Task, "t1", 1),
    };
    apply_incoming(&db, &seeded).await.unwrap();

    let incoming = IncomingChange {
        updated_by_device: "device-b".to_string(),
        payload: json!({ "title": "Task", "notes": "Remote notes body" }).to_string(),
        idempotency_key: entity_idempotency_key("device-b", EntityType::Task, "t1", 1),
        ..seeded
    };
    let conflict_id = conflict_id_of(&db, &incoming).await;

    // The built-in default for a notes collision is manual merge
    assert_eq!(
        conflicts::default_strategy(db.pool(), ConflictType::NotesCollision)
            .await
            .unwrap(),
        ResolutionStrategy::ManualMerge
    );

    resolve(
        &db,
        &conflict_id,
        ResolutionStrategy::ManualMerge,
        Some(ResolutionPayload {
            merged_text: Some("Local notes body\n\nRemote notes body".to_string()),
            metadata: None,
        }),
        None,
    )
    .await
    .unwrap();

    let task = queries::get_task(db.pool(), "t1").await.unwrap().unwrap();
    assert_eq!(
        task.notes.as_deref(),
        Some("Local notes body\n\nRemote notes body")
    );
    assert_eq!(task.sync_version, 2);

    let records = outbox::list(db.pool(), 50).await.unwrap();
    let resolution = records
        .iter()
        .find(|r| r.entity_type == EntityType::Setting)
        .unwrap();
    assert!(resolution.payload.contains("Remote notes body"));

    // The merged content itself goes out as a task change, so devices that
    // never saw the collision still converge on the merged body
    let merged_row = records
        .iter()
        .find(|r| r.entity_type == EntityType::Task)
        .unwrap();
    assert_eq!(merged_row.entity_id, "t1");
    assert_eq!(merged_row.sync_version, 2);
    assert!(merged_row.payload.contains("Remote notes body"));
}

// A device holding its own conflict for the same change observes another
// device's decision record and closes its conflict with the observed
// strategy.
#[tokio::test]
async fn resolution_record_closes_conflict_on_observing_device() {
    let device_a = Database::open_in_memory().await.unwrap();
    let device_b = Database::open_in_memory().await.unwrap();

    let change = missing_title_change();
    let a_conflict = conflict_id_of(&device_a, &change).await;
    let b_conflict = conflict_id_of(&device_b, &change).await;
    assert_ne!(a_conflict, b_conflict);

    resolve(
        &device_a,
        &a_conflict,
        ResolutionStrategy::KeepLocal,
        None,
        None,
    )
    .await
    .unwrap();

    // The decision record drains from A's outbox and fans out to B
    let record = outbox::list(device_a.pool(), 10)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.entity_type == EntityType::Setting)
        .unwrap();
    let incoming = IncomingChange {
        entity_type: record.entity_type,
        entity_id: record.entity_id.clone(),
        operation: record.operation,
        updated_at: record.updated_at.clone(),
        updated_by_device: record.updated_by_device.clone(),
        sync_version: record.sync_version,
        payload: record.payload.clone(),
        idempotency_key: record.idempotency_key.clone(),
    };
    assert_eq!(
        apply_incoming(&device_b, &incoming).await.unwrap(),
        ApplyOutcome::Applied
    );

    let observed = conflicts::get(device_b.pool(), &b_conflict)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(observed.status, ConflictStatus::Resolved);
    assert_eq!(
        observed.resolution_strategy,
        Some(ResolutionStrategy::KeepLocal)
    );
    assert_eq!(
        observed.resolved_by_device.as_deref(),
        Some(device_a.device_id())
    );

    // Replaying the record on B is a no-op
    assert_eq!(
        apply_incoming(&device_b, &incoming).await.unwrap(),
        ApplyOutcome::Skipped
    );
}
