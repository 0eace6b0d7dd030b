// sync/applier.rs - Incoming change classification and application
//
// One remote change at a time: the applier either mutates local state,
// skips a stale or replayed change, or persists a structured conflict.
// Classification is pure over the transaction snapshot; only the final
// apply step writes entity rows.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqliteConnection;

use crate::db::models::{now_rfc3339, parse_timestamp, Priority, Project, Recurrence, Subtask, Task, TaskStatus, TaskTemplate};
use crate::db::{queries, Database};
use crate::sync::conflicts::{self, ConflictEventType, ConflictRecord, ConflictStatus, ConflictType, NewConflict, ResolutionStrategy};
use crate::sync::outbox::{EntityType, Operation};
use crate::sync::resolution;
use crate::Result;

/// A change received from the remote peer.
///
/// Identical in shape to an outbox record minus the attempt counters; the
/// payload stays an opaque JSON string until the applier decodes it for the
/// matching entity variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingChange {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub updated_at: String,
    pub updated_by_device: String,
    pub sync_version: i64,
    pub payload: String,
    pub idempotency_key: String,
}

/// Outcome of applying one incoming change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ApplyOutcome {
    Applied,
    Skipped,
    Conflict { conflict_id: String },
}

/// Apply a single incoming change in its own transaction
pub async fn apply_incoming(db: &Database, change: &IncomingChange) -> Result<ApplyOutcome> {
    let mut tx = db.pool().begin().await?;
    let outcome = apply_incoming_tx(&mut tx, change).await?;
    tx.commit().await?;
    Ok(outcome)
}

/// Transaction-scoped applier; the sync runner batches several changes per
/// pull page through one connection.
pub async fn apply_incoming_tx(
    conn: &mut SqliteConnection,
    change: &IncomingChange,
) -> Result<ApplyOutcome> {
    // Replay guard: a previously-seen idempotency key never applies twice.
    if let Some(existing) = conflicts::find_by_incoming_key(conn, &change.idempotency_key).await? {
        return handle_replay(conn, existing, change).await;
    }

    // Another device's conflict decision arriving through the settings
    // channel closes the matching local conflict instead of landing in
    // the settings table.
    if change.entity_type == EntityType::Setting
        && change.operation == Operation::Upsert
        && change.entity_id.starts_with(conflicts::RESOLUTION_RECORD_PREFIX)
    {
        return apply_resolution_record(conn, change).await;
    }

    match classify(conn, change).await? {
        Classification::Skip => Ok(ApplyOutcome::Skipped),
        Classification::Apply => {
            write_change(conn, change).await?;
            Ok(ApplyOutcome::Applied)
        }
        Classification::Conflict(new_conflict) => {
            let record = conflicts::insert(conn, &new_conflict).await?;
            Ok(ApplyOutcome::Conflict {
                conflict_id: record.id,
            })
        }
    }
}

/// Second and later arrivals of an idempotency key the store already holds
/// a conflict for.
async fn handle_replay(
    conn: &mut SqliteConnection,
    existing: ConflictRecord,
    change: &IncomingChange,
) -> Result<ApplyOutcome> {
    if existing.status == ConflictStatus::Open {
        conflicts::append_event(
            conn,
            &existing.id,
            ConflictEventType::Retried,
            Some(json!({ "reason": "incoming_change_repeated" })),
        )
        .await?;
        return Ok(ApplyOutcome::Skipped);
    }

    // Resolved or ignored: if the local entity already reflects the
    // resolution, the replay is a no-op.
    if let Some(local) = LocalEntity::load(conn, change.entity_type, &change.entity_id).await? {
        if local.sync_version() >= change.sync_version {
            return Ok(ApplyOutcome::Skipped);
        }
    }

    match classify(conn, change).await? {
        Classification::Apply => {
            // The remote corrected the offending field; the conflict closes
            // as a retry credited to the incoming device.
            write_change(conn, change).await?;
            conflicts::update_resolution(
                conn,
                &existing.id,
                ConflictStatus::Resolved,
                Some(ResolutionStrategy::Retry),
                Some(&change.updated_by_device),
                &now_rfc3339(),
            )
            .await?;
            conflicts::append_event(
                conn,
                &existing.id,
                ConflictEventType::Retried,
                Some(json!({ "reason": "replay_applied_cleanly" })),
            )
            .await?;
            Ok(ApplyOutcome::Applied)
        }
        Classification::Conflict(new_conflict) if new_conflict.reason_code != existing.reason_code => {
            // Same key, different failure: history stays immutable and a
            // fresh row is opened.
            let record = conflicts::insert(conn, &new_conflict).await?;
            Ok(ApplyOutcome::Conflict {
                conflict_id: record.id,
            })
        }
        Classification::Conflict(_) | Classification::Skip => {
            conflicts::append_event(
                conn,
                &existing.id,
                ConflictEventType::Retried,
                Some(json!({ "reason": "incoming_change_repeated" })),
            )
            .await?;
            Ok(ApplyOutcome::Skipped)
        }
    }
}

/// Re-apply a decision another device made for a change this device may
/// also hold a conflict for.
///
/// The record's payload carries the original incoming idempotency key, so
/// the matching local conflict (if any) closes with the observed strategy.
/// keep_remote content comes from the conflict's own stored snapshot;
/// keep_local and manual_merge content travels through the entity channel.
async fn apply_resolution_record(
    conn: &mut SqliteConnection,
    change: &IncomingChange,
) -> Result<ApplyOutcome> {
    let payload: ResolutionRecordPayload = match serde_json::from_str(&change.payload) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Unreadable resolution record {}: {}", change.entity_id, e);
            return Ok(ApplyOutcome::Skipped);
        }
    };

    let Some(incoming_key) = payload.incoming_idempotency_key.as_deref() else {
        return Ok(ApplyOutcome::Skipped);
    };
    let Some(strategy) = payload.strategy.as_deref().and_then(ResolutionStrategy::parse) else {
        tracing::warn!(
            "Resolution record {} carries an unknown strategy",
            change.entity_id
        );
        return Ok(ApplyOutcome::Skipped);
    };

    let Some(conflict) = conflicts::find_by_incoming_key(conn, incoming_key).await? else {
        // This device applied or skipped the change on its own; there is
        // nothing to close.
        return Ok(ApplyOutcome::Skipped);
    };
    if conflict.status != ConflictStatus::Open {
        return Ok(ApplyOutcome::Skipped);
    }

    if strategy == ResolutionStrategy::KeepRemote {
        resolution::apply_remote_payload(conn, &conflict).await?;
    }

    let resolver = payload
        .resolved_by_device
        .unwrap_or_else(|| change.updated_by_device.clone());
    conflicts::update_resolution(
        conn,
        &conflict.id,
        ConflictStatus::Resolved,
        Some(strategy),
        Some(&resolver),
        &now_rfc3339(),
    )
    .await?;

    let event_type = if strategy == ResolutionStrategy::Retry {
        ConflictEventType::Retried
    } else {
        ConflictEventType::Resolved
    };
    conflicts::append_event(
        conn,
        &conflict.id,
        event_type,
        Some(json!({
            "strategy": strategy.as_str(),
            "reason": "remote_resolution_observed",
        })),
    )
    .await?;

    tracing::info!(
        "Observed remote resolution for conflict {} ({})",
        conflict.id,
        strategy.as_str()
    );

    Ok(ApplyOutcome::Applied)
}

// ============================================================================
// Classification
// ============================================================================

enum Classification {
    Skip,
    Apply,
    Conflict(NewConflict),
}

async fn classify(conn: &mut SqliteConnection, change: &IncomingChange) -> Result<Classification> {
    // Settings are unversioned key/value rows. Resolution records are
    // intercepted before classification; any other device-scoped key is
    // inert here.
    if change.entity_type == EntityType::Setting {
        if change.entity_id.starts_with("local.") {
            return Ok(Classification::Skip);
        }
        return Ok(Classification::Apply);
    }

    let local = LocalEntity::load(conn, change.entity_type, &change.entity_id).await?;

    // Version compare with the documented tie-break chain: sync_version,
    // then updated_at, then updated_by_device.
    if let Some(local) = &local {
        if local.sync_version() > change.sync_version {
            return Ok(Classification::Skip);
        }
        if local.sync_version() == change.sync_version {
            // Same version from the same device: the store already
            // reflects this change, so a replay is a no-op.
            if local.updated_by_device() == change.updated_by_device {
                return Ok(Classification::Skip);
            }
            match change.updated_at.as_str().cmp(local.updated_at()) {
                std::cmp::Ordering::Less => return Ok(Classification::Skip),
                std::cmp::Ordering::Greater => {}
                std::cmp::Ordering::Equal => {
                    if change.operation == Operation::Upsert {
                        if let Some(conflict) = notes_collision(local, change)? {
                            return Ok(Classification::Conflict(conflict));
                        }
                    }
                    if change.updated_by_device.as_str() <= local.updated_by_device() {
                        return Ok(Classification::Skip);
                    }
                }
            }
        }
    }

    if change.operation == Operation::Delete {
        return Ok(Classification::Apply);
    }

    validate_upsert(conn, change, local.as_ref()).await
}

/// Per-variant field validation for incoming UPSERTs
async fn validate_upsert(
    conn: &mut SqliteConnection,
    change: &IncomingChange,
    local: Option<&LocalEntity>,
) -> Result<Classification> {
    match change.entity_type {
        EntityType::Task => {
            let payload: TaskPayload = match serde_json::from_str(&change.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    return Ok(Classification::Conflict(conflict_for(
                        change,
                        local,
                        ConflictType::ValidationError,
                        "TASK_PAYLOAD_PARSE_ERROR",
                        format!("Task payload is not valid JSON: {}", e),
                    )));
                }
            };

            if payload.title.as_deref().map_or(true, |t| t.trim().is_empty()) {
                return Ok(Classification::Conflict(conflict_for(
                    change,
                    local,
                    ConflictType::FieldConflict,
                    "MISSING_TASK_TITLE",
                    "Incoming task has no title".to_string(),
                )));
            }

            if let Some(project_id) = &payload.project_id {
                if queries::get_project_tx(conn, project_id).await?.is_none() {
                    return Ok(Classification::Conflict(conflict_for(
                        change,
                        local,
                        ConflictType::DeleteVsUpdate,
                        "TASK_PROJECT_NOT_FOUND",
                        format!(
                            "Incoming task references project {} which does not exist locally",
                            project_id
                        ),
                    )));
                }
            }

            let recurrence = payload.recurrence.unwrap_or_default();
            if recurrence != Recurrence::None && payload.due_at.is_none() {
                return Ok(Classification::Conflict(conflict_for(
                    change,
                    local,
                    ConflictType::ValidationError,
                    "TASK_RECURRENCE_WITHOUT_DUE_DATE",
                    "Recurring task arrived without a due date".to_string(),
                )));
            }

            if let (Some(remind_at), Some(due_at)) = (&payload.remind_at, &payload.due_at) {
                let parsed = parse_timestamp(remind_at).and_then(|r| Ok((r, parse_timestamp(due_at)?)));
                match parsed {
                    Err(_) => {
                        return Ok(Classification::Conflict(conflict_for(
                            change,
                            local,
                            ConflictType::ValidationError,
                            "TASK_INVALID_TIMESTAMP",
                            "Task due/remind timestamps are not valid RFC-3339".to_string(),
                        )));
                    }
                    Ok((remind, due)) if remind > due => {
                        return Ok(Classification::Conflict(conflict_for(
                            change,
                            local,
                            ConflictType::ValidationError,
                            "TASK_REMIND_AFTER_DUE",
                            "Task reminder is after its due date".to_string(),
                        )));
                    }
                    Ok(_) => {}
                }
            }

            Ok(Classification::Apply)
        }
        EntityType::Project => {
            let payload: ProjectPayload = match serde_json::from_str(&change.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    return Ok(Classification::Conflict(conflict_for(
                        change,
                        local,
                        ConflictType::ValidationError,
                        "PROJECT_PAYLOAD_PARSE_ERROR",
                        format!("Project payload is not valid JSON: {}", e),
                    )));
                }
            };
            if payload.name.as_deref().map_or(true, |n| n.trim().is_empty()) {
                return Ok(Classification::Conflict(conflict_for(
                    change,
                    local,
                    ConflictType::FieldConflict,
                    "MISSING_PROJECT_NAME",
                    "Incoming project has no name".to_string(),
                )));
            }
            Ok(Classification::Apply)
        }
        EntityType::Subtask => {
            let payload: SubtaskPayload = match serde_json::from_str(&change.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    return Ok(Classification::Conflict(conflict_for(
                        change,
                        local,
                        ConflictType::ValidationError,
                        "SUBTASK_PAYLOAD_PARSE_ERROR",
                        format!("Subtask payload is not valid JSON: {}", e),
                    )));
                }
            };
            if payload.title.as_deref().map_or(true, |t| t.trim().is_empty()) {
                return Ok(Classification::Conflict(conflict_for(
                    change,
                    local,
                    ConflictType::FieldConflict,
                    "MISSING_SUBTASK_TITLE",
                    "Incoming subtask has no title".to_string(),
                )));
            }
            match &payload.task_id {
                Some(task_id) if queries::get_task_tx(conn, task_id).await?.is_some() => {
                    Ok(Classification::Apply)
                }
                Some(task_id) => Ok(Classification::Conflict(conflict_for(
                    change,
                    local,
                    ConflictType::DeleteVsUpdate,
                    "SUBTASK_TASK_NOT_FOUND",
                    format!(
                        "Incoming subtask references task {} which does not exist locally",
                        task_id
                    ),
                ))),
                None => Ok(Classification::Conflict(conflict_for(
                    change,
                    local,
                    ConflictType::FieldConflict,
                    "MISSING_SUBTASK_TASK_ID",
                    "Incoming subtask has no parent task id".to_string(),
                ))),
            }
        }
        EntityType::Template => {
            let payload: TemplatePayload = match serde_json::from_str(&change.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    return Ok(Classification::Conflict(conflict_for(
                        change,
                        local,
                        ConflictType::ValidationError,
                        "TEMPLATE_PAYLOAD_PARSE_ERROR",
                        format!("Template payload is not valid JSON: {}", e),
                    )));
                }
            };
            if payload.name.as_deref().map_or(true, |n| n.trim().is_empty()) {
                return Ok(Classification::Conflict(conflict_for(
                    change,
                    local,
                    ConflictType::FieldConflict,
                    "MISSING_TEMPLATE_NAME",
                    "Incoming template has no name".to_string(),
                )));
            }
            Ok(Classification::Apply)
        }
        EntityType::Setting => unreachable!("settings are classified before validation"),
    }
}

/// Detect concurrent note edits: both sides carry notes, stamped at the
/// same instant by different devices, with different bodies.
fn notes_collision(local: &LocalEntity, change: &IncomingChange) -> Result<Option<NewConflict>> {
    let LocalEntity::Task(local_task) = local else {
        return Ok(None);
    };
    let Some(local_notes) = &local_task.notes else {
        return Ok(None);
    };

    let payload: TaskPayload = match serde_json::from_str(&change.payload) {
        Ok(payload) => payload,
        Err(_) => return Ok(None),
    };
    let Some(incoming_notes) = &payload.notes else {
        return Ok(None);
    };

    if local_task.updated_at == change.updated_at
        && local_task.updated_by_device != change.updated_by_device
        && local_notes.as_bytes() != incoming_notes.as_bytes()
    {
        return Ok(Some(NewConflict {
            entity_type: change.entity_type,
            entity_id: change.entity_id.clone(),
            conflict_type: ConflictType::NotesCollision,
            reason_code: "TASK_NOTES_COLLISION".to_string(),
            message: "Task notes were edited on two devices at the same instant".to_string(),
            local_payload_json: Some(serde_json::to_string(local_task)?),
            remote_payload_json: change.payload.clone(),
            remote_sync_version: change.sync_version,
            remote_updated_at: change.updated_at.clone(),
            remote_updated_by_device: change.updated_by_device.clone(),
            incoming_idempotency_key: change.idempotency_key.clone(),
        }));
    }

    Ok(None)
}

fn conflict_for(
    change: &IncomingChange,
    local: Option<&LocalEntity>,
    conflict_type: ConflictType,
    reason_code: &str,
    message: String,
) -> NewConflict {
    NewConflict {
        entity_type: change.entity_type,
        entity_id: change.entity_id.clone(),
        conflict_type,
        reason_code: reason_code.to_string(),
        message,
        local_payload_json: local.and_then(|l| l.snapshot_json().ok()),
        remote_payload_json: change.payload.clone(),
        remote_sync_version: change.sync_version,
        remote_updated_at: change.updated_at.clone(),
        remote_updated_by_device: change.updated_by_device.clone(),
        incoming_idempotency_key: change.idempotency_key.clone(),
    }
}

// ============================================================================
// Entity polymorphism
// ============================================================================

/// Local entity snapshot, one variant per synced table.
pub(crate) enum LocalEntity {
    Task(Task),
    Project(Project),
    Subtask(Subtask),
    Template(TaskTemplate),
}

impl LocalEntity {
    pub(crate) async fn load(
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<LocalEntity>> {
        Ok(match entity_type {
            EntityType::Task => queries::get_task_tx(conn, entity_id)
                .await?
                .map(LocalEntity::Task),
            EntityType::Project => queries::get_project_tx(conn, entity_id)
                .await?
                .map(LocalEntity::Project),
            EntityType::Subtask => queries::get_subtask_tx(conn, entity_id)
                .await?
                .map(LocalEntity::Subtask),
            EntityType::Template => queries::get_template_tx(conn, entity_id)
                .await?
                .map(LocalEntity::Template),
            EntityType::Setting => None,
        })
    }

    pub(crate) fn sync_version(&self) -> i64 {
        match self {
            LocalEntity::Task(t) => t.sync_version,
            LocalEntity::Project(p) => p.sync_version,
            LocalEntity::Subtask(s) => s.sync_version,
            LocalEntity::Template(t) => t.sync_version,
        }
    }

    fn updated_at(&self) -> &str {
        match self {
            LocalEntity::Task(t) => &t.updated_at,
            LocalEntity::Project(p) => &p.updated_at,
            LocalEntity::Subtask(s) => &s.updated_at,
            LocalEntity::Template(t) => &t.updated_at,
        }
    }

    fn updated_by_device(&self) -> &str {
        match self {
            LocalEntity::Task(t) => &t.updated_by_device,
            LocalEntity::Project(p) => &p.updated_by_device,
            LocalEntity::Subtask(s) => &s.updated_by_device,
            LocalEntity::Template(t) => &t.updated_by_device,
        }
    }

    fn snapshot_json(&self) -> Result<String> {
        Ok(match self {
            LocalEntity::Task(t) => serde_json::to_string(t)?,
            LocalEntity::Project(p) => serde_json::to_string(p)?,
            LocalEntity::Subtask(s) => serde_json::to_string(s)?,
            LocalEntity::Template(t) => serde_json::to_string(t)?,
        })
    }
}

// Lenient payload mirrors: remote snapshots may predate schema additions,
// so every field decodes as optional and fills from defaults.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TaskPayload {
    title: Option<String>,
    description: Option<String>,
    notes: Option<String>,
    project_id: Option<String>,
    priority: Option<Priority>,
    is_important: Option<bool>,
    status: Option<TaskStatus>,
    due_at: Option<String>,
    remind_at: Option<String>,
    recurrence: Option<Recurrence>,
    created_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProjectPayload {
    name: Option<String>,
    archived: Option<bool>,
    created_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SubtaskPayload {
    task_id: Option<String>,
    title: Option<String>,
    is_done: Option<bool>,
    sort_order: Option<i64>,
    created_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TemplatePayload {
    name: Option<String>,
    task_title: Option<String>,
    task_notes: Option<String>,
    task_priority: Option<Priority>,
    created_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResolutionRecordPayload {
    strategy: Option<String>,
    resolved_by_device: Option<String>,
    incoming_idempotency_key: Option<String>,
}

// ============================================================================
// Apply
// ============================================================================

/// Write a validated change into the entity tables with the incoming
/// sync_version and device stamp.
pub(crate) async fn write_change(
    conn: &mut SqliteConnection,
    change: &IncomingChange,
) -> Result<()> {
    match (change.entity_type, change.operation) {
        (EntityType::Task, Operation::Upsert) => {
            let payload: TaskPayload = serde_json::from_str(&change.payload)?;
            let task = Task {
                id: change.entity_id.clone(),
                title: payload.title.unwrap_or_default(),
                description: payload.description,
                notes: payload.notes,
                project_id: payload.project_id,
                priority: payload.priority.unwrap_or_default(),
                is_important: payload.is_important.unwrap_or(false),
                status: payload.status.unwrap_or_default(),
                due_at: payload.due_at,
                remind_at: payload.remind_at,
                recurrence: payload.recurrence.unwrap_or_default(),
                created_at: payload.created_at.unwrap_or_else(|| change.updated_at.clone()),
                updated_at: change.updated_at.clone(),
                updated_by_device: change.updated_by_device.clone(),
                sync_version: change.sync_version,
            };
            queries::save_task(conn, &task).await?;
        }
        (EntityType::Task, Operation::Delete) => {
            sqlx::query("DELETE FROM tasks WHERE id = ?")
                .bind(&change.entity_id)
                .execute(&mut *conn)
                .await?;
            sqlx::query("DELETE FROM subtasks WHERE task_id = ?")
                .bind(&change.entity_id)
                .execute(&mut *conn)
                .await?;
        }
        (EntityType::Project, Operation::Upsert) => {
            let payload: ProjectPayload = serde_json::from_str(&change.payload)?;
            let project = Project {
                id: change.entity_id.clone(),
                name: payload.name.unwrap_or_default(),
                archived: payload.archived.unwrap_or(false),
                created_at: payload.created_at.unwrap_or_else(|| change.updated_at.clone()),
                updated_at: change.updated_at.clone(),
                updated_by_device: change.updated_by_device.clone(),
                sync_version: change.sync_version,
            };
            queries::save_project(conn, &project).await?;
        }
        (EntityType::Project, Operation::Delete) => {
            sqlx::query("DELETE FROM projects WHERE id = ?")
                .bind(&change.entity_id)
                .execute(&mut *conn)
                .await?;
        }
        (EntityType::Subtask, Operation::Upsert) => {
            let payload: SubtaskPayload = serde_json::from_str(&change.payload)?;
            let subtask = Subtask {
                id: change.entity_id.clone(),
                task_id: payload.task_id.unwrap_or_default(),
                title: payload.title.unwrap_or_default(),
                is_done: payload.is_done.unwrap_or(false),
                sort_order: payload.sort_order.unwrap_or(0),
                created_at: payload.created_at.unwrap_or_else(|| change.updated_at.clone()),
                updated_at: change.updated_at.clone(),
                updated_by_device: change.updated_by_device.clone(),
                sync_version: change.sync_version,
            };
            queries::save_subtask(conn, &subtask).await?;
        }
        (EntityType::Subtask, Operation::Delete) => {
            sqlx::query("DELETE FROM subtasks WHERE id = ?")
                .bind(&change.entity_id)
                .execute(&mut *conn)
                .await?;
        }
        (EntityType::Template, Operation::Upsert) => {
            let payload: TemplatePayload = serde_json::from_str(&change.payload)?;
            let template = TaskTemplate {
                id: change.entity_id.clone(),
                name: payload.name.unwrap_or_default(),
                task_title: payload.task_title.unwrap_or_default(),
                task_notes: payload.task_notes,
                task_priority: payload.task_priority.unwrap_or_default(),
                created_at: payload.created_at.unwrap_or_else(|| change.updated_at.clone()),
                updated_at: change.updated_at.clone(),
                updated_by_device: change.updated_by_device.clone(),
                sync_version: change.sync_version,
            };
            queries::save_template(conn, &template).await?;
        }
        (EntityType::Template, Operation::Delete) => {
            sqlx::query("DELETE FROM task_templates WHERE id = ?")
                .bind(&change.entity_id)
                .execute(&mut *conn)
                .await?;
        }
        (EntityType::Setting, Operation::Upsert) => {
            sqlx::query(
                r#"
                INSERT INTO settings (key, value, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&change.entity_id)
            .bind(&change.payload)
            .bind(&change.updated_at)
            .execute(&mut *conn)
            .await?;
        }
        (EntityType::Setting, Operation::Delete) => {
            sqlx::query("DELETE FROM settings WHERE key = ?")
                .bind(&change.entity_id)
                .execute(&mut *conn)
                .await?;
        }
    }

    tracing::debug!(
        "Applied incoming {:?} for {} {} (v{})",
        change.operation,
        change.entity_type.as_str(),
        change.entity_id,
        change.sync_version
    );

    Ok(())
}
