// sync/resolution.rs - Conflict resolution engine
//
// Applies a user-selected strategy to a stored conflict, appends the audit
// event, and emits one deterministic SETTING outbox record per
// (resolver, conflict, strategy) triple. Duplicate clicks, duplicate push
// attempts, and transport replays all collapse onto that single record.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqliteConnection;

use crate::db::models::now_rfc3339;
use crate::db::{queries, Database};
use crate::sync::applier::{self, IncomingChange};
use crate::sync::conflicts::{self, ConflictEventType, ConflictRecord, ConflictStatus, ConflictType, ResolutionStrategy};
use crate::sync::outbox::{self, EntityType, NewOutboxRecord, Operation};
use crate::{Error, Result};

/// Caller-supplied data accompanying a resolution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionPayload {
    /// Replacement notes body for `manual_merge`
    pub merged_text: Option<String>,
    /// Free-form metadata recorded on the audit event
    pub metadata: Option<serde_json::Value>,
}

/// Resolve a conflict with the given strategy.
///
/// Idempotent per (conflict_id, strategy, resolver): repeating the same call
/// leaves the store untouched and enqueues nothing.
pub async fn resolve(
    db: &Database,
    conflict_id: &str,
    strategy: ResolutionStrategy,
    payload: Option<ResolutionPayload>,
    resolved_by_device: Option<&str>,
) -> Result<ConflictRecord> {
    let merged_text = match strategy {
        ResolutionStrategy::ManualMerge => {
            let text = payload
                .as_ref()
                .and_then(|p| p.merged_text.clone())
                .filter(|t| !t.trim().is_empty());
            match text {
                Some(text) => Some(text),
                // Reject before any state change
                None => {
                    return Err(Error::Validation(
                        "Manual merge requires non-empty merged_text".to_string(),
                    ))
                }
            }
        }
        _ => None,
    };

    let resolver = resolved_by_device.unwrap_or(db.device_id()).to_string();
    let mut tx = db.pool().begin().await?;

    let record = conflicts::get_tx(&mut tx, conflict_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Conflict not found: {}", conflict_id)))?;

    if record.status == ConflictStatus::Resolved
        && record.resolution_strategy == Some(strategy)
        && record.resolved_by_device.as_deref() == Some(resolver.as_str())
    {
        tracing::debug!(
            "Conflict {} already resolved as {} by {}",
            conflict_id,
            strategy.as_str(),
            resolver
        );
        return Ok(record);
    }

    match strategy {
        ResolutionStrategy::KeepLocal => {
            // The local row wins; nothing touches the entity tables.
        }
        ResolutionStrategy::KeepRemote => {
            apply_remote_payload(&mut tx, &record).await?;
        }
        ResolutionStrategy::ManualMerge => {
            merge_notes(&mut tx, &record, merged_text.as_deref().unwrap_or_default(), &resolver)
                .await?;
        }
        ResolutionStrategy::Retry => {
            // The entity stays as-is; marking the conflict resolved with
            // strategy=retry frees the next replay of the same idempotency
            // key to apply cleanly.
        }
    }

    let resolved_at = now_rfc3339();
    conflicts::update_resolution(
        &mut tx,
        conflict_id,
        ConflictStatus::Resolved,
        Some(strategy),
        Some(&resolver),
        &resolved_at,
    )
    .await?;

    let event_type = if strategy == ResolutionStrategy::Retry {
        ConflictEventType::Retried
    } else {
        ConflictEventType::Resolved
    };
    let mut event_payload = json!({ "strategy": strategy.as_str() });
    if let Some(text) = &merged_text {
        event_payload["merged_text"] = json!(text);
    }
    if let Some(meta) = payload.as_ref().and_then(|p| p.metadata.clone()) {
        event_payload["metadata"] = meta;
    }
    conflicts::append_event(&mut tx, conflict_id, event_type, Some(event_payload)).await?;

    emit_resolution_record(&mut tx, &record, strategy, &resolver, &resolved_at, merged_text.as_deref())
        .await?;

    tx.commit().await?;

    tracing::info!(
        "Conflict {} resolved with {} by {}",
        conflict_id,
        strategy.as_str(),
        resolver
    );

    conflicts::get(db.pool(), conflict_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Conflict not found: {}", conflict_id)))
}

/// Explicitly ignore a conflict.
///
/// Ignoring is a local preference: it appends an `ignored` event and closes
/// the record, but emits no cross-device resolution record.
pub async fn ignore(
    db: &Database,
    conflict_id: &str,
    ignored_by_device: Option<&str>,
) -> Result<ConflictRecord> {
    let resolver = ignored_by_device.unwrap_or(db.device_id()).to_string();
    let mut tx = db.pool().begin().await?;

    let record = conflicts::get_tx(&mut tx, conflict_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Conflict not found: {}", conflict_id)))?;

    if record.status == ConflictStatus::Ignored {
        return Ok(record);
    }

    conflicts::update_resolution(
        &mut tx,
        conflict_id,
        ConflictStatus::Ignored,
        None,
        Some(&resolver),
        &now_rfc3339(),
    )
    .await?;
    conflicts::append_event(&mut tx, conflict_id, ConflictEventType::Ignored, None).await?;

    tx.commit().await?;

    conflicts::get(db.pool(), conflict_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Conflict not found: {}", conflict_id)))
}

/// Apply the conflict's stored remote payload to the entity tables using
/// the remote sync_version and device stamp.
///
/// No outbox row is enqueued: the remote change already lives in the
/// server's log, so other devices receive it through their own pulls.
/// Also invoked by the applier when another device's keep_remote decision
/// arrives.
pub(crate) async fn apply_remote_payload(
    conn: &mut SqliteConnection,
    record: &ConflictRecord,
) -> Result<()> {
    let mut payload = record.remote_payload_json.clone();

    // A delete_vs_update keep_remote must not resurrect the missing
    // project; the task lands with its project reference cleared.
    if record.entity_type == EntityType::Task
        && record.conflict_type == ConflictType::DeleteVsUpdate
    {
        let mut value: serde_json::Value = serde_json::from_str(&payload)?;
        if let Some(project_id) = value.get("project_id").and_then(|v| v.as_str()) {
            if queries::get_project_tx(conn, project_id).await?.is_none() {
                value["project_id"] = serde_json::Value::Null;
                payload = value.to_string();
            }
        }
    }

    let change = IncomingChange {
        entity_type: record.entity_type,
        entity_id: record.entity_id.clone(),
        operation: Operation::Upsert,
        updated_at: record.remote_updated_at.clone(),
        updated_by_device: record.remote_updated_by_device.clone(),
        sync_version: record.remote_sync_version,
        payload,
        idempotency_key: record.incoming_idempotency_key.clone(),
    };

    applier::write_change(conn, &change).await
}

/// Replace the task's notes with the merged body; every other field
/// inherits from the local row.
///
/// The merged body is new state that exists on no other device and on no
/// server, so it leaves through the entity channel like any other
/// mutation.
async fn merge_notes(
    conn: &mut SqliteConnection,
    record: &ConflictRecord,
    merged_text: &str,
    resolver: &str,
) -> Result<()> {
    if record.entity_type != EntityType::Task {
        return Err(Error::Validation(format!(
            "Manual merge is only defined for tasks, not {}",
            record.entity_type.as_str()
        )));
    }

    let mut task = queries::get_task_tx(conn, &record.entity_id)
        .await?
        .ok_or_else(|| {
            Error::Validation(format!(
                "Manual merge requires a local task row for {}",
                record.entity_id
            ))
        })?;

    task.notes = Some(merged_text.to_string());
    task.sync_version = task.sync_version.max(record.remote_sync_version) + 1;
    task.updated_by_device = resolver.to_string();
    task.updated_at = now_rfc3339();

    queries::save_task(conn, &task).await?;

    outbox::append(
        conn,
        &NewOutboxRecord {
            entity_type: EntityType::Task,
            entity_id: task.id.clone(),
            operation: Operation::Upsert,
            updated_at: task.updated_at.clone(),
            updated_by_device: resolver.to_string(),
            sync_version: task.sync_version,
            payload: serde_json::to_string(&task)?,
            idempotency_key: outbox::entity_idempotency_key(
                resolver,
                EntityType::Task,
                &task.id,
                task.sync_version,
            ),
        },
    )
    .await
}

/// Enqueue the durable cross-device record of the decision. The
/// deterministic idempotency key makes re-resolution a no-op here.
async fn emit_resolution_record(
    conn: &mut SqliteConnection,
    record: &ConflictRecord,
    strategy: ResolutionStrategy,
    resolver: &str,
    resolved_at: &str,
    merged_text: Option<&str>,
) -> Result<()> {
    let mut payload = json!({
        "conflict_id": record.id,
        "entity_type": record.entity_type.as_str(),
        "entity_id": record.entity_id,
        "strategy": strategy.as_str(),
        "resolved_by_device": resolver,
        "resolved_at": resolved_at,
        // Lets observing devices find their own conflict row for the
        // same change
        "incoming_idempotency_key": record.incoming_idempotency_key,
    });
    if let Some(text) = merged_text {
        payload["merged_text"] = json!(text);
    }

    let enqueued = outbox::append_if_absent(
        conn,
        &NewOutboxRecord {
            entity_type: EntityType::Setting,
            entity_id: format!("{}{}", conflicts::RESOLUTION_RECORD_PREFIX, record.id),
            operation: Operation::Upsert,
            updated_at: resolved_at.to_string(),
            updated_by_device: resolver.to_string(),
            sync_version: 1,
            payload: payload.to_string(),
            idempotency_key: outbox::resolution_idempotency_key(
                resolver,
                &record.id,
                strategy.as_str(),
            ),
        },
    )
    .await?;

    if !enqueued {
        tracing::debug!(
            "Resolution record for conflict {} already queued",
            record.id
        );
    }

    Ok(())
}
