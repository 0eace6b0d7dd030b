// sync/conflicts.rs - Conflict records, event log, and observability
//
// Conflicts are persisted with opaque JSON snapshots of both sides so that
// later schema changes never invalidate historical records. Every state
// transition appends an event; the per-conflict event log is capped at 200
// entries, pruned oldest-first inside the appending transaction.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;

use crate::db::models::{now_rfc3339, parse_timestamp};
use crate::sync::outbox::EntityType;
use crate::{Error, Result};

/// Maximum events retained per conflict
pub const MAX_EVENTS_PER_CONFLICT: usize = 200;

/// Settings key for per-type default strategy overrides
pub const STRATEGY_DEFAULTS_KEY: &str = "sync.conflict_strategy_defaults";

/// Settings entity-id prefix under which resolution decisions travel
/// between devices
pub const RESOLUTION_RECORD_PREFIX: &str = "local.sync.conflict_resolution.";

/// Conflict taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ConflictType {
    FieldConflict,
    DeleteVsUpdate,
    NotesCollision,
    ValidationError,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::FieldConflict => "field_conflict",
            ConflictType::DeleteVsUpdate => "delete_vs_update",
            ConflictType::NotesCollision => "notes_collision",
            ConflictType::ValidationError => "validation_error",
        }
    }
}

/// Conflict lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ConflictStatus {
    Open,
    Resolved,
    Ignored,
}

/// User-selectable resolution strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    KeepLocal,
    KeepRemote,
    ManualMerge,
    Retry,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::KeepLocal => "keep_local",
            ResolutionStrategy::KeepRemote => "keep_remote",
            ResolutionStrategy::ManualMerge => "manual_merge",
            ResolutionStrategy::Retry => "retry",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "keep_local" => Some(ResolutionStrategy::KeepLocal),
            "keep_remote" => Some(ResolutionStrategy::KeepRemote),
            "manual_merge" => Some(ResolutionStrategy::ManualMerge),
            "retry" => Some(ResolutionStrategy::Retry),
            _ => None,
        }
    }
}

/// Event types on the per-conflict audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ConflictEventType {
    Detected,
    Resolved,
    Ignored,
    Retried,
    Exported,
}

/// A persisted conflict between local and incoming state
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConflictRecord {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub conflict_type: ConflictType,
    pub reason_code: String,
    pub message: String,
    pub local_payload_json: Option<String>,
    pub remote_payload_json: String,
    pub remote_sync_version: i64,
    pub remote_updated_at: String,
    pub remote_updated_by_device: String,
    pub incoming_idempotency_key: String,
    pub status: ConflictStatus,
    pub resolution_strategy: Option<ResolutionStrategy>,
    pub resolved_by_device: Option<String>,
    pub detected_at: String,
    pub resolved_at: Option<String>,
}

/// Fields for a conflict about to be persisted
#[derive(Debug, Clone)]
pub struct NewConflict {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub conflict_type: ConflictType,
    pub reason_code: String,
    pub message: String,
    pub local_payload_json: Option<String>,
    pub remote_payload_json: String,
    pub remote_sync_version: i64,
    pub remote_updated_at: String,
    pub remote_updated_by_device: String,
    pub incoming_idempotency_key: String,
}

/// One entry on a conflict's audit log
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConflictEvent {
    pub id: String,
    pub conflict_id: String,
    pub event_type: ConflictEventType,
    pub event_payload_json: Option<String>,
    pub created_at: String,
}

// ============================================================================
// Writes (transaction-scoped; the applier and resolution engine compose
// these with entity writes)
// ============================================================================

/// Persist a new conflict and its `detected` event
pub async fn insert(conn: &mut SqliteConnection, new: &NewConflict) -> Result<ConflictRecord> {
    let record = ConflictRecord {
        id: uuid::Uuid::new_v4().to_string(),
        entity_type: new.entity_type,
        entity_id: new.entity_id.clone(),
        conflict_type: new.conflict_type,
        reason_code: new.reason_code.clone(),
        message: new.message.clone(),
        local_payload_json: new.local_payload_json.clone(),
        remote_payload_json: new.remote_payload_json.clone(),
        remote_sync_version: new.remote_sync_version,
        remote_updated_at: new.remote_updated_at.clone(),
        remote_updated_by_device: new.remote_updated_by_device.clone(),
        incoming_idempotency_key: new.incoming_idempotency_key.clone(),
        status: ConflictStatus::Open,
        resolution_strategy: None,
        resolved_by_device: None,
        detected_at: now_rfc3339(),
        resolved_at: None,
    };

    sqlx::query(
        r#"
        INSERT INTO sync_conflicts
            (id, entity_type, entity_id, conflict_type, reason_code, message,
             local_payload_json, remote_payload_json, remote_sync_version,
             remote_updated_at, remote_updated_by_device, incoming_idempotency_key,
             status, detected_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(record.entity_type)
    .bind(&record.entity_id)
    .bind(record.conflict_type)
    .bind(&record.reason_code)
    .bind(&record.message)
    .bind(&record.local_payload_json)
    .bind(&record.remote_payload_json)
    .bind(record.remote_sync_version)
    .bind(&record.remote_updated_at)
    .bind(&record.remote_updated_by_device)
    .bind(&record.incoming_idempotency_key)
    .bind(record.status)
    .bind(&record.detected_at)
    .execute(&mut *conn)
    .await?;

    append_event(
        conn,
        &record.id,
        ConflictEventType::Detected,
        Some(json!({
            "conflict_type": record.conflict_type.as_str(),
            "reason_code": record.reason_code,
        })),
    )
    .await?;

    tracing::info!(
        "Conflict detected on {} {}: {} ({})",
        record.entity_type.as_str(),
        record.entity_id,
        record.reason_code,
        record.id
    );

    Ok(record)
}

/// Append an event and prune the log to the retention cap
pub async fn append_event(
    conn: &mut SqliteConnection,
    conflict_id: &str,
    event_type: ConflictEventType,
    payload: Option<serde_json::Value>,
) -> Result<ConflictEvent> {
    let event = ConflictEvent {
        id: uuid::Uuid::new_v4().to_string(),
        conflict_id: conflict_id.to_string(),
        event_type,
        event_payload_json: payload.map(|p| p.to_string()),
        created_at: now_rfc3339(),
    };

    sqlx::query(
        r#"
        INSERT INTO conflict_events (id, conflict_id, event_type, event_payload_json, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.id)
    .bind(&event.conflict_id)
    .bind(event.event_type)
    .bind(&event.event_payload_json)
    .bind(&event.created_at)
    .execute(&mut *conn)
    .await?;

    // Retention runs in the same transaction as the append, keeping the cap
    // tight without periodic sweeps. rowid order is insertion order, which
    // disambiguates events created within the same millisecond.
    sqlx::query(
        r#"
        DELETE FROM conflict_events
        WHERE conflict_id = ?
          AND rowid NOT IN (
              SELECT rowid FROM conflict_events
              WHERE conflict_id = ?
              ORDER BY rowid DESC
              LIMIT ?
          )
        "#,
    )
    .bind(conflict_id)
    .bind(conflict_id)
    .bind(MAX_EVENTS_PER_CONFLICT as i64)
    .execute(&mut *conn)
    .await?;

    Ok(event)
}

/// Update a conflict's resolution fields
pub async fn update_resolution(
    conn: &mut SqliteConnection,
    conflict_id: &str,
    status: ConflictStatus,
    strategy: Option<ResolutionStrategy>,
    resolved_by_device: Option<&str>,
    resolved_at: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_conflicts
        SET status = ?,
            resolution_strategy = ?,
            resolved_by_device = ?,
            resolved_at = ?
        WHERE id = ?
        "#,
    )
    .bind(status)
    .bind(strategy)
    .bind(resolved_by_device)
    .bind(resolved_at)
    .bind(conflict_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

// ============================================================================
// Reads
// ============================================================================

const SELECT_CONFLICT: &str = r#"
    SELECT id, entity_type, entity_id, conflict_type, reason_code, message,
           local_payload_json, remote_payload_json, remote_sync_version,
           remote_updated_at, remote_updated_by_device, incoming_idempotency_key,
           status, resolution_strategy, resolved_by_device, detected_at, resolved_at
    FROM sync_conflicts
"#;

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<ConflictRecord>> {
    let record = sqlx::query_as::<_, ConflictRecord>(&format!("{} WHERE id = ?", SELECT_CONFLICT))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

pub async fn get_tx(conn: &mut SqliteConnection, id: &str) -> Result<Option<ConflictRecord>> {
    let record = sqlx::query_as::<_, ConflictRecord>(&format!("{} WHERE id = ?", SELECT_CONFLICT))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(record)
}

/// All conflicts sharing an incoming idempotency key, newest first.
///
/// A retry resolution followed by a replay that fails differently opens a
/// fresh row for the same key, so the replay guard prefers an open row and
/// falls back to the most recent one.
pub async fn find_by_incoming_key(
    conn: &mut SqliteConnection,
    incoming_idempotency_key: &str,
) -> Result<Option<ConflictRecord>> {
    let records = sqlx::query_as::<_, ConflictRecord>(&format!(
        "{} WHERE incoming_idempotency_key = ? ORDER BY rowid DESC",
        SELECT_CONFLICT
    ))
    .bind(incoming_idempotency_key)
    .fetch_all(&mut *conn)
    .await?;

    let open = records
        .iter()
        .find(|r| r.status == ConflictStatus::Open)
        .cloned();
    Ok(open.or_else(|| records.into_iter().next()))
}

pub async fn list(pool: &SqlitePool, status: Option<ConflictStatus>) -> Result<Vec<ConflictRecord>> {
    let records = match status {
        Some(status) => {
            sqlx::query_as::<_, ConflictRecord>(&format!(
                "{} WHERE status = ? ORDER BY detected_at DESC",
                SELECT_CONFLICT
            ))
            .bind(status)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, ConflictRecord>(&format!(
                "{} ORDER BY detected_at DESC",
                SELECT_CONFLICT
            ))
            .fetch_all(pool)
            .await?
        }
    };
    Ok(records)
}

pub async fn open_count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sync_conflicts WHERE status = 'open'")
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Events for one conflict, oldest first
pub async fn list_events(pool: &SqlitePool, conflict_id: &str) -> Result<Vec<ConflictEvent>> {
    let events = sqlx::query_as::<_, ConflictEvent>(
        r#"
        SELECT id, conflict_id, event_type, event_payload_json, created_at
        FROM conflict_events
        WHERE conflict_id = ?
        ORDER BY rowid ASC
        "#,
    )
    .bind(conflict_id)
    .fetch_all(pool)
    .await?;
    Ok(events)
}

pub async fn count_events(pool: &SqlitePool, conflict_id: &str) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM conflict_events WHERE conflict_id = ?")
            .bind(conflict_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

// ============================================================================
// Default strategies
// ============================================================================

static BUILTIN_DEFAULTS: Lazy<HashMap<ConflictType, ResolutionStrategy>> = Lazy::new(|| {
    HashMap::from([
        (ConflictType::FieldConflict, ResolutionStrategy::KeepLocal),
        (ConflictType::DeleteVsUpdate, ResolutionStrategy::KeepLocal),
        (ConflictType::NotesCollision, ResolutionStrategy::ManualMerge),
        (ConflictType::ValidationError, ResolutionStrategy::KeepLocal),
    ])
});

/// Default strategy for a conflict type, honoring the
/// `sync.conflict_strategy_defaults` settings override when present
pub async fn default_strategy(
    pool: &SqlitePool,
    conflict_type: ConflictType,
) -> Result<ResolutionStrategy> {
    if let Some(raw) = crate::db::queries::get_setting(pool, STRATEGY_DEFAULTS_KEY).await? {
        let overrides: HashMap<ConflictType, ResolutionStrategy> = serde_json::from_str(&raw)
            .map_err(|e| {
                Error::Config(format!("Invalid {}: {}", STRATEGY_DEFAULTS_KEY, e))
            })?;
        if let Some(strategy) = overrides.get(&conflict_type) {
            return Ok(*strategy);
        }
    }

    Ok(BUILTIN_DEFAULTS[&conflict_type])
}

// ============================================================================
// Observability
// ============================================================================

/// Aggregate view over the conflict tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictStats {
    pub total: i64,
    pub open: i64,
    pub resolved: i64,
    pub ignored: i64,
    pub retried_events: i64,
    pub exported_events: i64,
    pub median_resolution_time_ms: Option<i64>,
    pub latest_detected_at: Option<String>,
    pub latest_resolved_at: Option<String>,
}

pub async fn stats(pool: &SqlitePool) -> Result<ConflictStats> {
    let (total, open, resolved, ignored): (i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               COALESCE(SUM(status = 'open'), 0),
               COALESCE(SUM(status = 'resolved'), 0),
               COALESCE(SUM(status = 'ignored'), 0)
        FROM sync_conflicts
        "#,
    )
    .fetch_one(pool)
    .await?;

    let retried_events: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM conflict_events WHERE event_type = 'retried'")
            .fetch_one(pool)
            .await?;
    let exported_events: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM conflict_events WHERE event_type = 'exported'")
            .fetch_one(pool)
            .await?;

    let latest_detected_at: Option<String> =
        sqlx::query_scalar("SELECT MAX(detected_at) FROM sync_conflicts")
            .fetch_one(pool)
            .await?;
    let latest_resolved_at: Option<String> =
        sqlx::query_scalar("SELECT MAX(resolved_at) FROM sync_conflicts")
            .fetch_one(pool)
            .await?;

    let spans: Vec<(String, String)> = sqlx::query_as(
        "SELECT detected_at, resolved_at FROM sync_conflicts WHERE resolved_at IS NOT NULL",
    )
    .fetch_all(pool)
    .await?;

    let mut durations: Vec<i64> = Vec::with_capacity(spans.len());
    for (detected, resolved) in spans {
        let detected = parse_timestamp(&detected)?;
        let resolved = parse_timestamp(&resolved)?;
        durations.push((resolved - detected).num_milliseconds().max(0));
    }
    durations.sort_unstable();

    let median_resolution_time_ms = match durations.len() {
        0 => None,
        n if n % 2 == 1 => Some(durations[n / 2]),
        n => Some((durations[n / 2 - 1] + durations[n / 2]) / 2),
    };

    Ok(ConflictStats {
        total,
        open,
        resolved,
        ignored,
        retried_events,
        exported_events,
        median_resolution_time_ms,
        latest_detected_at,
        latest_resolved_at,
    })
}

// ============================================================================
// Report export
// ============================================================================

/// Exportable conflict report document
#[derive(Debug, Serialize, Deserialize)]
pub struct ConflictReport {
    pub version: String,
    pub exported_at: String,
    pub stats: ConflictStats,
    pub conflicts: Vec<ConflictRecord>,
    pub events: Vec<ConflictEvent>,
}

/// Build the report and stamp an `exported` event on every included conflict
pub async fn export_report(pool: &SqlitePool) -> Result<ConflictReport> {
    let stats = stats(pool).await?;
    let conflicts = list(pool, None).await?;

    let mut tx = pool.begin().await?;
    for conflict in &conflicts {
        append_event(&mut tx, &conflict.id, ConflictEventType::Exported, None).await?;
    }
    tx.commit().await?;

    let mut events = Vec::new();
    for conflict in &conflicts {
        events.extend(list_events(pool, &conflict.id).await?);
    }

    Ok(ConflictReport {
        version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: now_rfc3339(),
        stats,
        conflicts,
        events,
    })
}
