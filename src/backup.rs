// backup.rs - Full-store export and guarded restore

use serde::{Deserialize, Serialize};

use crate::db::models::{now_rfc3339, Project, Subtask, Task, TaskTemplate};
use crate::db::{queries, Database, DEVICE_ID_KEY};
use crate::sync::conflicts::{self, ConflictEvent, ConflictRecord};
use crate::sync::outbox;
use crate::{Error, Result};

/// Settings keys that never leave the device in a backup
const PRIVATE_SETTING_KEYS: &[&str] = &[DEVICE_ID_KEY, "sync.provider_config"];

/// Exportable snapshot of the whole store
#[derive(Debug, Serialize, Deserialize)]
pub struct BackupDocument {
    pub version: String,
    pub exported_at: String,
    pub data: BackupData,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupData {
    pub tasks: Vec<Task>,
    pub projects: Vec<Project>,
    pub templates: Vec<TaskTemplate>,
    pub subtasks: Vec<Subtask>,
    /// Safe settings only; device identity and provider credentials stay out
    pub settings: Vec<(String, String)>,
    pub conflicts: Vec<ConflictRecord>,
    pub events: Vec<ConflictEvent>,
}

/// Preflight answer for a destructive restore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestorePreflight {
    pub latest_backup_exported_at: Option<String>,
    pub latest_backup_summary: Option<String>,
    pub pending_outbox_changes: i64,
    pub open_conflicts: i64,
    pub requires_force_restore: bool,
    pub has_latest_backup: bool,
}

/// File name for a backup written at `exported_at`
pub fn backup_file_name(exported_at: &str) -> String {
    format!("solostack-backup-{}.json", sanitize_timestamp(exported_at))
}

/// File name for a conflict report written at `exported_at`
pub fn conflict_report_file_name(exported_at: &str) -> String {
    format!("solostack-conflicts-{}.json", sanitize_timestamp(exported_at))
}

fn sanitize_timestamp(timestamp: &str) -> String {
    timestamp.replace([':', '.'], "-")
}

/// Export the full store as a single JSON document
pub async fn export_backup(db: &Database) -> Result<BackupDocument> {
    let pool = db.pool();

    let settings = queries::list_settings(pool)
        .await?
        .into_iter()
        .filter(|(key, _)| !PRIVATE_SETTING_KEYS.contains(&key.as_str()))
        .collect();

    let conflicts = conflicts::list(pool, None).await?;
    let mut events = Vec::new();
    for conflict in &conflicts {
        events.extend(conflicts::list_events(pool, &conflict.id).await?);
    }

    let document = BackupDocument {
        version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: now_rfc3339(),
        data: BackupData {
            tasks: queries::list_tasks(pool).await?,
            projects: queries::list_projects(pool, true).await?,
            templates: queries::list_templates(pool).await?,
            subtasks: queries::list_all_subtasks(pool).await?,
            settings,
            conflicts,
            events,
        },
    };

    tracing::info!(
        "Exported backup: {} tasks, {} projects, {} conflicts",
        document.data.tasks.len(),
        document.data.projects.len(),
        document.data.conflicts.len()
    );

    Ok(document)
}

/// What a restore would destroy, plus whatever is known about the most
/// recent backup the caller has on hand.
pub async fn restore_preflight(
    db: &Database,
    latest_backup: Option<&BackupDocument>,
) -> Result<RestorePreflight> {
    let pending_outbox_changes = outbox::pending_count(db.pool()).await?;
    let open_conflicts = conflicts::open_count(db.pool()).await?;

    Ok(RestorePreflight {
        latest_backup_exported_at: latest_backup.map(|b| b.exported_at.clone()),
        latest_backup_summary: latest_backup.map(|b| {
            format!(
                "{} tasks, {} projects, {} subtasks, {} templates",
                b.data.tasks.len(),
                b.data.projects.len(),
                b.data.subtasks.len(),
                b.data.templates.len()
            )
        }),
        pending_outbox_changes,
        open_conflicts,
        requires_force_restore: pending_outbox_changes > 0 || open_conflicts > 0,
        has_latest_backup: latest_backup.is_some(),
    })
}

/// Replace the live store with a backup document.
///
/// Without `force`, refuses while unsynced local changes or open conflicts
/// exist. Device identity always survives: a restore moves data, not the
/// installation's identity.
pub async fn restore_backup(db: &Database, document: &BackupDocument, force: bool) -> Result<()> {
    if !force {
        let preflight = restore_preflight(db, Some(document)).await?;
        if preflight.requires_force_restore {
            return Err(Error::Validation(format!(
                "Restore would discard {} pending outbox changes and {} open conflicts; pass force=true to proceed",
                preflight.pending_outbox_changes, preflight.open_conflicts
            )));
        }
    }

    let device_id = db.device_id().to_string();
    let mut tx = db.pool().begin().await?;

    for table in [
        "tasks",
        "projects",
        "subtasks",
        "task_templates",
        "settings",
        "sync_outbox",
        "sync_checkpoint",
        "sync_conflicts",
        "conflict_events",
    ] {
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *tx)
            .await?;
    }

    for task in &document.data.tasks {
        queries::save_task(&mut tx, task).await?;
    }
    for project in &document.data.projects {
        queries::save_project(&mut tx, project).await?;
    }
    for subtask in &document.data.subtasks {
        queries::save_subtask(&mut tx, subtask).await?;
    }
    for template in &document.data.templates {
        queries::save_template(&mut tx, template).await?;
    }
    for (key, value) in &document.data.settings {
        if PRIVATE_SETTING_KEYS.contains(&key.as_str()) {
            continue;
        }
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now_rfc3339())
        .execute(&mut *tx)
        .await?;
    }
    for conflict in &document.data.conflicts {
        sqlx::query(
            r#"
            INSERT INTO sync_conflicts
                (id, entity_type, entity_id, conflict_type, reason_code, message,
                 local_payload_json, remote_payload_json, remote_sync_version,
                 remote_updated_at, remote_updated_by_device, incoming_idempotency_key,
                 status, resolution_strategy, resolved_by_device, detected_at, resolved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conflict.id)
        .bind(conflict.entity_type)
        .bind(&conflict.entity_id)
        .bind(conflict.conflict_type)
        .bind(&conflict.reason_code)
        .bind(&conflict.message)
        .bind(&conflict.local_payload_json)
        .bind(&conflict.remote_payload_json)
        .bind(conflict.remote_sync_version)
        .bind(&conflict.remote_updated_at)
        .bind(&conflict.remote_updated_by_device)
        .bind(&conflict.incoming_idempotency_key)
        .bind(conflict.status)
        .bind(conflict.resolution_strategy)
        .bind(&conflict.resolved_by_device)
        .bind(&conflict.detected_at)
        .bind(&conflict.resolved_at)
        .execute(&mut *tx)
        .await?;
    }
    for event in &document.data.events {
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
        .execute(&mut *tx)
        .await?;
    }

    // Device identity survives every restore
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(DEVICE_ID_KEY)
    .bind(&device_id)
    .bind(now_rfc3339())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(
        "Restored backup from {} ({} tasks)",
        document.exported_at,
        document.data.tasks.len()
    );

    Ok(())
}
