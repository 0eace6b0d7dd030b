// db/migrations.rs - Database schema migrations

use crate::Result;
use sqlx::SqlitePool;

/// Run all database migrations
///
/// Migrations are idempotent and safe to run multiple times.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    // Create migrations table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Run migrations in order
    run_if_needed(pool, 1, "create_projects_table").await?;
    run_if_needed(pool, 2, "create_tasks_table").await?;
    run_if_needed(pool, 3, "create_subtasks_table").await?;
    run_if_needed(pool, 4, "create_task_templates_table").await?;
    run_if_needed(pool, 5, "create_settings_table").await?;
    run_if_needed(pool, 6, "create_sync_outbox_table").await?;
    run_if_needed(pool, 7, "create_sync_checkpoint_table").await?;
    run_if_needed(pool, 8, "create_sync_conflicts_table").await?;
    run_if_needed(pool, 9, "create_conflict_events_table").await?;
    run_if_needed(pool, 10, "create_indices").await?;

    Ok(())
}

/// Check if migration is needed and run the appropriate SQL
async fn run_if_needed(pool: &SqlitePool, id: i32, name: &str) -> Result<()> {
    let exists: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;

    if exists.0 == 0 {
        tracing::info!("Running migration {}: {}", id, name);

        match id {
            1 => create_projects_table(pool).await?,
            2 => create_tasks_table(pool).await?,
            3 => create_subtasks_table(pool).await?,
            4 => create_task_templates_table(pool).await?,
            5 => create_settings_table(pool).await?,
            6 => create_sync_outbox_table(pool).await?,
            7 => create_sync_checkpoint_table(pool).await?,
            8 => create_sync_conflicts_table(pool).await?,
            9 => create_conflict_events_table(pool).await?,
            10 => create_indices(pool).await?,
            _ => return Err(crate::Error::Config(format!("Unknown migration id: {}", id))),
        }

        sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(pool)
            .await?;

        tracing::info!("Migration {} completed", id);
    }

    Ok(())
}

/// Migration 1: Create projects table
async fn create_projects_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            archived BOOLEAN NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            updated_by_device TEXT NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 2: Create tasks table
///
/// project_id is intentionally not a foreign key: a remote change may
/// reference a project the local side has deleted, and the applier turns
/// that into a structured conflict rather than a constraint failure.
async fn create_tasks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE tasks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            notes TEXT,
            project_id TEXT,
            priority TEXT NOT NULL DEFAULT 'NORMAL' CHECK(priority IN ('URGENT', 'NORMAL', 'LOW')),
            is_important BOOLEAN NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'TODO' CHECK(status IN ('TODO', 'DOING', 'DONE', 'ARCHIVED')),
            due_at TEXT,
            remind_at TEXT,
            recurrence TEXT NOT NULL DEFAULT 'NONE' CHECK(recurrence IN ('NONE', 'DAILY', 'WEEKLY', 'MONTHLY')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            updated_by_device TEXT NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 3: Create subtasks table
async fn create_subtasks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE subtasks (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            title TEXT NOT NULL,
            is_done BOOLEAN NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            updated_by_device TEXT NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 4: Create task templates table
async fn create_task_templates_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE task_templates (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            task_title TEXT NOT NULL,
            task_notes TEXT,
            task_priority TEXT NOT NULL DEFAULT 'NORMAL' CHECK(task_priority IN ('URGENT', 'NORMAL', 'LOW')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            updated_by_device TEXT NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 5: Create settings table
async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 6: Create sync outbox table
async fn create_sync_outbox_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE sync_outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL CHECK(operation IN ('UPSERT', 'DELETE')),
            updated_at TEXT NOT NULL,
            updated_by_device TEXT NOT NULL,
            sync_version INTEGER NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT NOT NULL UNIQUE,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_failure_reason TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 7: Create sync checkpoint table (one row per device)
async fn create_sync_checkpoint_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE sync_checkpoint (
            device_id TEXT PRIMARY KEY,
            server_cursor TEXT,
            last_synced_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 8: Create sync conflicts table
async fn create_sync_conflicts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE sync_conflicts (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            conflict_type TEXT NOT NULL CHECK(conflict_type IN ('field_conflict', 'delete_vs_update', 'notes_collision', 'validation_error')),
            reason_code TEXT NOT NULL,
            message TEXT NOT NULL,
            local_payload_json TEXT,
            remote_payload_json TEXT NOT NULL,
            remote_sync_version INTEGER NOT NULL,
            remote_updated_at TEXT NOT NULL,
            remote_updated_by_device TEXT NOT NULL,
            incoming_idempotency_key TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open' CHECK(status IN ('open', 'resolved', 'ignored')),
            resolution_strategy TEXT CHECK(resolution_strategy IN ('keep_local', 'keep_remote', 'manual_merge', 'retry')),
            resolved_by_device TEXT,
            detected_at TEXT NOT NULL,
            resolved_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 9: Create conflict events table
async fn create_conflict_events_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE conflict_events (
            id TEXT PRIMARY KEY,
            conflict_id TEXT NOT NULL,
            event_type TEXT NOT NULL CHECK(event_type IN ('detected', 'resolved', 'ignored', 'retried', 'exported')),
            event_payload_json TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 10: Create indices for sync-critical lookups
async fn create_indices(pool: &SqlitePool) -> Result<()> {
    let indices = [
        "CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id)",
        "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
        "CREATE INDEX IF NOT EXISTS idx_subtasks_task ON subtasks(task_id)",
        "CREATE INDEX IF NOT EXISTS idx_outbox_entity ON sync_outbox(entity_type, entity_id)",
        "CREATE INDEX IF NOT EXISTS idx_conflicts_status ON sync_conflicts(status)",
        "CREATE INDEX IF NOT EXISTS idx_conflicts_incoming_key ON sync_conflicts(incoming_idempotency_key)",
        "CREATE INDEX IF NOT EXISTS idx_conflict_events_conflict ON conflict_events(conflict_id, created_at)",
    ];

    for sql in indices {
        sqlx::query(sql).execute(pool).await?;
    }

    Ok(())
}
