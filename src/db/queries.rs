// db/queries.rs - Transactional mutation API and settings store
//
// Every mutation validates its invariants, writes the entity row, bumps
// sync_version, stamps updated_by_device, and appends one outbox record,
// all inside a single transaction. Failure at any step rolls back both
// the entity and the outbox write.

use sqlx::{SqliteConnection, SqlitePool};

use crate::db::models::{now_rfc3339, Priority, Project, Recurrence, Subtask, Task, TaskStatus, TaskTemplate};
use crate::db::Database;
use crate::sync::outbox::{self, EntityType, NewOutboxRecord, Operation};
use crate::{Error, Result};

// ============================================================================
// Drafts
// ============================================================================

/// Caller-supplied fields for a task upsert
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct TaskDraft {
    pub id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub project_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub is_important: bool,
    #[serde(default)]
    pub status: TaskStatus,
    pub due_at: Option<String>,
    pub remind_at: Option<String>,
    #[serde(default)]
    pub recurrence: Recurrence,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ProjectDraft {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct SubtaskDraft {
    pub id: Option<String>,
    pub task_id: String,
    pub title: String,
    #[serde(default)]
    pub is_done: bool,
    #[serde(default)]
    pub sort_order: i64,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct TemplateDraft {
    pub id: Option<String>,
    pub name: String,
    pub task_title: String,
    pub task_notes: Option<String>,
    #[serde(default)]
    pub task_priority: Priority,
}

// ============================================================================
// Task mutations
// ============================================================================

/// Create or update a task and enqueue the change for sync
pub async fn upsert_task(db: &Database, draft: TaskDraft) -> Result<Task> {
    let id = draft.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut tx = db.pool().begin().await?;

    let existing = get_task_tx(&mut tx, &id).await?;

    if let Some(project_id) = &draft.project_id {
        if get_project_tx(&mut tx, project_id).await?.is_none() {
            return Err(Error::Validation(format!(
                "Project not found: {}",
                project_id
            )));
        }
    }

    let now = now_rfc3339();
    let task = Task {
        id: id.clone(),
        title: draft.title,
        description: draft.description,
        notes: draft.notes,
        project_id: draft.project_id,
        priority: draft.priority,
        is_important: draft.is_important,
        status: draft.status,
        due_at: draft.due_at,
        remind_at: draft.remind_at,
        recurrence: draft.recurrence,
        created_at: existing
            .as_ref()
            .map(|e| e.created_at.clone())
            .unwrap_or_else(|| now.clone()),
        updated_at: now,
        updated_by_device: db.device_id().to_string(),
        sync_version: existing.as_ref().map(|e| e.sync_version).unwrap_or(0) + 1,
    };
    task.validate()?;

    save_task(&mut tx, &task).await?;
    append_entity_outbox(
        &mut tx,
        EntityType::Task,
        &task.id,
        Operation::Upsert,
        &task.updated_at,
        db.device_id(),
        task.sync_version,
        serde_json::to_string(&task)?,
    )
    .await?;

    tx.commit().await?;
    tracing::debug!("Upserted task {} (v{})", task.id, task.sync_version);
    Ok(task)
}

/// Delete a task and enqueue the deletion for sync
pub async fn delete_task(db: &Database, id: &str) -> Result<()> {
    let mut tx = db.pool().begin().await?;

    let mut task = get_task_tx(&mut tx, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Task not found: {}", id)))?;

    task.sync_version += 1;
    task.updated_at = now_rfc3339();
    task.updated_by_device = db.device_id().to_string();

    sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM subtasks WHERE task_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    append_entity_outbox(
        &mut tx,
        EntityType::Task,
        id,
        Operation::Delete,
        &task.updated_at,
        db.device_id(),
        task.sync_version,
        serde_json::to_string(&task)?,
    )
    .await?;

    tx.commit().await?;
    tracing::debug!("Deleted task {} (v{})", id, task.sync_version);
    Ok(())
}

// ============================================================================
// Project mutations
// ============================================================================

pub async fn upsert_project(db: &Database, draft: ProjectDraft) -> Result<Project> {
    let id = draft.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut tx = db.pool().begin().await?;

    let existing = get_project_tx(&mut tx, &id).await?;

    let now = now_rfc3339();
    let project = Project {
        id: id.clone(),
        name: draft.name,
        archived: draft.archived,
        created_at: existing
            .as_ref()
            .map(|e| e.created_at.clone())
            .unwrap_or_else(|| now.clone()),
        updated_at: now,
        updated_by_device: db.device_id().to_string(),
        sync_version: existing.as_ref().map(|e| e.sync_version).unwrap_or(0) + 1,
    };
    project.validate()?;

    save_project(&mut tx, &project).await?;
    append_entity_outbox(
        &mut tx,
        EntityType::Project,
        &project.id,
        Operation::Upsert,
        &project.updated_at,
        db.device_id(),
        project.sync_version,
        serde_json::to_string(&project)?,
    )
    .await?;

    tx.commit().await?;
    tracing::debug!("Upserted project {} (v{})", project.id, project.sync_version);
    Ok(project)
}

/// Delete a project; tasks that referenced it keep a dangling project_id,
/// which the incoming applier surfaces as delete_vs_update when the remote
/// side still updates them.
pub async fn delete_project(db: &Database, id: &str) -> Result<()> {
    let mut tx = db.pool().begin().await?;

    let mut project = get_project_tx(&mut tx, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Project not found: {}", id)))?;

    project.sync_version += 1;
    project.updated_at = now_rfc3339();
    project.updated_by_device = db.device_id().to_string();

    sqlx::query("DELETE FROM projects WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    append_entity_outbox(
        &mut tx,
        EntityType::Project,
        id,
        Operation::Delete,
        &project.updated_at,
        db.device_id(),
        project.sync_version,
        serde_json::to_string(&project)?,
    )
    .await?;

    tx.commit().await?;
    Ok(())
}

// ============================================================================
// Subtask mutations
// ============================================================================

pub async fn upsert_subtask(db: &Database, draft: SubtaskDraft) -> Result<Subtask> {
    let id = draft.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut tx = db.pool().begin().await?;

    if get_task_tx(&mut tx, &draft.task_id).await?.is_none() {
        return Err(Error::Validation(format!(
            "Task not found: {}",
            draft.task_id
        )));
    }

    let existing = get_subtask_tx(&mut tx, &id).await?;

    let now = now_rfc3339();
    let subtask = Subtask {
        id: id.clone(),
        task_id: draft.task_id,
        title: draft.title,
        is_done: draft.is_done,
        sort_order: draft.sort_order,
        created_at: existing
            .as_ref()
            .map(|e| e.created_at.clone())
            .unwrap_or_else(|| now.clone()),
        updated_at: now,
        updated_by_device: db.device_id().to_string(),
        sync_version: existing.as_ref().map(|e| e.sync_version).unwrap_or(0) + 1,
    };
    subtask.validate()?;

    save_subtask(&mut tx, &subtask).await?;
    append_entity_outbox(
        &mut tx,
        EntityType::Subtask,
        &subtask.id,
        Operation::Upsert,
        &subtask.updated_at,
        db.device_id(),
        subtask.sync_version,
        serde_json::to_string(&subtask)?,
    )
    .await?;

    tx.commit().await?;
    Ok(subtask)
}

pub async fn delete_subtask(db: &Database, id: &str) -> Result<()> {
    let mut tx = db.pool().begin().await?;

    let mut subtask = get_subtask_tx(&mut tx, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Subtask not found: {}", id)))?;

    subtask.sync_version += 1;
    subtask.updated_at = now_rfc3339();
    subtask.updated_by_device = db.device_id().to_string();

    sqlx::query("DELETE FROM subtasks WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    append_entity_outbox(
        &mut tx,
        EntityType::Subtask,
        id,
        Operation::Delete,
        &subtask.updated_at,
        db.device_id(),
        subtask.sync_version,
        serde_json::to_string(&subtask)?,
    )
    .await?;

    tx.commit().await?;
    Ok(())
}

// ============================================================================
// Template mutations
// ============================================================================

pub async fn upsert_template(db: &Database, draft: TemplateDraft) -> Result<TaskTemplate> {
    let id = draft.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut tx = db.pool().begin().await?;

    let existing = get_template_tx(&mut tx, &id).await?;

    let now = now_rfc3339();
    let template = TaskTemplate {
        id: id.clone(),
        name: draft.name,
        task_title: draft.task_title,
        task_notes: draft.task_notes,
        task_priority: draft.task_priority,
        created_at: existing
            .as_ref()
            .map(|e| e.created_at.clone())
            .unwrap_or_else(|| now.clone()),
        updated_at: now,
        updated_by_device: db.device_id().to_string(),
        sync_version: existing.as_ref().map(|e| e.sync_version).unwrap_or(0) + 1,
    };
    template.validate()?;

    save_template(&mut tx, &template).await?;
    append_entity_outbox(
        &mut tx,
        EntityType::Template,
        &template.id,
        Operation::Upsert,
        &template.updated_at,
        db.device_id(),
        template.sync_version,
        serde_json::to_string(&template)?,
    )
    .await?;

    tx.commit().await?;
    Ok(template)
}

pub async fn delete_template(db: &Database, id: &str) -> Result<()> {
    let mut tx = db.pool().begin().await?;

    let mut template = get_template_tx(&mut tx, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Template not found: {}", id)))?;

    template.sync_version += 1;
    template.updated_at = now_rfc3339();
    template.updated_by_device = db.device_id().to_string();

    sqlx::query("DELETE FROM task_templates WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    append_entity_outbox(
        &mut tx,
        EntityType::Template,
        id,
        Operation::Delete,
        &template.updated_at,
        db.device_id(),
        template.sync_version,
        serde_json::to_string(&template)?,
    )
    .await?;

    tx.commit().await?;
    Ok(())
}

// ============================================================================
// Row-level helpers (shared with the incoming applier, which writes rows
// with the *incoming* sync_version instead of bumping the local one)
// ============================================================================

pub(crate) async fn save_task(conn: &mut SqliteConnection, task: &Task) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO tasks
            (id, title, description, notes, project_id, priority, is_important,
             status, due_at, remind_at, recurrence, created_at, updated_at,
             updated_by_device, sync_version)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&task.id)
    .bind(&task.title)
    .bind(&task.description)
    .bind(&task.notes)
    .bind(&task.project_id)
    .bind(task.priority)
    .bind(task.is_important)
    .bind(task.status)
    .bind(&task.due_at)
    .bind(&task.remind_at)
    .bind(task.recurrence)
    .bind(&task.created_at)
    .bind(&task.updated_at)
    .bind(&task.updated_by_device)
    .bind(task.sync_version)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn save_project(conn: &mut SqliteConnection, project: &Project) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO projects
            (id, name, archived, created_at, updated_at, updated_by_device, sync_version)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&project.id)
    .bind(&project.name)
    .bind(project.archived)
    .bind(&project.created_at)
    .bind(&project.updated_at)
    .bind(&project.updated_by_device)
    .bind(project.sync_version)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn save_subtask(conn: &mut SqliteConnection, subtask: &Subtask) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO subtasks
            (id, task_id, title, is_done, sort_order, created_at, updated_at,
             updated_by_device, sync_version)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&subtask.id)
    .bind(&subtask.task_id)
    .bind(&subtask.title)
    .bind(subtask.is_done)
    .bind(subtask.sort_order)
    .bind(&subtask.created_at)
    .bind(&subtask.updated_at)
    .bind(&subtask.updated_by_device)
    .bind(subtask.sync_version)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn save_template(conn: &mut SqliteConnection, template: &TaskTemplate) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO task_templates
            (id, name, task_title, task_notes, task_priority, created_at,
             updated_at, updated_by_device, sync_version)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&template.id)
    .bind(&template.name)
    .bind(&template.task_title)
    .bind(&template.task_notes)
    .bind(template.task_priority)
    .bind(&template.created_at)
    .bind(&template.updated_at)
    .bind(&template.updated_by_device)
    .bind(template.sync_version)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn get_task_tx(conn: &mut SqliteConnection, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(task)
}

pub(crate) async fn get_project_tx(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(project)
}

pub(crate) async fn get_subtask_tx(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<Subtask>> {
    let subtask = sqlx::query_as::<_, Subtask>("SELECT * FROM subtasks WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(subtask)
}

pub(crate) async fn get_template_tx(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<TaskTemplate>> {
    let template = sqlx::query_as::<_, TaskTemplate>("SELECT * FROM task_templates WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(template)
}

/// Append an entity-mutation outbox record inside the caller's transaction
#[allow(clippy::too_many_arguments)]
async fn append_entity_outbox(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: &str,
    operation: Operation,
    updated_at: &str,
    device_id: &str,
    sync_version: i64,
    payload: String,
) -> Result<()> {
    outbox::append(
        conn,
        &NewOutboxRecord {
            entity_type,
            entity_id: entity_id.to_string(),
            operation,
            updated_at: updated_at.to_string(),
            updated_by_device: device_id.to_string(),
            sync_version,
            payload,
            idempotency_key: outbox::entity_idempotency_key(
                device_id,
                entity_type,
                entity_id,
                sync_version,
            ),
        },
    )
    .await
}

// ============================================================================
// Readers
// ============================================================================

pub async fn get_task(pool: &SqlitePool, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(task)
}

pub async fn list_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at ASC, id ASC")
        .fetch_all(pool)
        .await?;
    Ok(tasks)
}

pub async fn list_tasks_by_status(pool: &SqlitePool, status: TaskStatus) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(status)
    .fetch_all(pool)
    .await?;
    Ok(tasks)
}

pub async fn list_tasks_in_project(pool: &SqlitePool, project_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE project_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(tasks)
}

pub async fn get_project(pool: &SqlitePool, id: &str) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(project)
}

pub async fn list_projects(pool: &SqlitePool, include_archived: bool) -> Result<Vec<Project>> {
    let sql = if include_archived {
        "SELECT * FROM projects ORDER BY created_at ASC, id ASC"
    } else {
        "SELECT * FROM projects WHERE archived = 0 ORDER BY created_at ASC, id ASC"
    };
    let projects = sqlx::query_as::<_, Project>(sql).fetch_all(pool).await?;
    Ok(projects)
}

pub async fn get_subtask(pool: &SqlitePool, id: &str) -> Result<Option<Subtask>> {
    let subtask = sqlx::query_as::<_, Subtask>("SELECT * FROM subtasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(subtask)
}

pub async fn list_subtasks(pool: &SqlitePool, task_id: &str) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks WHERE task_id = ? ORDER BY sort_order ASC, created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;
    Ok(subtasks)
}

pub async fn list_all_subtasks(pool: &SqlitePool) -> Result<Vec<Subtask>> {
    let subtasks =
        sqlx::query_as::<_, Subtask>("SELECT * FROM subtasks ORDER BY created_at ASC, id ASC")
            .fetch_all(pool)
            .await?;
    Ok(subtasks)
}

pub async fn get_template(pool: &SqlitePool, id: &str) -> Result<Option<TaskTemplate>> {
    let template = sqlx::query_as::<_, TaskTemplate>("SELECT * FROM task_templates WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(template)
}

pub async fn list_templates(pool: &SqlitePool) -> Result<Vec<TaskTemplate>> {
    let templates = sqlx::query_as::<_, TaskTemplate>(
        "SELECT * FROM task_templates ORDER BY created_at ASC, id ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(templates)
}

// ============================================================================
// Settings
// ============================================================================

pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
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
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_setting(pool: &SqlitePool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM settings WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_settings(pool: &SqlitePool) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM settings ORDER BY key ASC")
            .fetch_all(pool)
            .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn test_db() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn task_draft(title: &str) -> TaskDraft {
        TaskDraft {
            title: title.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_task_writes_entity_and_outbox_atomically() {
        let db = test_db().await;

        let task = upsert_task(&db, task_draft("Buy milk")).await.unwrap();
        assert_eq!(task.sync_version, 1);
        assert_eq!(task.updated_by_device, db.device_id());

        let records = outbox::list(db.pool(), 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity_id, task.id);
        assert_eq!(
            records[0].idempotency_key,
            format!("{}:TASK:{}:1", db.device_id(), task.id)
        );

        // The payload snapshot round-trips to the stored row
        let snapshot: Task = serde_json::from_str(&records[0].payload).unwrap();
        assert_eq!(snapshot.title, "Buy milk");
        assert_eq!(snapshot.sync_version, 1);
    }

    #[tokio::test]
    async fn test_upsert_bumps_sync_version() {
        let db = test_db().await;

        let task = upsert_task(&db, task_draft("v1")).await.unwrap();
        let updated = upsert_task(
            &db,
            TaskDraft {
                id: Some(task.id.clone()),
                title: "v2".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(updated.sync_version, 2);
        assert_eq!(updated.created_at, task.created_at);

        let records = outbox::list(db.pool(), 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].sync_version, 2);
    }

    #[tokio::test]
    async fn test_validation_failure_rolls_back_everything() {
        let db = test_db().await;

        let result = upsert_task(&db, task_draft("   ")).await;
        assert!(matches!(result, Err(Error::Validation(_))));

        assert!(list_tasks(db.pool()).await.unwrap().is_empty());
        assert_eq!(outbox::pending_count(db.pool()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_task_with_unknown_project_rejected() {
        let db = test_db().await;

        let result = upsert_task(
            &db,
            TaskDraft {
                title: "orphan".to_string(),
                project_id: Some("missing".to_string()),
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(result, Err(Error::Validation(_))));

        let project = upsert_project(
            &db,
            ProjectDraft {
                name: "Home".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let task = upsert_task(
            &db,
            TaskDraft {
                title: "attached".to_string(),
                project_id: Some(project.id.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(task.project_id.as_deref(), Some(project.id.as_str()));
    }

    #[tokio::test]
    async fn test_delete_task_enqueues_delete_and_drops_subtasks() {
        let db = test_db().await;

        let task = upsert_task(&db, task_draft("with subtask")).await.unwrap();
        upsert_subtask(
            &db,
            SubtaskDraft {
                task_id: task.id.clone(),
                title: "part one".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        delete_task(&db, &task.id).await.unwrap();

        assert!(get_task(db.pool(), &task.id).await.unwrap().is_none());
        assert!(list_subtasks(db.pool(), &task.id).await.unwrap().is_empty());

        let records = outbox::list(db.pool(), 10).await.unwrap();
        let last = records.last().unwrap();
        assert_eq!(last.operation, Operation::Delete);
        assert_eq!(last.sync_version, 2);
    }

    #[tokio::test]
    async fn test_delete_missing_task_is_not_found() {
        let db = test_db().await;
        assert!(matches!(
            delete_task(&db, "nope").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_settings_roundtrip() {
        let db = test_db().await;

        assert!(get_setting(db.pool(), "app.locale").await.unwrap().is_none());
        set_setting(db.pool(), "app.locale", "th").await.unwrap();
        assert_eq!(
            get_setting(db.pool(), "app.locale").await.unwrap().as_deref(),
            Some("th")
        );

        set_setting(db.pool(), "app.locale", "en").await.unwrap();
        assert_eq!(
            get_setting(db.pool(), "app.locale").await.unwrap().as_deref(),
            Some("en")
        );

        delete_setting(db.pool(), "app.locale").await.unwrap();
        assert!(get_setting(db.pool(), "app.locale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_template_and_project_listing() {
        let db = test_db().await;

        upsert_template(
            &db,
            TemplateDraft {
                name: "Weekly review".to_string(),
                task_title: "Review the week".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let archived = upsert_project(
            &db,
            ProjectDraft {
                name: "Old".to_string(),
                archived: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(list_templates(db.pool()).await.unwrap().len(), 1);
        assert_eq!(list_projects(db.pool(), false).await.unwrap().len(), 0);
        let all = list_projects(db.pool(), true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, archived.id);
    }
}
