// sync/outbox.rs - Durable outbox queue for pending local changes
//
// Every local mutation appends one record here in the same transaction as
// the entity write; the sync runner drains it oldest-first. The outbox is
// the only channel through which local state propagates outward.

use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};

use crate::Result;

/// Entity type tag carried on outbox records and incoming changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum EntityType {
    Task,
    Project,
    Subtask,
    Template,
    Setting,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Task => "TASK",
            EntityType::Project => "PROJECT",
            EntityType::Subtask => "SUBTASK",
            EntityType::Template => "TEMPLATE",
            EntityType::Setting => "SETTING",
        }
    }
}

/// Change operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum Operation {
    Upsert,
    Delete,
}

/// A pending local change awaiting remote acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxRecord {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub updated_at: String,
    pub updated_by_device: String,
    pub sync_version: i64,
    pub payload: String,
    pub idempotency_key: String,
    pub attempt_count: i64,
    pub last_failure_reason: Option<String>,
}

/// A change about to be appended (the local id is assigned by the store)
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub updated_at: String,
    pub updated_by_device: String,
    pub sync_version: i64,
    pub payload: String,
    pub idempotency_key: String,
}

/// Deterministic idempotency key for an entity mutation
pub fn entity_idempotency_key(
    device_id: &str,
    entity_type: EntityType,
    entity_id: &str,
    sync_version: i64,
) -> String {
    format!(
        "{}:{}:{}:{}",
        device_id,
        entity_type.as_str(),
        entity_id,
        sync_version
    )
}

/// Deterministic idempotency key for a conflict resolution record
///
/// The key is algorithmic on purpose: duplicate resolve calls, duplicate
/// push attempts, and cross-device observation of the same decision all
/// collapse onto one remote change.
pub fn resolution_idempotency_key(device_id: &str, conflict_id: &str, strategy: &str) -> String {
    format!("{}:conflict-resolution:{}:{}", device_id, conflict_id, strategy)
}

/// Append a record inside the caller's transaction
pub async fn append(conn: &mut SqliteConnection, record: &NewOutboxRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_outbox
            (entity_type, entity_id, operation, updated_at, updated_by_device,
             sync_version, payload, idempotency_key)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.entity_type)
    .bind(&record.entity_id)
    .bind(record.operation)
    .bind(&record.updated_at)
    .bind(&record.updated_by_device)
    .bind(record.sync_version)
    .bind(&record.payload)
    .bind(&record.idempotency_key)
    .execute(&mut *conn)
    .await?;

    tracing::debug!(
        "Enqueued {:?} for {} {} (key {})",
        record.operation,
        record.entity_type.as_str(),
        record.entity_id,
        record.idempotency_key
    );

    Ok(())
}

/// Idempotent append: a record whose idempotency key is already queued is
/// left untouched. Used by the resolution engine, where a second resolve
/// with the same inputs must not enqueue a duplicate.
pub async fn append_if_absent(conn: &mut SqliteConnection, record: &NewOutboxRecord) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO sync_outbox
            (entity_type, entity_id, operation, updated_at, updated_by_device,
             sync_version, payload, idempotency_key)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(idempotency_key) DO NOTHING
        "#,
    )
    .bind(record.entity_type)
    .bind(&record.entity_id)
    .bind(record.operation)
    .bind(&record.updated_at)
    .bind(&record.updated_by_device)
    .bind(record.sync_version)
    .bind(&record.payload)
    .bind(&record.idempotency_key)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Up to `limit` oldest pending records, in insertion order
pub async fn list(pool: &SqlitePool, limit: i64) -> Result<Vec<OutboxRecord>> {
    let records = sqlx::query_as::<_, OutboxRecord>(
        r#"
        SELECT id, entity_type, entity_id, operation, updated_at, updated_by_device,
               sync_version, payload, idempotency_key, attempt_count, last_failure_reason
        FROM sync_outbox
        ORDER BY id ASC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Remove records whose idempotency keys were accepted by the remote
pub async fn remove(pool: &SqlitePool, accepted_keys: &[String]) -> Result<u64> {
    let mut removed = 0u64;
    for key in accepted_keys {
        let result = sqlx::query("DELETE FROM sync_outbox WHERE idempotency_key = ?")
            .bind(key)
            .execute(pool)
            .await?;
        removed += result.rows_affected();
    }

    if removed > 0 {
        tracing::debug!("Removed {} accepted outbox records", removed);
    }

    Ok(removed)
}

/// Mark a record as failed without removing it
pub async fn mark_failed(pool: &SqlitePool, id: i64, reason: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_outbox
        SET attempt_count = attempt_count + 1,
            last_failure_reason = ?
        WHERE id = ?
        "#,
    )
    .bind(reason)
    .bind(id)
    .execute(pool)
    .await?;

    tracing::debug!("Marked outbox record {} as failed: {}", id, reason);
    Ok(())
}

/// Number of records still waiting for remote acknowledgement
pub async fn pending_count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_outbox")
        .fetch_one(pool)
        .await?;

    Ok(count)
}

/// Outbox statistics for diagnostics surfaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending_count: i64,
    pub failed_count: i64,
    pub oldest_pending: Option<String>,
}

/// Get queue statistics
pub async fn stats(pool: &SqlitePool) -> Result<OutboxStats> {
    let pending_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_outbox")
        .fetch_one(pool)
        .await?;

    let failed_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sync_outbox WHERE attempt_count > 0")
            .fetch_one(pool)
            .await?;

    let oldest_pending: Option<String> =
        sqlx::query_scalar("SELECT updated_at FROM sync_outbox ORDER BY id ASC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(OutboxStats {
        pending_count,
        failed_count,
        oldest_pending,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn record(entity_id: &str, version: i64) -> NewOutboxRecord {
        NewOutboxRecord {
            entity_type: EntityType::Task,
            entity_id: entity_id.to_string(),
            operation: Operation::Upsert,
            updated_at: "2026-02-17T14:00:00.000Z".to_string(),
            updated_by_device: "device-a".to_string(),
            sync_version: version,
            payload: "{}".to_string(),
            idempotency_key: entity_idempotency_key("device-a", EntityType::Task, entity_id, version),
        }
    }

    #[test]
    fn test_idempotency_key_formats() {
        assert_eq!(
            entity_idempotency_key("dev1", EntityType::Task, "t1", 3),
            "dev1:TASK:t1:3"
        );
        assert_eq!(
            resolution_idempotency_key("dev1", "c9", "keep_local"),
            "dev1:conflict-resolution:c9:keep_local"
        );
    }

    #[tokio::test]
    async fn test_list_preserves_insertion_order() {
        let db = Database::open_in_memory().await.unwrap();
        let mut tx = db.pool().begin().await.unwrap();
        append(&mut tx, &record("t1", 1)).await.unwrap();
        append(&mut tx, &record("t2", 1)).await.unwrap();
        append(&mut tx, &record("t1", 2)).await.unwrap();
        tx.commit().await.unwrap();

        let records = list(db.pool(), 10).await.unwrap();
        let keys: Vec<&str> = records.iter().map(|r| r.idempotency_key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["device-a:TASK:t1:1", "device-a:TASK:t2:1", "device-a:TASK:t1:2"]
        );

        let limited = list(db.pool(), 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_key_is_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        let mut tx = db.pool().begin().await.unwrap();
        append(&mut tx, &record("t1", 1)).await.unwrap();
        assert!(append(&mut tx, &record("t1", 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_append_if_absent_is_idempotent() {
        let db = Database::open_in_memory().await.unwrap();

        let mut tx = db.pool().begin().await.unwrap();
        assert!(append_if_absent(&mut tx, &record("t1", 1)).await.unwrap());
        assert!(!append_if_absent(&mut tx, &record("t1", 1)).await.unwrap());
        tx.commit().await.unwrap();

        assert_eq!(pending_count(db.pool()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_mark_failed() {
        let db = Database::open_in_memory().await.unwrap();
        let mut tx = db.pool().begin().await.unwrap();
        append(&mut tx, &record("t1", 1)).await.unwrap();
        append(&mut tx, &record("t2", 1)).await.unwrap();
        tx.commit().await.unwrap();

        let removed = remove(db.pool(), &["device-a:TASK:t1:1".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let remaining = list(db.pool(), 10).await.unwrap();
        assert_eq!(remaining.len(), 1);

        mark_failed(db.pool(), remaining[0].id, "server said no")
            .await
            .unwrap();
        let after = list(db.pool(), 10).await.unwrap();
        assert_eq!(after[0].attempt_count, 1);
        assert_eq!(after[0].last_failure_reason.as_deref(), Some("server said no"));

        let s = stats(db.pool()).await.unwrap();
        assert_eq!(s.pending_count, 1);
        assert_eq!(s.failed_count, 1);
        assert!(s.oldest_pending.is_some());
    }
}
