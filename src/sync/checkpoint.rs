// sync/checkpoint.rs - Per-device pull cursor and last-synced timestamp

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::Result;

/// The single checkpoint row for this device
///
/// The server cursor is opaque: it is stored and echoed back on pull, and
/// only ever compared for equality (stall detection). Ordering lives on the
/// server side.
#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct Checkpoint {
    pub device_id: String,
    pub server_cursor: Option<String>,
    pub last_synced_at: Option<String>,
}

/// Load the checkpoint, defaulting to an empty one on first sync
pub async fn get(pool: &SqlitePool, device_id: &str) -> Result<Checkpoint> {
    let row = sqlx::query_as::<_, Checkpoint>(
        "SELECT device_id, server_cursor, last_synced_at FROM sync_checkpoint WHERE device_id = ?",
    )
    .bind(device_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.unwrap_or_else(|| Checkpoint {
        device_id: device_id.to_string(),
        server_cursor: None,
        last_synced_at: None,
    }))
}

/// Persist the checkpoint after a successful cycle step
pub async fn save(
    pool: &SqlitePool,
    device_id: &str,
    server_cursor: Option<&str>,
    last_synced_at: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_checkpoint (device_id, server_cursor, last_synced_at)
        VALUES (?, ?, ?)
        ON CONFLICT(device_id) DO UPDATE SET
            server_cursor = excluded.server_cursor,
            last_synced_at = excluded.last_synced_at
        "#,
    )
    .bind(device_id)
    .bind(server_cursor)
    .bind(last_synced_at)
    .execute(pool)
    .await?;

    tracing::debug!(
        "Checkpoint saved for {}: cursor={:?}",
        device_id,
        server_cursor
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_defaults_to_empty_checkpoint() {
        let db = Database::open_in_memory().await.unwrap();
        let cp = get(db.pool(), db.device_id()).await.unwrap();
        assert!(cp.server_cursor.is_none());
        assert!(cp.last_synced_at.is_none());
    }

    #[tokio::test]
    async fn test_save_then_get_roundtrip() {
        let db = Database::open_in_memory().await.unwrap();
        save(
            db.pool(),
            db.device_id(),
            Some("cursor-42"),
            Some("2026-02-17T14:00:00.000Z"),
        )
        .await
        .unwrap();

        let cp = get(db.pool(), db.device_id()).await.unwrap();
        assert_eq!(cp.server_cursor.as_deref(), Some("cursor-42"));
        assert_eq!(cp.last_synced_at.as_deref(), Some("2026-02-17T14:00:00.000Z"));

        // Overwrite advances the stored cursor
        save(db.pool(), db.device_id(), Some("cursor-43"), None)
            .await
            .unwrap();
        let cp = get(db.pool(), db.device_id()).await.unwrap();
        assert_eq!(cp.server_cursor.as_deref(), Some("cursor-43"));
    }
}
