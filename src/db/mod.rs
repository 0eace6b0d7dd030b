// db/mod.rs - Database module with SQLx integration

pub mod migrations;
pub mod models;
pub mod queries;

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Settings key holding the installation's device identity
pub const DEVICE_ID_KEY: &str = "device.id";

/// Database abstraction with connection pooling
///
/// The device id is generated on first open, persisted in settings, and
/// cached here; it never changes for the lifetime of the installation.
pub struct Database {
    pool: SqlitePool,
    device_id: String,
}

impl Database {
    /// Create new database connection with migrations
    ///
    /// Uses WAL mode for better concurrency and sets pragmas for performance.
    pub async fn new(db_path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}", db_path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            // Enable Write-Ahead Logging for better concurrency
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            // Enable foreign key constraints
            .foreign_keys(true);

        Self::connect(options).await
    }

    /// In-memory database for tests and ephemeral use
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            // A single connection keeps :memory: databases coherent and is
            // enough for the kernel's serialized transaction model.
            .max_connections(1)
            .connect_with(options)
            .await?;

        // Run migrations
        migrations::run(&pool).await?;

        // Device identity is initialized eagerly and is immutable afterwards
        let device_id = init_device_id(&pool).await?;

        Ok(Self { pool, device_id })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Execute health check query
    pub async fn health_check(&self) -> Result<bool> {
        let result: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;

        Ok(result.0 == 1)
    }
}

/// Load or generate the persistent device id
async fn init_device_id(pool: &SqlitePool) -> Result<String> {
    if let Some(existing) = queries::get_setting(pool, DEVICE_ID_KEY).await? {
        return Ok(existing);
    }

    let device_id = uuid::Uuid::new_v4().to_string();
    queries::set_setting(pool, DEVICE_ID_KEY, &device_id).await?;

    tracing::info!("Generated device id {}", device_id);
    Ok(device_id)
}

// Ensure pool is Send + Sync for cross-thread sharing
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn assert_all() {
        assert_send_sync::<Database>();
    }
};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_runs_migrations_and_health_check() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(db.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_device_id_is_stable_across_reads() {
        let db = Database::open_in_memory().await.unwrap();
        let id = db.device_id().to_string();
        assert!(!id.is_empty());

        let stored = queries::get_setting(db.pool(), DEVICE_ID_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, id);

        // A second init against the same store must not rotate the id
        let again = init_device_id(db.pool()).await.unwrap();
        assert_eq!(again, id);
    }
}
