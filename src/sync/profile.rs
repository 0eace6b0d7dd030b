// sync/profile.rs - Runtime profile governing sync cadence and batch sizes

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::time::Duration;

use crate::db::queries;
use crate::Result;

/// Settings key holding the serialized profile
pub const RUNTIME_PROFILE_KEY: &str = "sync.runtime_profile";

const AUTO_SYNC_BOUNDS: (u64, u64) = (30, 3_600);
const BACKGROUND_SYNC_BOUNDS: (u64, u64) = (60, 86_400);
const PUSH_LIMIT_BOUNDS: (i64, i64) = (1, 500);
const PULL_LIMIT_BOUNDS: (i64, i64) = (1, 500);
const MAX_PULL_PAGES_BOUNDS: (u32, u32) = (1, 50);

/// Immutable sync tuning record.
///
/// Values land here only through [`RuntimeProfile::normalize`], which clamps
/// every field into its bounds and reports what it had to clamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeProfile {
    pub auto_sync_interval_secs: u64,
    pub background_sync_interval_secs: u64,
    pub push_limit: i64,
    pub pull_limit: i64,
    pub max_pull_pages: u32,
}

impl Default for RuntimeProfile {
    fn default() -> Self {
        Self {
            auto_sync_interval_secs: 300,
            background_sync_interval_secs: 900,
            push_limit: 100,
            pull_limit: 200,
            max_pull_pages: 10,
        }
    }
}

impl RuntimeProfile {
    /// Clamp every field into its bounds.
    ///
    /// Returns the normalized profile together with the names of fields
    /// that required clamping; callers surface those as
    /// `validation_rejected` diagnostics events, never as errors.
    pub fn normalize(mut self) -> (Self, Vec<String>) {
        let mut clamped = Vec::new();

        if clamp_u64(&mut self.auto_sync_interval_secs, AUTO_SYNC_BOUNDS) {
            clamped.push("auto_sync_interval_secs".to_string());
        }
        if clamp_u64(&mut self.background_sync_interval_secs, BACKGROUND_SYNC_BOUNDS) {
            clamped.push("background_sync_interval_secs".to_string());
        }
        if clamp_i64(&mut self.push_limit, PUSH_LIMIT_BOUNDS) {
            clamped.push("push_limit".to_string());
        }
        if clamp_i64(&mut self.pull_limit, PULL_LIMIT_BOUNDS) {
            clamped.push("pull_limit".to_string());
        }
        if clamp_u32(&mut self.max_pull_pages, MAX_PULL_PAGES_BOUNDS) {
            clamped.push("max_pull_pages".to_string());
        }

        // Background work never runs hotter than the foreground cadence
        if self.background_sync_interval_secs < self.auto_sync_interval_secs {
            self.background_sync_interval_secs = self.auto_sync_interval_secs;
            clamped.push("background_sync_interval_secs".to_string());
        }

        (self, clamped)
    }

    pub fn auto_interval(&self) -> Duration {
        Duration::from_secs(self.auto_sync_interval_secs)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_secs(self.background_sync_interval_secs)
    }

    /// Per-call transport timeout derived from the sync cadence
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs((self.auto_sync_interval_secs / 2).clamp(10, 120))
    }
}

fn clamp_u64(value: &mut u64, (min, max): (u64, u64)) -> bool {
    let clamped = (*value).clamp(min, max);
    let changed = clamped != *value;
    *value = clamped;
    changed
}

fn clamp_i64(value: &mut i64, (min, max): (i64, i64)) -> bool {
    let clamped = (*value).clamp(min, max);
    let changed = clamped != *value;
    *value = clamped;
    changed
}

fn clamp_u32(value: &mut u32, (min, max): (u32, u32)) -> bool {
    let clamped = (*value).clamp(min, max);
    let changed = clamped != *value;
    *value = clamped;
    changed
}

/// Load the profile from settings, normalizing whatever is stored.
///
/// A missing or unreadable setting falls back to the defaults; garbage is
/// reported as a clamp on the synthetic field name `runtime_profile`.
pub async fn load(pool: &SqlitePool) -> Result<(RuntimeProfile, Vec<String>)> {
    match queries::get_setting(pool, RUNTIME_PROFILE_KEY).await? {
        None => Ok((RuntimeProfile::default(), Vec::new())),
        Some(raw) => match serde_json::from_str::<RuntimeProfile>(&raw) {
            Ok(profile) => Ok(profile.normalize()),
            Err(e) => {
                tracing::warn!("Stored runtime profile is invalid, using defaults: {}", e);
                Ok((
                    RuntimeProfile::default(),
                    vec!["runtime_profile".to_string()],
                ))
            }
        },
    }
}

/// Persist a normalized profile
pub async fn save(pool: &SqlitePool, profile: &RuntimeProfile) -> Result<()> {
    queries::set_setting(pool, RUNTIME_PROFILE_KEY, &serde_json::to_string(profile)?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_defaults_are_within_bounds() {
        let (profile, clamped) = RuntimeProfile::default().normalize();
        assert_eq!(profile, RuntimeProfile::default());
        assert!(clamped.is_empty());
    }

    #[test]
    fn test_out_of_range_fields_are_clamped_and_reported() {
        let raw = RuntimeProfile {
            auto_sync_interval_secs: 1,
            background_sync_interval_secs: 1_000_000,
            push_limit: 0,
            pull_limit: 9_999,
            max_pull_pages: 0,
        };
        let (profile, clamped) = raw.normalize();

        assert_eq!(profile.auto_sync_interval_secs, 30);
        assert_eq!(profile.background_sync_interval_secs, 86_400);
        assert_eq!(profile.push_limit, 1);
        assert_eq!(profile.pull_limit, 500);
        assert_eq!(profile.max_pull_pages, 1);
        assert_eq!(clamped.len(), 5);
    }

    #[test]
    fn test_background_interval_forced_to_foreground() {
        let raw = RuntimeProfile {
            auto_sync_interval_secs: 600,
            background_sync_interval_secs: 60,
            ..RuntimeProfile::default()
        };
        let (profile, clamped) = raw.normalize();
        assert_eq!(profile.background_sync_interval_secs, 600);
        assert_eq!(clamped, vec!["background_sync_interval_secs".to_string()]);
    }

    #[tokio::test]
    async fn test_load_defaults_and_roundtrip() {
        let db = Database::open_in_memory().await.unwrap();

        let (profile, clamped) = load(db.pool()).await.unwrap();
        assert_eq!(profile, RuntimeProfile::default());
        assert!(clamped.is_empty());

        let custom = RuntimeProfile {
            pull_limit: 50,
            ..RuntimeProfile::default()
        };
        save(db.pool(), &custom).await.unwrap();
        let (loaded, _) = load(db.pool()).await.unwrap();
        assert_eq!(loaded.pull_limit, 50);
    }

    #[tokio::test]
    async fn test_load_garbage_falls_back_to_defaults() {
        let db = Database::open_in_memory().await.unwrap();
        queries::set_setting(db.pool(), RUNTIME_PROFILE_KEY, "not json")
            .await
            .unwrap();

        let (profile, clamped) = load(db.pool()).await.unwrap();
        assert_eq!(profile, RuntimeProfile::default());
        assert_eq!(clamped, vec!["runtime_profile".to_string()]);
    }
}
