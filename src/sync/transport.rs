// sync/transport.rs - Transport contract and settings-driven selection
//
// The kernel is specified against this trait; the HTTP implementation in
// sync/http.rs is active when both custom endpoint URLs are configured.
// The server behind a transport is a dumb fan-out: it must treat
// idempotency keys as globally unique deduplication tokens.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::db::queries;
use crate::sync::applier::IncomingChange;
use crate::sync::http::HttpTransport;
use crate::sync::outbox::OutboxRecord;
use crate::Result;

pub const PROVIDER_KEY: &str = "sync.provider";
pub const PROVIDER_CONFIG_KEY: &str = "sync.provider_config";
pub const PUSH_URL_KEY: &str = "sync.push_url";
pub const PULL_URL_KEY: &str = "sync.pull_url";

/// Push request: the device's pending changes, oldest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub device_id: String,
    pub changes: Vec<OutboxRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedChange {
    pub idempotency_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushResponse {
    #[serde(default)]
    pub accepted: Vec<String>,
    #[serde(default)]
    pub rejected: Vec<RejectedChange>,
    pub server_cursor: Option<String>,
    pub server_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub device_id: String,
    pub cursor: Option<String>,
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub server_cursor: String,
    pub server_time: String,
    pub has_more: bool,
    #[serde(default)]
    pub changes: Vec<IncomingChange>,
}

/// Bi-directional sync transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs and diagnostics
    fn name(&self) -> &str;

    async fn push(&self, request: PushRequest) -> Result<PushResponse>;

    async fn pull(&self, request: PullRequest) -> Result<PullResponse>;
}

/// Provider tags recognized in settings.
///
/// Every provider currently requires custom push/pull URLs; the tag is
/// carried for diagnostics and forward compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncProvider {
    ProviderNeutral,
    GoogleAppdata,
    OnedriveApproot,
    IcloudCloudkit,
    SolostackCloudAws,
}

impl SyncProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncProvider::ProviderNeutral => "provider_neutral",
            SyncProvider::GoogleAppdata => "google_appdata",
            SyncProvider::OnedriveApproot => "onedrive_approot",
            SyncProvider::IcloudCloudkit => "icloud_cloudkit",
            SyncProvider::SolostackCloudAws => "solostack_cloud_aws",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "provider_neutral" => Some(SyncProvider::ProviderNeutral),
            "google_appdata" => Some(SyncProvider::GoogleAppdata),
            "onedrive_approot" => Some(SyncProvider::OnedriveApproot),
            "icloud_cloudkit" => Some(SyncProvider::IcloudCloudkit),
            "solostack_cloud_aws" => Some(SyncProvider::SolostackCloudAws),
            _ => None,
        }
    }
}

impl Default for SyncProvider {
    fn default() -> Self {
        SyncProvider::ProviderNeutral
    }
}

/// Outcome of transport selection from settings
pub struct TransportSelection {
    pub provider: SyncProvider,
    /// None means local-only: the store stays fully usable, sync cycles
    /// simply have nowhere to go.
    pub transport: Option<Arc<dyn Transport>>,
}

/// Resolve the active transport from settings.
///
/// Both URLs non-empty enable the custom HTTP transport; clearing either
/// reverts to local-only regardless of the provider tag.
pub async fn resolve_from_settings(
    pool: &SqlitePool,
    timeout: Duration,
) -> Result<TransportSelection> {
    let provider = queries::get_setting(pool, PROVIDER_KEY)
        .await?
        .as_deref()
        .and_then(SyncProvider::parse)
        .unwrap_or_default();

    let push_url = queries::get_setting(pool, PUSH_URL_KEY)
        .await?
        .filter(|u| !u.trim().is_empty());
    let pull_url = queries::get_setting(pool, PULL_URL_KEY)
        .await?
        .filter(|u| !u.trim().is_empty());

    let transport: Option<Arc<dyn Transport>> = match (push_url, pull_url) {
        (Some(push_url), Some(pull_url)) => {
            Some(Arc::new(HttpTransport::new(push_url, pull_url, timeout)?))
        }
        _ => {
            tracing::debug!(
                "No custom sync endpoints configured (provider {}), staying local-only",
                provider.as_str()
            );
            None
        }
    };

    Ok(TransportSelection {
        provider,
        transport,
    })
}
