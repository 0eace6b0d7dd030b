// sync/runner.rs - Full sync cycle orchestration
//
// drain outbox -> push -> pull pages -> apply incoming -> checkpoint.
// The runner is single-flight: overlapping triggers coalesce onto the
// in-flight cycle, and consecutive failures gate scheduled syncs behind
// an exponential backoff that manual "sync now" bypasses.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::db::models::now_rfc3339;
use crate::db::Database;
use crate::sync::applier::{self, ApplyOutcome};
use crate::sync::checkpoint;
use crate::sync::diagnostics::SyncDiagnostics;
use crate::sync::outbox;
use crate::sync::profile::RuntimeProfile;
use crate::sync::transport::{PullRequest, PushRequest, SyncProvider, Transport};
use crate::{Error, Result};

const MAX_BACKOFF: Duration = Duration::from_secs(300);
const BASE_BACKOFF: Duration = Duration::from_secs(5);

/// Externally-observable sync state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Synced,
    Offline,
    Conflict,
}

/// Counters for one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub pushed: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub pulled: u64,
    pub applied: u64,
    pub skipped: u64,
    pub conflicts: u64,
    pub failed: u64,
    pub failed_outbox_changes: u64,
}

/// What happened to a sync trigger
#[derive(Debug)]
pub enum CycleOutcome {
    Completed(SyncSummary),
    /// Another cycle was already in flight; this trigger coalesced onto it
    Coalesced,
    /// The backoff gate is closed; nothing ran
    BackedOff { retry_in: Duration },
}

#[derive(Default)]
struct BackoffState {
    consecutive_failures: u32,
    next_allowed_at: Option<Instant>,
}

/// Orchestrates sync cycles for one device
pub struct SyncRunner {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    profile: RuntimeProfile,
    gate: tokio::sync::Mutex<()>,
    diagnostics: std::sync::Mutex<SyncDiagnostics>,
    backoff: std::sync::Mutex<BackoffState>,
    status: std::sync::Mutex<SyncStatus>,
}

impl SyncRunner {
    /// Build a runner; the profile is normalized and any clamped field is
    /// recorded as a validation warning on diagnostics.
    pub fn new(db: Arc<Database>, transport: Arc<dyn Transport>, profile: RuntimeProfile) -> Self {
        let (profile, clamped) = profile.normalize();

        let mut diagnostics = SyncDiagnostics::new();
        diagnostics.record_profile_changed(&profile);
        for field in clamped {
            diagnostics.record_validation_rejected(format!(
                "Runtime profile field {} was out of bounds and clamped",
                field
            ));
        }

        Self {
            db,
            transport,
            profile,
            gate: tokio::sync::Mutex::new(()),
            diagnostics: std::sync::Mutex::new(diagnostics),
            backoff: std::sync::Mutex::new(BackoffState::default()),
            status: std::sync::Mutex::new(SyncStatus::Idle),
        }
    }

    pub fn record_provider(&self, provider: SyncProvider) {
        self.diagnostics
            .lock()
            .unwrap()
            .record_provider_selected(provider);
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.lock().unwrap()
    }

    pub fn diagnostics(&self) -> SyncDiagnostics {
        self.diagnostics.lock().unwrap().clone()
    }

    /// Manual trigger: bypasses the backoff gate but still yields to an
    /// in-flight cycle.
    pub async fn sync_now(&self) -> Result<CycleOutcome> {
        self.run_cycle(true).await
    }

    /// Scheduled trigger: honors the backoff gate.
    pub async fn run_cycle(&self, force: bool) -> Result<CycleOutcome> {
        let Ok(_guard) = self.gate.try_lock() else {
            tracing::debug!("Sync already in flight, coalescing trigger");
            return Ok(CycleOutcome::Coalesced);
        };

        if !force {
            if let Some(retry_in) = self.backoff_remaining() {
                tracing::debug!("Sync backed off for another {:?}", retry_in);
                return Ok(CycleOutcome::BackedOff { retry_in });
            }
        }

        *self.status.lock().unwrap() = SyncStatus::Syncing;
        let started = Instant::now();

        match self.do_cycle().await {
            Ok(summary) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let needs_attention = summary.conflicts > 0 || summary.rejected > 0;

                self.diagnostics
                    .lock()
                    .unwrap()
                    .record_success(duration_ms, needs_attention);
                {
                    let mut backoff = self.backoff.lock().unwrap();
                    backoff.consecutive_failures = 0;
                    backoff.next_allowed_at = None;
                }
                *self.status.lock().unwrap() = if needs_attention {
                    SyncStatus::Conflict
                } else {
                    SyncStatus::Synced
                };

                tracing::info!(
                    "Sync cycle done in {}ms: pushed={} accepted={} rejected={} pulled={} applied={} skipped={} conflicts={} failed={}",
                    duration_ms,
                    summary.pushed,
                    summary.accepted,
                    summary.rejected,
                    summary.pulled,
                    summary.applied,
                    summary.skipped,
                    summary.conflicts,
                    summary.failed
                );

                Ok(CycleOutcome::Completed(summary))
            }
            Err(e) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.diagnostics
                    .lock()
                    .unwrap()
                    .record_failure(duration_ms, e.to_string());

                let delay = {
                    let mut backoff = self.backoff.lock().unwrap();
                    backoff.consecutive_failures += 1;
                    let delay = backoff_delay(backoff.consecutive_failures);
                    backoff.next_allowed_at = Some(Instant::now() + delay);
                    delay
                };

                *self.status.lock().unwrap() = if e.is_network() {
                    SyncStatus::Offline
                } else {
                    SyncStatus::Conflict
                };

                tracing::warn!("Sync cycle failed ({}), next attempt in {:?}", e, delay);
                Err(e)
            }
        }
    }

    fn backoff_remaining(&self) -> Option<Duration> {
        let backoff = self.backoff.lock().unwrap();
        let next = backoff.next_allowed_at?;
        let now = Instant::now();
        (next > now).then(|| next - now)
    }

    async fn do_cycle(&self) -> Result<SyncSummary> {
        let pool = self.db.pool();
        let device_id = self.db.device_id().to_string();
        let call_timeout = self.profile.transport_timeout();
        let mut summary = SyncSummary::default();

        let mut checkpoint = checkpoint::get(pool, &device_id).await?;
        let mut server_time: Option<String> = None;

        // 1. Drain push
        let changes = outbox::list(pool, self.profile.push_limit).await?;
        if !changes.is_empty() {
            summary.pushed = changes.len() as u64;

            let request = PushRequest {
                device_id: device_id.clone(),
                changes: changes.clone(),
            };
            // A timed-out push leaves the outbox untouched
            let response = timeout(call_timeout, self.transport.push(request))
                .await
                .map_err(|_| Error::Cancelled("Push timed out".to_string()))??;

            summary.accepted = response.accepted.len() as u64;
            outbox::remove(pool, &response.accepted).await?;

            for rejected in &response.rejected {
                if let Some(record) = changes
                    .iter()
                    .find(|c| c.idempotency_key == rejected.idempotency_key)
                {
                    outbox::mark_failed(pool, record.id, &rejected.reason).await?;
                    summary.rejected += 1;
                } else {
                    tracing::warn!(
                        "Server rejected unknown idempotency key {}",
                        rejected.idempotency_key
                    );
                }
            }

            if let Some(cursor) = response.server_cursor {
                checkpoint.server_cursor = Some(cursor);
            }
            server_time = response.server_time;
        }

        // 2. Pull pages
        for _page in 0..self.profile.max_pull_pages {
            let request = PullRequest {
                device_id: device_id.clone(),
                cursor: checkpoint.server_cursor.clone(),
                limit: self.profile.pull_limit,
            };
            let response = timeout(call_timeout, self.transport.pull(request))
                .await
                .map_err(|_| Error::Cancelled("Pull timed out".to_string()))??;

            summary.pulled += response.changes.len() as u64;
            for change in &response.changes {
                match applier::apply_incoming(&self.db, change).await {
                    Ok(ApplyOutcome::Applied) => summary.applied += 1,
                    Ok(ApplyOutcome::Skipped) => summary.skipped += 1,
                    Ok(ApplyOutcome::Conflict { .. }) => summary.conflicts += 1,
                    Err(e) => {
                        summary.failed += 1;
                        tracing::warn!(
                            "Failed to apply incoming change {} for {} {}: {}",
                            change.idempotency_key,
                            change.entity_type.as_str(),
                            change.entity_id,
                            e
                        );
                    }
                }
            }

            // Cursors are opaque; equality is only ever used to detect a
            // stalled server.
            let stalled = response.has_more
                && checkpoint.server_cursor.as_deref() == Some(response.server_cursor.as_str());

            checkpoint.server_cursor = Some(response.server_cursor);
            server_time = Some(response.server_time);

            // Commit the cursor per page so a cancelled cycle never skips
            // unprocessed changes.
            checkpoint::save(
                pool,
                &device_id,
                checkpoint.server_cursor.as_deref(),
                checkpoint.last_synced_at.as_deref(),
            )
            .await?;

            if stalled {
                tracing::warn!("Pull cursor did not advance, stopping pagination early");
                break;
            }
            if !response.has_more {
                break;
            }
        }

        // 3. Checkpoint
        let last_synced_at = server_time.unwrap_or_else(now_rfc3339);
        checkpoint::save(
            pool,
            &device_id,
            checkpoint.server_cursor.as_deref(),
            Some(&last_synced_at),
        )
        .await?;

        summary.failed_outbox_changes = outbox::stats(pool).await?.failed_count as u64;

        Ok(summary)
    }
}

/// Exponential backoff: min(300s, 5s * 2^(n-1)) for the n-th consecutive
/// failure.
pub fn backoff_delay(consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return Duration::ZERO;
    }
    let exponent = (consecutive_failures - 1).min(16);
    let delay = BASE_BACKOFF.saturating_mul(1u32 << exponent);
    delay.min(MAX_BACKOFF)
}
