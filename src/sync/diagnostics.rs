// sync/diagnostics.rs - Session-scoped sync observability
//
// In-memory aggregate owned by the sync runner; rebuilt from zero at every
// process start. Durable observability lives in the conflict tables.

use serde::Serialize;

use crate::db::models::now_rfc3339;
use crate::sync::profile::RuntimeProfile;
use crate::sync::transport::SyncProvider;

/// Bound on each event list; oldest entries fall off first
const MAX_EVENTS: usize = 50;

/// One recorded diagnostics event
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsEvent {
    pub detail: String,
    pub at: String,
}

/// Aggregate of cycle outcomes and configuration changes for this session
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncDiagnostics {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub conflict_cycles: u64,
    pub consecutive_failures: u32,
    pub success_rate_percent: f64,
    pub last_cycle_duration_ms: Option<u64>,
    pub average_cycle_duration_ms: Option<u64>,
    pub last_attempt_at: Option<String>,
    pub last_success_at: Option<String>,
    pub selected_provider: Option<SyncProvider>,
    pub runtime_profile: Option<RuntimeProfile>,
    pub provider_selected_events: Vec<DiagnosticsEvent>,
    pub runtime_profile_changed_events: Vec<DiagnosticsEvent>,
    pub validation_rejected_events: Vec<DiagnosticsEvent>,
    pub last_warning: Option<String>,

    #[serde(skip)]
    total_duration_ms: u64,
}

impl SyncDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed cycle
    pub fn record_success(&mut self, duration_ms: u64, had_conflicts: bool) {
        self.total_cycles += 1;
        self.successful_cycles += 1;
        if had_conflicts {
            self.conflict_cycles += 1;
        }
        self.consecutive_failures = 0;
        self.record_duration(duration_ms);
        let now = now_rfc3339();
        self.last_attempt_at = Some(now.clone());
        self.last_success_at = Some(now);
        self.refresh_rate();
    }

    /// Record a failed cycle
    pub fn record_failure(&mut self, duration_ms: u64, warning: String) {
        self.total_cycles += 1;
        self.failed_cycles += 1;
        self.consecutive_failures += 1;
        self.record_duration(duration_ms);
        self.last_attempt_at = Some(now_rfc3339());
        self.last_warning = Some(warning);
        self.refresh_rate();
    }

    pub fn record_provider_selected(&mut self, provider: SyncProvider) {
        self.selected_provider = Some(provider);
        push_event(
            &mut self.provider_selected_events,
            provider.as_str().to_string(),
        );
    }

    pub fn record_profile_changed(&mut self, profile: &RuntimeProfile) {
        self.runtime_profile = Some(profile.clone());
        push_event(
            &mut self.runtime_profile_changed_events,
            format!(
                "auto={}s background={}s push={} pull={} pages={}",
                profile.auto_sync_interval_secs,
                profile.background_sync_interval_secs,
                profile.push_limit,
                profile.pull_limit,
                profile.max_pull_pages
            ),
        );
    }

    /// Record a clamped profile field or other soft validation rejection
    pub fn record_validation_rejected(&mut self, detail: String) {
        self.last_warning = Some(detail.clone());
        push_event(&mut self.validation_rejected_events, detail);
    }

    fn record_duration(&mut self, duration_ms: u64) {
        self.last_cycle_duration_ms = Some(duration_ms);
        self.total_duration_ms += duration_ms;
        self.average_cycle_duration_ms = Some(self.total_duration_ms / self.total_cycles.max(1));
    }

    fn refresh_rate(&mut self) {
        self.success_rate_percent = if self.total_cycles == 0 {
            0.0
        } else {
            (self.successful_cycles as f64 / self.total_cycles as f64) * 100.0
        };
    }
}

fn push_event(events: &mut Vec<DiagnosticsEvent>, detail: String) {
    events.push(DiagnosticsEvent {
        detail,
        at: now_rfc3339(),
    });
    if events.len() > MAX_EVENTS {
        let excess = events.len() - MAX_EVENTS;
        events.drain(0..excess);
    }
}
