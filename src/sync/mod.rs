// sync/mod.rs - The local-first synchronization kernel
//
// Local mutations reach the remote through the outbox (push); remote
// changes arrive through cursor-based pull pages and are classified by the
// incoming applier, which records structured conflicts instead of merging
// blindly. The resolution engine closes conflicts with user-selectable
// strategies and leaves a deterministic, replay-proof record of each
// decision.

pub mod applier;
pub mod checkpoint;
pub mod conflicts;
pub mod diagnostics;
pub mod http;
pub mod outbox;
pub mod profile;
pub mod resolution;
pub mod runner;
pub mod transport;

#[cfg(test)]
mod sync_tests;

pub use applier::{apply_incoming, ApplyOutcome, IncomingChange};
pub use checkpoint::Checkpoint;
pub use conflicts::{
    ConflictEvent, ConflictEventType, ConflictRecord, ConflictStats, ConflictStatus, ConflictType,
    ResolutionStrategy,
};
pub use diagnostics::SyncDiagnostics;
pub use http::HttpTransport;
pub use outbox::{EntityType, Operation, OutboxRecord, OutboxStats};
pub use profile::RuntimeProfile;
pub use resolution::{ignore, resolve, ResolutionPayload};
pub use runner::{backoff_delay, CycleOutcome, SyncRunner, SyncStatus, SyncSummary};
pub use transport::{
    PullRequest, PullResponse, PushRequest, PushResponse, RejectedChange, SyncProvider, Transport,
    TransportSelection,
};
