//! Progress reporting from a sync run.

use crate::SyncError;
use refsync_store::{DirtyState, EntityKind, RequestKind};
use serde::Serialize;

/// What happened to one entity while applying a server response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Created,
    Updated,
    Unchanged,
    /// Kept the local version because it carries unpushed edits
    Skipped,
    /// Local entity now carries its server key
    Confirmed,
}

/// One entity touched by a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitySummary {
    pub kind: EntityKind,
    pub key: String,
    pub dirty: DirtyState,
    pub change: Change,
}

impl EntitySummary {
    pub fn new(kind: EntityKind, key: impl Into<String>, dirty: DirtyState, change: Change) -> Self {
        Self {
            kind,
            key: key.into(),
            dirty,
            change,
        }
    }
}

/// Totals for one drained batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub requests_done: usize,
    pub requests_failed: usize,
    pub entities_updated: usize,
    pub requests_queued: usize,
    /// `NEW` entries left behind, either blocked or stopped early
    pub requests_pending: usize,
    pub cancelled: bool,
}

impl BatchSummary {
    pub fn is_clean(&self) -> bool {
        self.requests_failed == 0 && !self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Update {
    EntityUpdated(EntitySummary),
    /// Follow-up requests were added to the ledger
    QueuedMore(usize),
    BatchComplete(BatchSummary),
}

/// A request that ended in `ERROR`
#[derive(Debug, thiserror::Error)]
#[error("{request} failed: {error}")]
pub struct SyncFailure {
    /// e.g. `PUT /items/ABCD1234`
    pub request: String,
    pub kind: RequestKind,
    pub ledger_uuid: String,
    pub http_status: Option<u16>,
    #[source]
    pub error: SyncError,
}

impl SyncFailure {
    pub fn is_conflict(&self) -> bool {
        matches!(self.error, SyncError::Conflict { .. })
    }
}

/// What the engine sends over its progress channel
pub type SyncUpdate = Result<Update, SyncFailure>;
