//! # RefSync local store
//!
//! SQLite-backed cache of a remote reference library.
//!
//! ## Architecture
//!
//! - **Entities**: items, collections and attachments, each with a stable
//!   local row id, a (rewritable) key, an etag and a dirty state
//! - **Dirty queue**: an on-demand snapshot of everything not `CLEAN`
//! - **Request ledger**: persisted outbound requests with a
//!   `NEW → IN_PROGRESS → DONE | ERROR` lifecycle that survives restarts
//! - **Memberships**: the item/collection join relation; local changes
//!   enqueue their own ledger entries
//! - **Tombstones**: `(key, etag)` of deleted entities awaiting an upstream delete
//!
//! All writes go through one [`Store`], so the cache has a single writer.

pub mod dirty;
pub mod ledger;
pub mod local;
pub mod membership;
pub mod model;
pub mod store;

pub use dirty::{DirtyEntry, DirtyQueue};
pub use ledger::{
    Disposition, HttpMethod, LedgerCounts, LedgerEntry, NewRequest, RequestKind, RequestStatus,
    UpdateTarget,
};
pub use model::{
    is_temporary_key, temporary_key, Attachment, AttachmentStatus, Collection, DirtyState, Item,
    Origin, Tombstone,
};
pub use refsync_common::EntityKind;
pub use store::{Confirmation, Confirmed, Store, StoreStats};

/// Common result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the local store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Content serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{kind} '{key}' not found")]
    NotFound { kind: EntityKind, key: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl StoreError {
    pub fn not_found(kind: EntityKind, key: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            key: key.into(),
        }
    }
}
