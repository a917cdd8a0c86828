//! # RefSync Sync Engine
//!
//! Keeps the local cache in step with a remote reference library.
//!
//! ## Architecture
//!
//! - **Feed**: JSON listing and single-entry bodies, plus keys-only listings
//! - **Reconciler**: merges a page into the store without clobbering local
//!   edits, confirms pushed entities and decides whether to keep paging
//! - **Requests**: builds ledger entries for pulls, pushes and deletes
//! - **Transport**: one HTTP round trip per ledger entry (`reqwest`)
//! - **Engine**: drains the ledger oldest first and reports progress over
//!   a channel
//!
//! ## Usage
//!
//! ```rust,no_run
//! use refsync_sync::{HttpTransport, SyncEngine, SyncOptions, SyncScope};
//! use refsync_store::Store;
//! use std::sync::Arc;
//! use tokio::sync::{mpsc, Mutex};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = refsync_config::Config::load(std::path::Path::new("."))?;
//!     let store = Arc::new(Mutex::new(Store::open(&config.db_path())?));
//!     let engine = SyncEngine::new(
//!         store,
//!         HttpTransport::from_config(&config)?,
//!         SyncOptions::from(&config),
//!     );
//!
//!     let (tx, mut rx) = mpsc::unbounded_channel();
//!     let printer = tokio::spawn(async move {
//!         while let Some(update) = rx.recv().await {
//!             println!("{:?}", update);
//!         }
//!     });
//!     engine.sync(&SyncScope::Everything, &tx).await?;
//!     drop(tx);
//!     printer.await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod events;
pub mod feed;
pub mod http;
pub mod keys;
pub mod reconciler;
pub mod requests;
pub mod transport;

pub use config::SyncOptions;
pub use engine::{CancelHandle, SyncEngine, SyncScope};
pub use events::{BatchSummary, EntitySummary, SyncFailure, SyncUpdate, Update};
pub use feed::{FeedPage, FeedRecord};
pub use http::HttpTransport;
pub use reconciler::{FeedReconciler, ReconcileContext, ReconcileOutcome};
pub use requests::RequestFactory;
pub use transport::{OutboundRequest, Transport, TransportResponse};

/// Common result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// HTTP status the server uses for a failed `If-Match` precondition
pub const HTTP_PRECONDITION_FAILED: u16 = 412;

/// Errors that can occur during sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("server returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("version conflict on {request}: server copy changed since it was cached")]
    Conflict { request: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("local storage error: {0}")]
    Store(#[from] refsync_store::StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] refsync_common::RefError),

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        SyncError::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn transport_fatal(message: impl Into<String>) -> Self {
        SyncError::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether a later attempt of the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            SyncError::Http { status, .. } => Some(*status),
            SyncError::Conflict { .. } => Some(HTTP_PRECONDITION_FAILED),
            _ => None,
        }
    }

    /// Local storage failures abort the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::transport_retryable("timeout").is_retryable());
        assert!(!SyncError::transport_fatal("bad url").is_retryable());
        assert!(SyncError::Http {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!SyncError::Http {
            status: 400,
            message: String::new()
        }
        .is_retryable());
        assert!(!SyncError::Conflict {
            request: "PUT /items/X".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_conflict_reports_412() {
        let err = SyncError::Conflict {
            request: "PUT /items/ABCD1234".to_string(),
        };
        assert_eq!(err.http_status(), Some(HTTP_PRECONDITION_FAILED));
        assert!(err.to_string().contains("PUT /items/ABCD1234"));
    }
}
