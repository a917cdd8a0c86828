//! Transport abstraction for executing ledger entries.

use crate::Result;
use async_trait::async_trait;
use refsync_store::{HttpMethod, LedgerEntry, RequestKind};

/// Everything a transport needs to perform one HTTP round trip
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    /// Relative to the library prefix, or absolute
    pub path: String,
    pub credential: String,
    pub if_match: Option<String>,
    pub body: Option<String>,
    /// Idempotency token for creations
    pub write_token: Option<String>,
    pub plain_text: bool,
}

impl OutboundRequest {
    pub fn is_absolute(&self) -> bool {
        self.path.starts_with("http://") || self.path.starts_with("https://")
    }
}

impl From<&LedgerEntry> for OutboundRequest {
    fn from(entry: &LedgerEntry) -> Self {
        let write_token = (entry.method == HttpMethod::Post).then(|| entry.uuid.clone());
        Self {
            method: entry.method,
            path: entry.path.clone(),
            credential: entry.credential.clone(),
            if_match: entry.if_match.clone(),
            body: entry.body.clone(),
            write_token,
            // Membership bodies are bare keys
            plain_text: entry.kind == RequestKind::AddMembership,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
    /// Continuation taken from a `Link` header
    pub next_link: Option<String>,
    pub etag: Option<String>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            next_link: None,
            etag: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_next_link(mut self, next: impl Into<String>) -> Self {
        self.next_link = Some(next.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs one request against the server
///
/// Returns `Err` only when no HTTP response was received; any status code,
/// error or not, comes back as a [`TransportResponse`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &OutboundRequest) -> Result<TransportResponse>;
}
