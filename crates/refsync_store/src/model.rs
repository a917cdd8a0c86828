//! Entity shapes persisted in the local cache.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Prefix marking keys minted on this device before the server assigns one
pub const TEMP_KEY_PREFIX: &str = "local-";

/// Mint a temporary key for an entity created offline
pub fn temporary_key() -> String {
    format!("{}{}", TEMP_KEY_PREFIX, Uuid::new_v4())
}

pub fn is_temporary_key(key: &str) -> bool {
    key.strip_prefix(TEMP_KEY_PREFIX)
        .map(|rest| Uuid::parse_str(rest).is_ok())
        .unwrap_or(false)
}

/// Find the first temporary key embedded in a request path or body
pub fn find_temporary_key(text: &str) -> Option<String> {
    const UUID_LEN: usize = 36;
    let mut rest = text;
    while let Some(pos) = rest.find(TEMP_KEY_PREFIX) {
        let start = pos + TEMP_KEY_PREFIX.len();
        if let Some(candidate) = rest.get(start..start + UUID_LEN) {
            if Uuid::parse_str(candidate).is_ok() {
                return Some(format!("{}{}", TEMP_KEY_PREFIX, candidate));
            }
        }
        rest = &rest[start..];
    }
    None
}

/// How a cached entity relates to the server copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirtyState {
    /// Matches the server as of the last fetch or push
    Clean,
    /// Edited locally since the server last saw it
    Dirty,
    /// Created locally, never accepted by the server
    New,
    /// Referenced by the server but no content cached yet
    Missing,
    /// Server copy changed; content refresh still pending
    Stale,
}

impl DirtyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirtyState::Clean => "clean",
            DirtyState::Dirty => "dirty",
            DirtyState::New => "new",
            DirtyState::Missing => "missing",
            DirtyState::Stale => "stale",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "clean" => Some(DirtyState::Clean),
            "dirty" => Some(DirtyState::Dirty),
            "new" => Some(DirtyState::New),
            "missing" => Some(DirtyState::Missing),
            "stale" => Some(DirtyState::Stale),
            _ => None,
        }
    }

    /// Holds local changes the server has not accepted yet
    pub fn has_local_changes(&self) -> bool {
        matches!(self, DirtyState::Dirty | DirtyState::New)
    }

    /// State after a local content edit
    pub fn after_local_edit(self) -> Self {
        match self {
            DirtyState::New => DirtyState::New,
            _ => DirtyState::Dirty,
        }
    }
}

impl std::fmt::Display for DirtyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for DirtyState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DirtyState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        DirtyState::parse(raw)
            .ok_or_else(|| FromSqlError::Other(format!("unknown dirty state '{}'", raw).into()))
    }
}

/// Download-layer availability of an attachment's file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentStatus {
    #[default]
    Unknown,
    /// A file exists on the server
    Available,
    /// The file has been downloaded
    Local,
}

impl AttachmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentStatus::Unknown => "unknown",
            AttachmentStatus::Available => "available",
            AttachmentStatus::Local => "local",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unknown" => Some(AttachmentStatus::Unknown),
            "available" => Some(AttachmentStatus::Available),
            "local" => Some(AttachmentStatus::Local),
            _ => None,
        }
    }
}

impl ToSql for AttachmentStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AttachmentStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        AttachmentStatus::parse(raw).ok_or_else(|| {
            FromSqlError::Other(format!("unknown attachment status '{}'", raw).into())
        })
    }
}

/// Where a mutation originated
///
/// Remote-origin changes were observed on the server and must not be
/// echoed back as new ledger entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// A bibliographic record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Row identity, assigned at first save
    pub local_id: Option<i64>,
    pub key: String,
    pub item_type: String,
    pub title: String,
    pub etag: Option<String>,
    pub timestamp: Option<String>,
    pub dirty: DirtyState,
    /// Declared number of child records on the server
    pub num_children: u32,
    /// `None` for stubs that still need a full fetch
    pub content: Option<Value>,
}

impl Item {
    /// Placeholder for an item referenced by the server but not yet fetched
    pub fn missing(key: impl Into<String>) -> Self {
        Self {
            local_id: None,
            key: key.into(),
            item_type: String::new(),
            title: String::new(),
            etag: None,
            timestamp: None,
            dirty: DirtyState::Missing,
            num_children: 0,
            content: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub local_id: Option<i64>,
    pub key: String,
    pub name: String,
    /// `None` for top-level collections
    pub parent_key: Option<String>,
    /// Cached member count, refreshed when a member listing is applied
    pub size: u32,
    pub etag: Option<String>,
    pub timestamp: Option<String>,
    pub dirty: DirtyState,
    pub content: Option<Value>,
}

impl Collection {
    pub fn missing(key: impl Into<String>) -> Self {
        Self {
            local_id: None,
            key: key.into(),
            name: String::new(),
            parent_key: None,
            size: 0,
            etag: None,
            timestamp: None,
            dirty: DirtyState::Missing,
            content: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub local_id: Option<i64>,
    pub key: String,
    /// Owning item, `None` for standalone attachments
    pub parent_key: Option<String>,
    pub title: String,
    pub url: Option<String>,
    pub status: AttachmentStatus,
    pub etag: Option<String>,
    pub timestamp: Option<String>,
    pub dirty: DirtyState,
    pub content: Option<Value>,
}

/// Identity of a deleted entity still to be deleted upstream
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    pub id: i64,
    pub kind: refsync_common::EntityKind,
    pub key: String,
    pub etag: Option<String>,
    pub deleted_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_keys_are_recognised() {
        let key = temporary_key();
        assert!(is_temporary_key(&key));
        assert!(!is_temporary_key("ABCD1234"));
        assert!(!is_temporary_key("local-not-a-uuid"));
    }

    #[test]
    fn test_find_temporary_key_in_path() {
        let key = temporary_key();
        let path = format!("/collections/{}/items", key);
        assert_eq!(find_temporary_key(&path), Some(key));
        assert_eq!(find_temporary_key("/collections/ABCD1234/items"), None);
        assert_eq!(find_temporary_key("local-short local-"), None);
    }

    #[test]
    fn test_local_edit_keeps_new() {
        assert_eq!(DirtyState::New.after_local_edit(), DirtyState::New);
        assert_eq!(DirtyState::Clean.after_local_edit(), DirtyState::Dirty);
        assert_eq!(DirtyState::Stale.after_local_edit(), DirtyState::Dirty);
    }
}
