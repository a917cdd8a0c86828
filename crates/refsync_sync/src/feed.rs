//! Wire format of server responses.
//!
//! A listing is `{"links": [...], "entries": [...]}`; a single-entity
//! body is one entry object. Each entry carries `title`, `key`, `updated`,
//! an optional `itemType` discriminator, an opaque `content` document,
//! an `etag` and typed links (`self`, `up`, `enclosure`, `next`).

use crate::{Result, SyncError};
use refsync_store::{AttachmentStatus, Disposition, EntityKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
}

/// One entry exactly as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEntry {
    #[serde(default)]
    pub title: String,
    pub key: String,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    #[serde(default)]
    pub num_children: u32,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default)]
    pub links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct WireFeed {
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    entries: Vec<Value>,
}

/// A parsed entry, ready for reconciliation
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRecord {
    pub kind: EntityKind,
    pub key: String,
    pub title: String,
    pub timestamp: Option<String>,
    pub etag: Option<String>,
    pub item_type: Option<String>,
    pub num_children: u32,
    /// `None` when the entry only references the entity
    pub content: Option<Value>,
    /// Owning item for attachments, parent collection for collections
    pub parent_key: Option<String>,
    /// Download URL of an attachment file
    pub enclosure: Option<String>,
}

impl FeedRecord {
    pub fn from_wire(entry: WireEntry) -> Self {
        let kind = classify(entry.item_type.as_deref());
        let content = entry.content.filter(|c| !c.is_null());

        let parent_key = match kind {
            EntityKind::Attachment => find_link(&entry.links, "up")
                .and_then(|href| segment_after(href, "/items/"))
                .or_else(|| content.as_ref().and_then(|c| string_field(c, "parentItem"))),
            EntityKind::Collection => content.as_ref().and_then(collection_parent),
            EntityKind::Item => None,
        };
        let enclosure = find_link(&entry.links, "enclosure").map(str::to_string);

        Self {
            kind,
            key: entry.key,
            title: entry.title,
            timestamp: entry.updated,
            etag: entry.etag,
            item_type: entry.item_type,
            num_children: entry.num_children,
            content,
            parent_key,
            enclosure,
        }
    }

    /// Availability implied by the record itself
    pub fn attachment_status(&self) -> AttachmentStatus {
        let imported = self
            .content
            .as_ref()
            .and_then(|c| c.get("linkMode"))
            .and_then(Value::as_str)
            .map(|mode| mode == "imported_file" || mode == "imported_url")
            .unwrap_or(false);
        if self.enclosure.is_some() || imported {
            AttachmentStatus::Available
        } else {
            AttachmentStatus::Unknown
        }
    }
}

/// One response body split into entries and pagination links
#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    entries: Vec<Value>,
    pub self_link: Option<String>,
    pub next: Option<String>,
}

impl FeedPage {
    /// Parse a listing or single-entity body
    ///
    /// `next_header` is the continuation taken from an HTTP `Link` header;
    /// a `next` link inside the body wins.
    pub fn parse(body: &str, disposition: Disposition, next_header: Option<String>) -> Result<Self> {
        match disposition {
            Disposition::Feed => {
                let feed: WireFeed = serde_json::from_str(body)
                    .map_err(|e| SyncError::MalformedResponse(format!("feed: {}", e)))?;
                let next = find_link(&feed.links, "next")
                    .map(str::to_string)
                    .or(next_header);
                let self_link = find_link(&feed.links, "self").map(str::to_string);
                Ok(Self {
                    entries: feed.entries,
                    self_link,
                    next,
                })
            }
            Disposition::Entry => {
                let entry: Value = serde_json::from_str(body)
                    .map_err(|e| SyncError::MalformedResponse(format!("entry: {}", e)))?;
                if !entry.is_object() {
                    return Err(SyncError::MalformedResponse(
                        "entry body is not an object".to_string(),
                    ));
                }
                Ok(Self {
                    entries: vec![entry],
                    self_link: None,
                    next: None,
                })
            }
            other => Err(SyncError::MalformedResponse(format!(
                "{} bodies are not feeds",
                other
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in server order; a bad entry only fails itself
    pub fn records(&self) -> impl Iterator<Item = Result<FeedRecord>> + '_ {
        self.entries.iter().enumerate().map(|(index, raw)| {
            serde_json::from_value::<WireEntry>(raw.clone())
                .map(FeedRecord::from_wire)
                .map_err(|e| SyncError::MalformedResponse(format!("entry {}: {}", index, e)))
        })
    }

    /// Collection this listing is scoped to, from `/collections/{key}/items`
    pub fn collection_key(&self) -> Option<String> {
        self.self_link.as_deref().and_then(collection_from_items_path)
    }
}

/// Keys-only listing: one key per line
pub fn parse_keys(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// `rel="next"` target of an HTTP `Link` header
pub fn next_from_link_header(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| {
            let p = p.trim();
            p == "rel=\"next\"" || p == "rel=next"
        });
        if is_next {
            target
                .strip_prefix('<')
                .and_then(|t| t.strip_suffix('>'))
                .map(str::to_string)
        } else {
            None
        }
    })
}

/// Entry kind from the `itemType` discriminator
pub fn classify(item_type: Option<&str>) -> EntityKind {
    match item_type {
        None => EntityKind::Collection,
        Some("attachment") | Some("note") => EntityKind::Attachment,
        Some(_) => EntityKind::Item,
    }
}

fn find_link<'a>(links: &'a [Link], rel: &str) -> Option<&'a str> {
    links
        .iter()
        .find(|link| link.rel == rel)
        .map(|link| link.href.as_str())
}

fn string_field(content: &Value, field: &str) -> Option<String> {
    content
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty() && *s != "false")
        .map(str::to_string)
}

/// `parentCollection`/`parent`: a key, or `false` for top level
fn collection_parent(content: &Value) -> Option<String> {
    string_field(content, "parentCollection").or_else(|| string_field(content, "parent"))
}

/// Path segment following `marker`, without query string
fn segment_after(href: &str, marker: &str) -> Option<String> {
    let start = href.find(marker)? + marker.len();
    let segment = href[start..]
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or("");
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}

fn collection_from_items_path(href: &str) -> Option<String> {
    let key = segment_after(href, "/collections/")?;
    let after_key = href.find("/collections/")? + "/collections/".len() + key.len();
    if href[after_key..].starts_with("/items") {
        Some(key)
    } else {
        None
    }
}
