//! Builders for server response bodies
//!
//! Produces the JSON listing and entry documents the sync engine parses,
//! so tests describe a server state instead of hand-writing JSON.

use serde_json::{json, Map, Value};

/// Library URL used in generated links
pub const API_BASE: &str = "https://api.example.org/users/1";

/// One entry of a listing, or a single-entity body
#[derive(Debug, Clone)]
pub struct EntryBuilder {
    key: String,
    title: String,
    item_type: Option<String>,
    updated: String,
    etag: Option<String>,
    num_children: u32,
    content: Option<Value>,
    links: Vec<(String, String)>,
}

impl EntryBuilder {
    fn new(key: &str, item_type: Option<&str>) -> Self {
        Self {
            key: key.to_string(),
            title: key.to_string(),
            item_type: item_type.map(str::to_string),
            updated: "2024-01-01T00:00:00Z".to_string(),
            etag: Some(format!("etag-{}", key)),
            num_children: 0,
            content: Some(json!({})),
            links: vec![("self".to_string(), format!("{}/items/{}", API_BASE, key))],
        }
    }

    /// A regular item (`itemType: book`)
    pub fn item(key: &str, updated: &str) -> Self {
        Self::new(key, Some("book")).updated(updated)
    }

    /// A collection (no `itemType`)
    pub fn collection(key: &str, updated: &str) -> Self {
        let mut entry = Self::new(key, None).updated(updated);
        entry.links = vec![(
            "self".to_string(),
            format!("{}/collections/{}", API_BASE, key),
        )];
        entry.content = Some(json!({"name": key, "parentCollection": false}));
        entry
    }

    /// An attachment owned by `parent`
    pub fn attachment(key: &str, parent: &str, updated: &str) -> Self {
        Self::new(key, Some("attachment"))
            .updated(updated)
            .link("up", &format!("{}/items/{}", API_BASE, parent))
    }

    pub fn updated(mut self, updated: &str) -> Self {
        self.updated = updated.to_string();
        self
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    /// Replace the content document
    pub fn content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    /// An entry that only references the entity
    pub fn stub(mut self) -> Self {
        self.content = None;
        self
    }

    pub fn etag(mut self, etag: &str) -> Self {
        self.etag = Some(etag.to_string());
        self
    }

    pub fn num_children(mut self, count: u32) -> Self {
        self.num_children = count;
        self
    }

    /// Set the parent of a collection entry
    pub fn parent_collection(mut self, parent: &str) -> Self {
        let mut content = match self.content.take() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        content.insert("parentCollection".to_string(), json!(parent));
        self.content = Some(Value::Object(content));
        self
    }

    pub fn link(mut self, rel: &str, href: &str) -> Self {
        self.links.push((rel.to_string(), href.to_string()));
        self
    }

    /// Attachment file download link
    pub fn enclosure(self, href: &str) -> Self {
        self.link("enclosure", href)
    }

    pub fn build(&self) -> Value {
        let links: Vec<Value> = self
            .links
            .iter()
            .map(|(rel, href)| json!({"rel": rel, "href": href}))
            .collect();
        let mut entry = json!({
            "title": self.title,
            "key": self.key,
            "updated": self.updated,
            "numChildren": self.num_children,
            "links": links,
        });
        if let Some(object) = entry.as_object_mut() {
            if let Some(item_type) = &self.item_type {
                object.insert("itemType".to_string(), json!(item_type));
            }
            if let Some(etag) = &self.etag {
                object.insert("etag".to_string(), json!(etag));
            }
            if let Some(content) = &self.content {
                object.insert("content".to_string(), content.clone());
            }
        }
        entry
    }

    /// Body of a single-entity response
    pub fn body(&self) -> String {
        self.build().to_string()
    }
}

/// A listing page
#[derive(Debug, Clone, Default)]
pub struct FeedBuilder {
    entries: Vec<EntryBuilder>,
    self_link: Option<String>,
    next: Option<String>,
}

impl FeedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A page of the member listing of `collection`
    pub fn collection_items(collection: &str) -> Self {
        Self::new().self_link(&format!("{}/collections/{}/items", API_BASE, collection))
    }

    pub fn entry(mut self, entry: EntryBuilder) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn self_link(mut self, href: &str) -> Self {
        self.self_link = Some(href.to_string());
        self
    }

    /// Continuation link of this page
    pub fn next(mut self, href: &str) -> Self {
        self.next = Some(href.to_string());
        self
    }

    pub fn body(&self) -> String {
        let mut links = Vec::new();
        if let Some(href) = &self.self_link {
            links.push(json!({"rel": "self", "href": href}));
        }
        if let Some(href) = &self.next {
            links.push(json!({"rel": "next", "href": href}));
        }
        let entries: Vec<Value> = self.entries.iter().map(EntryBuilder::build).collect();
        json!({"links": links, "entries": entries}).to_string()
    }
}

/// Body of a keys-only listing
pub fn keys_body(keys: &[&str]) -> String {
    keys.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_entry_has_no_content() {
        let entry = EntryBuilder::item("ITEM0001", "t1").stub().build();
        assert!(entry.get("content").is_none());
        assert_eq!(entry["itemType"], "book");
    }

    #[test]
    fn test_collection_listing_links() {
        let body = FeedBuilder::collection_items("COLL0001")
            .next("https://api.example.org/users/1/collections/COLL0001/items?start=2")
            .body();
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["links"][0]["rel"], "self");
        assert_eq!(value["links"][1]["rel"], "next");
        assert_eq!(value["entries"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_parent_collection_keeps_name() {
        let entry = EntryBuilder::collection("SUB00001", "t1")
            .parent_collection("COLL0001")
            .build();
        assert_eq!(entry["content"]["name"], "SUB00001");
        assert_eq!(entry["content"]["parentCollection"], "COLL0001");
    }
}
