//! Builders for ledger entries.
//!
//! Every request the engine or the reconciler queues is built here, so
//! paths, dispositions and update targets stay consistent.

use crate::config::SyncOptions;
use crate::reconciler::ReconcileContext;
use refsync_store::{
    Attachment, Collection, DirtyEntry, DirtyState, Disposition, EntityKind, HttpMethod, Item,
    NewRequest, RequestKind, Tombstone, UpdateTarget,
};
use serde_json::{json, Map, Value};

/// Newest first, so an unchanged entry means older pages are current too
const LISTING_ORDER: &str = "sort=dateModified&direction=desc";

#[derive(Debug, Clone)]
pub struct RequestFactory {
    page_size: u32,
    credential: String,
}

impl RequestFactory {
    pub fn new(options: &SyncOptions) -> Self {
        Self {
            page_size: options.page_size,
            credential: options.credential.clone(),
        }
    }

    fn request(
        &self,
        kind: RequestKind,
        method: HttpMethod,
        path: impl Into<String>,
        disposition: Disposition,
    ) -> NewRequest {
        NewRequest::new(kind, method, path, disposition).with_credential(self.credential.clone())
    }

    fn listing_path(&self, path: &str) -> String {
        format!(
            "{}?format=json&limit={}&{}",
            path, self.page_size, LISTING_ORDER
        )
    }

    //
    // Pulls
    //

    pub fn fetch_top_items(&self) -> NewRequest {
        self.request(
            RequestKind::FetchItems,
            HttpMethod::Get,
            self.listing_path("/items/top"),
            Disposition::Feed,
        )
    }

    pub fn fetch_collections(&self) -> NewRequest {
        self.request(
            RequestKind::FetchCollections,
            HttpMethod::Get,
            self.listing_path("/collections"),
            Disposition::Feed,
        )
    }

    /// Metadata of one collection
    pub fn fetch_collection(&self, key: &str) -> NewRequest {
        self.request(
            RequestKind::FetchCollections,
            HttpMethod::Get,
            format!("/collections/{}?format=json", key),
            Disposition::Entry,
        )
    }

    /// Full member listing of a collection
    pub fn fetch_collection_items(&self, key: &str) -> NewRequest {
        self.request(
            RequestKind::FetchCollectionItems,
            HttpMethod::Get,
            self.listing_path(&format!("/collections/{}/items", key)),
            Disposition::Feed,
        )
        .with_subject(key)
    }

    /// Member keys only, for reconciling a stale collection cheaply
    pub fn fetch_collection_keys(&self, key: &str) -> NewRequest {
        self.request(
            RequestKind::FetchKeys,
            HttpMethod::Get,
            format!("/collections/{}/items?format=keys", key),
            Disposition::Keys,
        )
        .with_subject(key)
    }

    pub fn fetch_children(&self, item_key: &str) -> NewRequest {
        self.request(
            RequestKind::FetchChildren,
            HttpMethod::Get,
            self.listing_path(&format!("/items/{}/children", item_key)),
            Disposition::Feed,
        )
        .with_subject(item_key)
    }

    pub fn fetch_child_keys(&self, item_key: &str) -> NewRequest {
        self.request(
            RequestKind::FetchChildKeys,
            HttpMethod::Get,
            format!("/items/{}/children?format=keys", item_key),
            Disposition::Keys,
        )
        .with_subject(item_key)
    }

    /// One item or attachment by key
    ///
    /// `collection` records the membership once the item arrives.
    pub fn fetch_item(&self, key: &str, collection: Option<&str>) -> NewRequest {
        let request = self.request(
            RequestKind::FetchItem,
            HttpMethod::Get,
            format!("/items/{}?format=json", key),
            Disposition::Entry,
        );
        match collection {
            Some(collection) => request.with_subject(collection),
            None => request,
        }
    }

    /// Next page of the listing a response belongs to
    pub fn continuation(&self, context: &ReconcileContext, next: &str) -> NewRequest {
        let credential = context
            .credential
            .clone()
            .unwrap_or_else(|| self.credential.clone());
        let request = NewRequest::new(context.kind, HttpMethod::Get, next, context.disposition)
            .with_credential(credential);
        match &context.subject_key {
            Some(subject) => request.with_subject(subject.clone()),
            None => request,
        }
    }

    //
    // Pushes
    //

    pub fn create_item(&self, item: &Item) -> NewRequest {
        let content = item_body(&item.item_type, &item.title, item.content.as_ref());
        self.request(RequestKind::Create, HttpMethod::Post, "/items", Disposition::Feed)
            .with_body(json!({ "items": [content] }).to_string())
            .with_update_target(UpdateTarget::new(&item.key, EntityKind::Item))
    }

    pub fn update_item(&self, item: &Item) -> NewRequest {
        let content = item_body(&item.item_type, &item.title, item.content.as_ref());
        self.request(
            RequestKind::Update,
            HttpMethod::Put,
            format!("/items/{}", item.key),
            Disposition::Entry,
        )
        .with_body(content.to_string())
        .with_if_match(item.etag.clone())
        .with_update_target(UpdateTarget::new(&item.key, EntityKind::Item))
    }

    /// Created under its parent item, or standalone without one
    pub fn create_attachment(&self, attachment: &Attachment) -> NewRequest {
        let content = item_body("attachment", &attachment.title, attachment.content.as_ref());
        let path = match &attachment.parent_key {
            Some(parent) => format!("/items/{}/children", parent),
            None => "/items".to_string(),
        };
        let request = self.request(RequestKind::Create, HttpMethod::Post, path, Disposition::Feed)
            .with_body(json!({ "items": [content] }).to_string())
            .with_update_target(UpdateTarget::new(&attachment.key, EntityKind::Attachment));
        match &attachment.parent_key {
            Some(parent) => request.with_subject(parent.clone()),
            None => request,
        }
    }

    pub fn update_attachment(&self, attachment: &Attachment) -> NewRequest {
        let content = item_body("attachment", &attachment.title, attachment.content.as_ref());
        self.request(
            RequestKind::Update,
            HttpMethod::Put,
            format!("/items/{}", attachment.key),
            Disposition::Entry,
        )
        .with_body(content.to_string())
        .with_if_match(attachment.etag.clone())
        .with_update_target(UpdateTarget::new(&attachment.key, EntityKind::Attachment))
    }

    pub fn create_collection(&self, collection: &Collection) -> NewRequest {
        self.request(
            RequestKind::Create,
            HttpMethod::Post,
            "/collections",
            Disposition::Feed,
        )
        .with_body(json!({ "collections": [collection_body(collection)] }).to_string())
        .with_update_target(UpdateTarget::new(&collection.key, EntityKind::Collection))
    }

    pub fn update_collection(&self, collection: &Collection) -> NewRequest {
        self.request(
            RequestKind::Update,
            HttpMethod::Put,
            format!("/collections/{}", collection.key),
            Disposition::Entry,
        )
        .with_body(collection_body(collection).to_string())
        .with_if_match(collection.etag.clone())
        .with_update_target(UpdateTarget::new(&collection.key, EntityKind::Collection))
    }

    /// Upstream delete for a tombstone
    pub fn delete(&self, tombstone: &Tombstone) -> NewRequest {
        let path = match tombstone.kind {
            EntityKind::Collection => format!("/collections/{}", tombstone.key),
            EntityKind::Item | EntityKind::Attachment => format!("/items/{}", tombstone.key),
        };
        self.request(RequestKind::Delete, HttpMethod::Delete, path, Disposition::None)
            .with_if_match(tombstone.etag.clone())
            .with_subject(tombstone.key.clone())
    }

    /// Requests that bring one dirty entity back to `CLEAN`
    pub fn for_dirty(&self, entry: &DirtyEntry) -> Vec<NewRequest> {
        match (entry, entry.dirty()) {
            (_, DirtyState::Clean) => Vec::new(),
            (DirtyEntry::Item(item), DirtyState::New) => vec![self.create_item(item)],
            (DirtyEntry::Item(item), DirtyState::Dirty) => vec![self.update_item(item)],
            (DirtyEntry::Item(item), DirtyState::Stale | DirtyState::Missing) => {
                vec![self.fetch_item(&item.key, None)]
            }
            (DirtyEntry::Attachment(attachment), DirtyState::New) => {
                vec![self.create_attachment(attachment)]
            }
            (DirtyEntry::Attachment(attachment), DirtyState::Dirty) => {
                vec![self.update_attachment(attachment)]
            }
            (DirtyEntry::Attachment(attachment), DirtyState::Stale | DirtyState::Missing) => {
                vec![self.fetch_item(&attachment.key, None)]
            }
            (DirtyEntry::Collection(collection), DirtyState::New) => {
                vec![self.create_collection(collection)]
            }
            (DirtyEntry::Collection(collection), DirtyState::Dirty) => {
                vec![self.update_collection(collection)]
            }
            (DirtyEntry::Collection(collection), DirtyState::Missing) => vec![
                self.fetch_collection(&collection.key),
                self.fetch_collection_items(&collection.key),
            ],
            (DirtyEntry::Collection(collection), DirtyState::Stale) => {
                vec![self.fetch_collection_keys(&collection.key)]
            }
        }
    }
}

/// Content document with `itemType` and `title` filled in
fn item_body(item_type: &str, title: &str, content: Option<&Value>) -> Value {
    let mut body = match content {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    if !item_type.is_empty() {
        body.entry("itemType")
            .or_insert_with(|| Value::String(item_type.to_string()));
    }
    if !title.is_empty() {
        body.entry("title")
            .or_insert_with(|| Value::String(title.to_string()));
    }
    Value::Object(body)
}

fn collection_body(collection: &Collection) -> Value {
    let parent = match &collection.parent_key {
        Some(parent) => Value::String(parent.clone()),
        None => Value::Bool(false),
    };
    json!({
        "name": collection.name,
        "parentCollection": parent,
    })
}
