//! Merging server responses into the local cache.
//!
//! A page is applied entry by entry in server order. Local edits are never
//! overwritten by a general merge; only the confirmation of the request
//! that pushed them brings an entity back to `CLEAN`.

use crate::config::SyncOptions;
use crate::events::{Change, EntitySummary};
use crate::feed::{FeedPage, FeedRecord};
use crate::requests::RequestFactory;
use crate::Result;
use refsync_config::StopPolicy;
use refsync_store::{
    Attachment, AttachmentStatus, Collection, Confirmation, DirtyState, Disposition, EntityKind,
    Item, LedgerEntry, NewRequest, Origin, RequestKind, Store, UpdateTarget,
};

/// The request a response answers
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileContext {
    pub kind: RequestKind,
    pub disposition: Disposition,
    pub credential: Option<String>,
    /// Collection or item the request is scoped to
    pub subject_key: Option<String>,
    pub update_target: Option<UpdateTarget>,
}

impl ReconcileContext {
    pub fn new(kind: RequestKind, disposition: Disposition) -> Self {
        Self {
            kind,
            disposition,
            credential: None,
            subject_key: None,
            update_target: None,
        }
    }

    pub fn with_subject(mut self, key: impl Into<String>) -> Self {
        self.subject_key = Some(key.into());
        self
    }

    pub fn with_update_target(mut self, target: UpdateTarget) -> Self {
        self.update_target = Some(target);
        self
    }

    /// Collection whose membership a page describes
    fn collection_scope(&self, page: &FeedPage) -> Option<String> {
        page.collection_key().or_else(|| match self.kind {
            RequestKind::FetchCollectionItems | RequestKind::FetchItem => self.subject_key.clone(),
            _ => None,
        })
    }

    /// Whether the page belongs to a full member listing
    fn is_member_listing(&self, page: &FeedPage) -> bool {
        self.kind == RequestKind::FetchCollectionItems || page.collection_key().is_some()
    }
}

impl From<&LedgerEntry> for ReconcileContext {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            kind: entry.kind,
            disposition: entry.disposition,
            credential: Some(entry.credential.clone()),
            subject_key: entry.subject_key.clone(),
            update_target: entry.update_target.clone(),
        }
    }
}

/// Counters and per-entity results of one applied response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub confirmed: usize,
    /// Follow-up ledger entries written
    pub queued: usize,
    pub stopped_pagination: bool,
    pub entities: Vec<EntitySummary>,
}

impl ReconcileOutcome {
    fn record(&mut self, summary: EntitySummary) {
        match summary.change {
            Change::Created => self.inserted += 1,
            Change::Updated => self.updated += 1,
            Change::Unchanged => self.unchanged += 1,
            Change::Skipped => self.skipped += 1,
            Change::Confirmed => self.confirmed += 1,
        }
        self.processed += 1;
        self.entities.push(summary);
    }
}

/// Result of merging one record
struct Merged {
    summary: EntitySummary,
    /// Local copy was already current
    current: bool,
}

impl Merged {
    fn changed(summary: EntitySummary) -> Self {
        Self {
            summary,
            current: false,
        }
    }
}

pub struct FeedReconciler<'a> {
    pub(crate) store: &'a mut Store,
    pub(crate) options: &'a SyncOptions,
    pub(crate) requests: &'a RequestFactory,
}

impl<'a> FeedReconciler<'a> {
    pub fn new(
        store: &'a mut Store,
        options: &'a SyncOptions,
        requests: &'a RequestFactory,
    ) -> Self {
        Self {
            store,
            options,
            requests,
        }
    }

    /// Apply one listing page or single-entity body
    ///
    /// Entries before a malformed one stay applied; the error is returned
    /// without processing the rest of the page.
    pub fn apply_page(
        &mut self,
        page: &FeedPage,
        context: &ReconcileContext,
    ) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        let mut pending_target = context.update_target.as_ref();
        let mut current_entries = 0usize;

        let mut scope = context.collection_scope(page);
        if let Some(collection) = scope.clone() {
            if self.store.deletion_pending(EntityKind::Collection, &collection)? {
                tracing::debug!("Collection {} is being deleted, ignoring its members", collection);
                scope = None;
            } else {
                self.ensure_collection(&collection)?;
            }
        }

        for record in page.records() {
            let record = record?;

            if let Some(target) = pending_target.filter(|t| t.kind == record.kind) {
                pending_target = None;
                match self.confirm(target, &record)? {
                    Some(summary) => outcome.record(summary),
                    None => {
                        tracing::warn!(
                            "Confirmation target {} '{}' is not cached, skipping {}",
                            target.kind,
                            target.old_key,
                            record.key
                        );
                        outcome.skipped += 1;
                    }
                }
                continue;
            }

            if self.deleted_locally(&record)? {
                tracing::debug!("{} {} was deleted here, not restoring it", record.kind, record.key);
                outcome.processed += 1;
                outcome.skipped += 1;
                continue;
            }

            let merged = match record.kind {
                EntityKind::Item => self.merge_item(&record)?,
                EntityKind::Collection => self.merge_collection(&record)?,
                EntityKind::Attachment => self.merge_attachment(&record)?,
            };

            if record.kind == EntityKind::Item {
                let refreshed = matches!(merged.summary.change, Change::Created | Change::Updated);
                if refreshed && record.num_children > 0 {
                    let children = self.children_request(&record.key, merged.summary.change)?;
                    outcome.queued += self.queue(&children)?;
                }
                if let Some(collection) = &scope {
                    self.store
                        .add_membership(&record.key, collection, Origin::Remote)?;
                }
            }

            if merged.current {
                current_entries += 1;
            }
            outcome.record(merged.summary);
        }

        outcome.stopped_pagination = match self.options.stop_policy {
            StopPolicy::FirstUnchanged => current_entries > 0,
            StopPolicy::WholePage => !page.is_empty() && current_entries == page.len(),
        };

        if let Some(next) = &page.next {
            if outcome.stopped_pagination {
                tracing::debug!("Cache is current, not following {}", next);
            } else {
                let continuation = self.requests.continuation(context, next);
                outcome.queued += self.queue(&continuation)?;
            }
        }

        if let Some(collection) = &scope {
            let size = self.store.recompute_collection_size(collection)?;
            let complete = page.next.is_none() || outcome.stopped_pagination;
            if complete && context.is_member_listing(page) {
                self.mark_listing_complete(collection)?;
            }
            tracing::debug!("Collection {} has {} members", collection, size);
        }

        Ok(outcome)
    }

    /// Rewrite the pushed entity to the server's key and version
    fn confirm(
        &mut self,
        target: &UpdateTarget,
        record: &FeedRecord,
    ) -> Result<Option<EntitySummary>> {
        let confirmation = Confirmation {
            key: record.key.clone(),
            etag: record.etag.clone(),
            timestamp: record.timestamp.clone(),
            revision: target.revision,
        };
        let confirmed = self
            .store
            .confirm(target.kind, &target.old_key, &confirmation)?;
        Ok(confirmed.map(|confirmed| {
            tracing::info!("Confirmed {} {} as {}", target.kind, target.old_key, record.key);
            EntitySummary::new(target.kind, &record.key, confirmed.dirty, Change::Confirmed)
        }))
    }

    /// A record for something deleted on this device, or owned by it
    fn deleted_locally(&self, record: &FeedRecord) -> Result<bool> {
        if self.store.deletion_pending(record.kind, &record.key)? {
            return Ok(true);
        }
        match (&record.kind, &record.parent_key) {
            (EntityKind::Attachment, Some(parent)) => {
                Ok(self.store.deletion_pending(EntityKind::Item, parent)?)
            }
            _ => Ok(false),
        }
    }

    /// Keys are enough to catch up an item whose children are already cached
    fn children_request(&self, item: &str, change: Change) -> Result<NewRequest> {
        if change == Change::Updated && !self.store.attachments_for_item(item)?.is_empty() {
            Ok(self.requests.fetch_child_keys(item))
        } else {
            Ok(self.requests.fetch_children(item))
        }
    }

    fn merge_item(&mut self, record: &FeedRecord) -> Result<Merged> {
        let Some(mut item) = self.store.item_by_key(&record.key)? else {
            let mut item = Item {
                local_id: None,
                key: record.key.clone(),
                item_type: record.item_type.clone().unwrap_or_default(),
                title: record.title.clone(),
                etag: record.etag.clone(),
                timestamp: record.timestamp.clone(),
                dirty: fresh_state(record),
                num_children: record.num_children,
                content: record.content.clone(),
            };
            self.store.save_item(&mut item)?;
            return Ok(Merged::changed(summary(EntityKind::Item, &item.key, item.dirty, Change::Created)));
        };

        if let Some(merged) = self.guard(EntityKind::Item, &item.key, item.dirty, &item.timestamp, record) {
            return Ok(merged);
        }

        item.item_type = record.item_type.clone().unwrap_or(item.item_type);
        if !record.title.is_empty() {
            item.title = record.title.clone();
        }
        item.etag = record.etag.clone();
        item.timestamp = record.timestamp.clone();
        item.num_children = record.num_children;
        match &record.content {
            Some(content) => {
                item.content = Some(content.clone());
                item.dirty = DirtyState::Clean;
            }
            None => item.dirty = stub_state(item.dirty),
        }
        self.store.save_item(&mut item)?;
        Ok(Merged::changed(summary(EntityKind::Item, &item.key, item.dirty, Change::Updated)))
    }

    fn merge_collection(&mut self, record: &FeedRecord) -> Result<Merged> {
        if let Some(parent) = &record.parent_key {
            self.ensure_collection(parent)?;
        }
        let name = collection_name(record);

        let Some(mut collection) = self.store.collection_by_key(&record.key)? else {
            // Members arrive with a separate listing
            let mut collection = Collection {
                local_id: None,
                key: record.key.clone(),
                name,
                parent_key: record.parent_key.clone(),
                size: 0,
                etag: record.etag.clone(),
                timestamp: record.timestamp.clone(),
                dirty: DirtyState::Missing,
                content: record.content.clone(),
            };
            self.store.save_collection(&mut collection)?;
            return Ok(Merged::changed(summary(
                EntityKind::Collection,
                &collection.key,
                collection.dirty,
                Change::Created,
            )));
        };

        if same_version(&collection.timestamp, &record.timestamp) {
            return Ok(Merged {
                summary: summary(EntityKind::Collection, &collection.key, collection.dirty, Change::Unchanged),
                current: true,
            });
        }
        if collection.dirty.has_local_changes() {
            return Ok(self.skip(EntityKind::Collection, &collection.key, collection.dirty));
        }

        collection.name = name;
        collection.parent_key = record.parent_key.clone();
        collection.etag = record.etag.clone();
        collection.timestamp = record.timestamp.clone();
        if record.content.is_some() {
            collection.content = record.content.clone();
        }
        collection.dirty = DirtyState::Stale;
        self.store.save_collection(&mut collection)?;
        Ok(Merged::changed(summary(
            EntityKind::Collection,
            &collection.key,
            collection.dirty,
            Change::Updated,
        )))
    }

    fn merge_attachment(&mut self, record: &FeedRecord) -> Result<Merged> {
        if let Some(parent) = &record.parent_key {
            if !self.store.contains(EntityKind::Item, parent)? {
                tracing::debug!("Attachment {} references unknown item {}", record.key, parent);
                self.store.save_item(&mut Item::missing(parent.clone()))?;
            }
        }

        let Some(mut attachment) = self.store.attachment_by_key(&record.key)? else {
            let mut attachment = Attachment {
                local_id: None,
                key: record.key.clone(),
                parent_key: record.parent_key.clone(),
                title: record.title.clone(),
                url: record.enclosure.clone(),
                status: record.attachment_status(),
                etag: record.etag.clone(),
                timestamp: record.timestamp.clone(),
                dirty: fresh_state(record),
                content: record.content.clone(),
            };
            self.store.save_attachment(&mut attachment)?;
            return Ok(Merged::changed(summary(
                EntityKind::Attachment,
                &attachment.key,
                attachment.dirty,
                Change::Created,
            )));
        };

        if let Some(merged) = self.guard(
            EntityKind::Attachment,
            &attachment.key,
            attachment.dirty,
            &attachment.timestamp,
            record,
        ) {
            return Ok(merged);
        }

        if record.parent_key.is_some() {
            attachment.parent_key = record.parent_key.clone();
        }
        if !record.title.is_empty() {
            attachment.title = record.title.clone();
        }
        if record.enclosure.is_some() {
            attachment.url = record.enclosure.clone();
        }
        if attachment.status == AttachmentStatus::Unknown {
            attachment.status = record.attachment_status();
        }
        attachment.etag = record.etag.clone();
        attachment.timestamp = record.timestamp.clone();
        match &record.content {
            Some(content) => {
                attachment.content = Some(content.clone());
                attachment.dirty = DirtyState::Clean;
            }
            None => attachment.dirty = stub_state(attachment.dirty),
        }
        self.store.save_attachment(&mut attachment)?;
        Ok(Merged::changed(summary(
            EntityKind::Attachment,
            &attachment.key,
            attachment.dirty,
            Change::Updated,
        )))
    }

    /// Short-circuits shared by items and attachments
    ///
    /// `None` means the record should be merged.
    fn guard(
        &self,
        kind: EntityKind,
        key: &str,
        dirty: DirtyState,
        timestamp: &Option<String>,
        record: &FeedRecord,
    ) -> Option<Merged> {
        use DirtyState::*;

        let same = same_version(timestamp, &record.timestamp);
        match dirty {
            Clean | Dirty | New if same => Some(Merged {
                summary: summary(kind, key, dirty, Change::Unchanged),
                current: true,
            }),
            Dirty | New => Some(self.skip(kind, key, dirty)),
            // A stub cannot improve on a stub of the same version
            Stale | Missing if same && record.content.is_none() => Some(Merged::changed(
                summary(kind, key, dirty, Change::Unchanged),
            )),
            _ => None,
        }
    }

    fn skip(&self, kind: EntityKind, key: &str, dirty: DirtyState) -> Merged {
        tracing::warn!("Keeping local {} {} ({}), server copy changed", kind, key, dirty);
        Merged::changed(summary(kind, key, dirty, Change::Skipped))
    }

    /// Cache a `MISSING` stub for a referenced collection
    ///
    /// Collections deleted on this device are not stubbed again.
    pub(crate) fn ensure_collection(&mut self, key: &str) -> Result<()> {
        if !self.store.contains(EntityKind::Collection, key)?
            && !self.store.deletion_pending(EntityKind::Collection, key)?
        {
            tracing::debug!("Stubbing unknown collection {}", key);
            self.store.save_collection(&mut Collection::missing(key))?;
        }
        Ok(())
    }

    /// A fully listed collection is current unless edited locally
    pub(crate) fn mark_listing_complete(&mut self, key: &str) -> Result<()> {
        let Some(mut collection) = self.store.collection_by_key(key)? else {
            return Ok(());
        };
        if collection.dirty.has_local_changes() {
            return Ok(());
        }
        if collection.content.is_none() {
            // Metadata still has to be fetched
            return Ok(());
        }
        if collection.dirty != DirtyState::Clean {
            collection.dirty = DirtyState::Clean;
            self.store.save_collection(&mut collection)?;
            tracing::debug!("Collection {} is current", key);
        }
        Ok(())
    }

    /// Write a follow-up request unless an identical one is waiting
    pub(crate) fn queue(&mut self, request: &NewRequest) -> Result<usize> {
        Ok(self.store.enqueue_unique(request)?.map_or(0, |_| 1))
    }
}

fn summary(
    kind: EntityKind,
    key: &str,
    dirty: DirtyState,
    change: Change,
) -> EntitySummary {
    EntitySummary::new(kind, key, dirty, change)
}

fn same_version(local: &Option<String>, remote: &Option<String>) -> bool {
    matches!((local, remote), (Some(a), Some(b)) if a == b)
}

/// State of a record seen for the first time
fn fresh_state(record: &FeedRecord) -> DirtyState {
    if record.content.is_some() {
        DirtyState::Clean
    } else {
        DirtyState::Missing
    }
}

/// State after a newer stub replaced the metadata
fn stub_state(current: DirtyState) -> DirtyState {
    match current {
        DirtyState::Missing => DirtyState::Missing,
        _ => DirtyState::Stale,
    }
}

fn collection_name(record: &FeedRecord) -> String {
    record
        .content
        .as_ref()
        .and_then(|c| c.get("name"))
        .and_then(|n| n.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| record.title.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(key: &str, updated: &str, title: &str) -> serde_json::Value {
        json!({
            "title": title,
            "key": key,
            "updated": updated,
            "itemType": "book",
            "etag": format!("etag-{}", updated),
            "content": {"title": title},
            "links": []
        })
    }

    fn page(entries: Vec<serde_json::Value>, next: Option<&str>) -> FeedPage {
        let mut links = vec![];
        if let Some(next) = next {
            links.push(json!({"rel": "next", "href": next}));
        }
        let body = json!({"links": links, "entries": entries}).to_string();
        FeedPage::parse(&body, Disposition::Feed, None).unwrap()
    }

    fn apply(store: &mut Store, page: &FeedPage, context: &ReconcileContext) -> ReconcileOutcome {
        let options = SyncOptions::default();
        let requests = RequestFactory::new(&options);
        FeedReconciler::new(store, &options, &requests)
            .apply_page(page, context)
            .unwrap()
    }

    fn top_items() -> ReconcileContext {
        ReconcileContext::new(RequestKind::FetchItems, Disposition::Feed)
    }

    #[test]
    fn test_new_records_insert_clean() {
        let mut store = Store::open_in_memory().unwrap();
        let outcome = apply(
            &mut store,
            &page(vec![entry("ITEM0001", "t1", "Dune")], None),
            &top_items(),
        );
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.entities.len(), 1);

        let item = store.item_by_key("ITEM0001").unwrap().unwrap();
        assert_eq!(item.dirty, DirtyState::Clean);
        assert_eq!(item.item_type, "book");
        assert_eq!(item.etag.as_deref(), Some("etag-t1"));
    }

    #[test]
    fn test_unchanged_entry_stops_pagination() {
        let mut store = Store::open_in_memory().unwrap();
        apply(&mut store, &page(vec![entry("ITEM0001", "t1", "Dune")], None), &top_items());

        let outcome = apply(
            &mut store,
            &page(
                vec![entry("ITEM0001", "t1", "Dune")],
                Some("https://api.example.org/users/1/items?start=1"),
            ),
            &top_items(),
        );
        assert_eq!(outcome.unchanged, 1);
        assert!(outcome.stopped_pagination);
        assert_eq!(outcome.queued, 0);
        assert_eq!(store.ledger_counts().unwrap().new, 0);
    }

    #[test]
    fn test_changed_page_queues_continuation() {
        let mut store = Store::open_in_memory().unwrap();
        let outcome = apply(
            &mut store,
            &page(
                vec![entry("ITEM0001", "t1", "Dune")],
                Some("https://api.example.org/users/1/items?start=1"),
            ),
            &top_items(),
        );
        assert!(!outcome.stopped_pagination);
        assert_eq!(outcome.queued, 1);

        let queued = store.claim_next().unwrap().unwrap();
        assert_eq!(queued.kind, RequestKind::FetchItems);
        assert_eq!(queued.path, "https://api.example.org/users/1/items?start=1");
    }

    #[test]
    fn test_dirty_item_is_not_overwritten() {
        let mut store = Store::open_in_memory().unwrap();
        apply(&mut store, &page(vec![entry("ITEM0001", "t1", "Dune")], None), &top_items());
        store
            .update_item_content("ITEM0001", "Dune (local)", json!({"title": "Dune (local)"}))
            .unwrap();

        let outcome = apply(
            &mut store,
            &page(vec![entry("ITEM0001", "t2", "Dune (server)")], None),
            &top_items(),
        );
        assert_eq!(outcome.skipped, 1);

        let item = store.item_by_key("ITEM0001").unwrap().unwrap();
        assert_eq!(item.dirty, DirtyState::Dirty);
        assert_eq!(item.title, "Dune (local)");
        assert_eq!(item.timestamp.as_deref(), Some("t1"));
    }

    #[test]
    fn test_stub_change_marks_stale() {
        let mut store = Store::open_in_memory().unwrap();
        apply(&mut store, &page(vec![entry("ITEM0001", "t1", "Dune")], None), &top_items());

        let mut stub = entry("ITEM0001", "t2", "Dune");
        stub["content"] = serde_json::Value::Null;
        apply(&mut store, &page(vec![stub], None), &top_items());

        let item = store.item_by_key("ITEM0001").unwrap().unwrap();
        assert_eq!(item.dirty, DirtyState::Stale);
        assert_eq!(item.timestamp.as_deref(), Some("t2"));
        assert_eq!(item.content, Some(json!({"title": "Dune"})));
    }

    #[test]
    fn test_stale_item_refreshed_by_same_version_record() {
        let mut store = Store::open_in_memory().unwrap();
        let mut stub = entry("ITEM0001", "t2", "Dune");
        stub["content"] = serde_json::Value::Null;
        apply(&mut store, &page(vec![stub], None), &top_items());
        assert_eq!(
            store.item_by_key("ITEM0001").unwrap().unwrap().dirty,
            DirtyState::Missing
        );

        let outcome = apply(
            &mut store,
            &page(vec![entry("ITEM0001", "t2", "Dune")], None),
            &top_items(),
        );
        assert_eq!(outcome.updated, 1);
        assert!(!outcome.stopped_pagination);
        assert_eq!(
            store.item_by_key("ITEM0001").unwrap().unwrap().dirty,
            DirtyState::Clean
        );
    }

    #[test]
    fn test_children_fetch_queued_once() {
        let mut store = Store::open_in_memory().unwrap();
        let mut parent = entry("ITEM0001", "t1", "Dune");
        parent["numChildren"] = json!(2);

        let outcome = apply(&mut store, &page(vec![parent.clone()], None), &top_items());
        assert_eq!(outcome.queued, 1);

        parent["updated"] = json!("t2");
        let outcome = apply(&mut store, &page(vec![parent], None), &top_items());
        assert_eq!(outcome.queued, 0, "identical request already waiting");

        let queued = store.claim_next().unwrap().unwrap();
        assert_eq!(queued.kind, RequestKind::FetchChildren);
        assert_eq!(queued.subject_key.as_deref(), Some("ITEM0001"));
    }

    #[test]
    fn test_whole_page_policy_needs_every_entry_current() {
        let mut store = Store::open_in_memory().unwrap();
        apply(&mut store, &page(vec![entry("ITEM0001", "t1", "A")], None), &top_items());

        let options = SyncOptions {
            stop_policy: StopPolicy::WholePage,
            ..SyncOptions::default()
        };
        let requests = RequestFactory::new(&options);
        let mixed = page(
            vec![entry("ITEM0001", "t1", "A"), entry("ITEM0002", "t1", "B")],
            Some("https://api.example.org/users/1/items?start=2"),
        );
        let outcome = FeedReconciler::new(&mut store, &options, &requests)
            .apply_page(&mixed, &top_items())
            .unwrap();
        assert!(!outcome.stopped_pagination);
        assert_eq!(outcome.queued, 1);
    }

    #[test]
    fn test_collection_records_arrive_missing_then_stale() {
        let mut store = Store::open_in_memory().unwrap();
        let context = ReconcileContext::new(RequestKind::FetchCollections, Disposition::Feed);
        let collection = |updated: &str| {
            json!({
                "title": "Reading", "key": "COLL0001", "updated": updated,
                "content": {"name": "Reading", "parentCollection": "COLL0000"}, "links": []
            })
        };

        apply(&mut store, &page(vec![collection("t1")], None), &context);
        let cached = store.collection_by_key("COLL0001").unwrap().unwrap();
        assert_eq!(cached.dirty, DirtyState::Missing);
        assert_eq!(cached.parent_key.as_deref(), Some("COLL0000"));
        assert_eq!(
            store.collection_by_key("COLL0000").unwrap().unwrap().dirty,
            DirtyState::Missing
        );

        apply(&mut store, &page(vec![collection("t2")], None), &context);
        assert_eq!(
            store.collection_by_key("COLL0001").unwrap().unwrap().dirty,
            DirtyState::Stale
        );
    }

    #[test]
    fn test_attachment_status_preserved() {
        let mut store = Store::open_in_memory().unwrap();
        let attachment = |updated: &str| {
            json!({
                "title": "paper.pdf", "key": "ATT00001", "updated": updated, "itemType": "attachment",
                "content": {"linkMode": "imported_file", "parentItem": "ITEM0001"}, "links": []
            })
        };
        apply(&mut store, &page(vec![attachment("t1")], None), &top_items());
        let cached = store.attachment_by_key("ATT00001").unwrap().unwrap();
        assert_eq!(cached.status, AttachmentStatus::Available);
        assert_eq!(
            store.item_by_key("ITEM0001").unwrap().unwrap().dirty,
            DirtyState::Missing
        );

        store
            .set_attachment_status("ATT00001", AttachmentStatus::Local)
            .unwrap();
        apply(&mut store, &page(vec![attachment("t2")], None), &top_items());
        let cached = store.attachment_by_key("ATT00001").unwrap().unwrap();
        assert_eq!(cached.status, AttachmentStatus::Local);
        assert_eq!(cached.timestamp.as_deref(), Some("t2"));
    }

    #[test]
    fn test_unknown_update_target_is_skipped() {
        let mut store = Store::open_in_memory().unwrap();
        let context = ReconcileContext::new(RequestKind::Create, Disposition::Feed)
            .with_update_target(UpdateTarget::new("local-gone", EntityKind::Item));
        let outcome = apply(
            &mut store,
            &page(vec![entry("ITEM0001", "t1", "Dune")], None),
            &context,
        );
        assert_eq!(outcome.skipped, 1);
        assert!(outcome.entities.is_empty());
        assert!(store.item_by_key("ITEM0001").unwrap().is_none());
    }

    #[test]
    fn test_listing_does_not_restore_locally_deleted_item() {
        let mut store = Store::open_in_memory().unwrap();
        apply(&mut store, &page(vec![entry("A0000001", "t1", "Dune")], None), &top_items());
        store.delete_item("A0000001").unwrap();

        let outcome = apply(
            &mut store,
            &page(vec![entry("A0000001", "t2", "Dune"), entry("A0000002", "t2", "Emma")], None),
            &top_items(),
        );
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.inserted, 1);
        assert!(store.item_by_key("A0000001").unwrap().is_none());
        assert_eq!(store.tombstones().unwrap().len(), 1);
    }

    #[test]
    fn test_attachment_of_deleted_item_is_not_restored() {
        let mut store = Store::open_in_memory().unwrap();
        apply(&mut store, &page(vec![entry("ITEM0001", "t1", "Dune")], None), &top_items());
        store.delete_item("ITEM0001").unwrap();

        let attachment = json!({
            "title": "paper.pdf", "key": "ATT00001", "updated": "t1", "itemType": "attachment",
            "content": {"parentItem": "ITEM0001"}, "links": []
        });
        let outcome = apply(&mut store, &page(vec![attachment], None), &top_items());
        assert_eq!(outcome.skipped, 1);
        assert!(store.attachment_by_key("ATT00001").unwrap().is_none());
        assert!(store.item_by_key("ITEM0001").unwrap().is_none(), "no parent stub");
    }

    #[test]
    fn test_updated_item_with_cached_children_fetches_child_keys() {
        let mut store = Store::open_in_memory().unwrap();
        let mut parent = entry("ITEM0001", "t1", "Dune");
        parent["numChildren"] = json!(1);
        let attachment = json!({
            "title": "paper.pdf", "key": "ATT00001", "updated": "t1", "itemType": "attachment",
            "content": {"parentItem": "ITEM0001"}, "links": []
        });
        apply(&mut store, &page(vec![parent.clone(), attachment], None), &top_items());
        let first = store.claim_next().unwrap().unwrap();
        assert_eq!(first.kind, RequestKind::FetchChildren, "new item lists its children");
        store.mark_done(&first.uuid, Some(200)).unwrap();

        parent["updated"] = json!("t2");
        parent["numChildren"] = json!(2);
        let outcome = apply(&mut store, &page(vec![parent], None), &top_items());
        assert_eq!(outcome.queued, 1);

        let queued = store.claim_next().unwrap().unwrap();
        assert_eq!(queued.kind, RequestKind::FetchChildKeys);
        assert_eq!(queued.disposition, Disposition::Keys);
        assert_eq!(queued.path, "/items/ITEM0001/children?format=keys");
    }
}
