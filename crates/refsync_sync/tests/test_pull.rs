use refsync_store::{
    Collection, DirtyState, Disposition, HttpMethod, Item, RequestKind, RequestStatus, Store,
};
use refsync_sync::{
    FeedPage, FeedReconciler, ReconcileContext, RequestFactory, SyncEngine, SyncError,
    SyncOptions, SyncScope, TransportResponse, Update,
};
use refsync_test_helpers::prelude::*;
use serde_json::json;
use tokio::sync::mpsc;

const T1: &str = "2024-01-01T00:00:00Z";
const T2: &str = "2024-03-01T00:00:00Z";

fn clean_item(store: &mut Store, key: &str, timestamp: &str) {
    let mut item = Item {
        local_id: None,
        key: key.to_string(),
        item_type: "book".to_string(),
        title: key.to_string(),
        etag: Some(format!("etag-{}", key)),
        timestamp: Some(timestamp.to_string()),
        dirty: DirtyState::Clean,
        num_children: 0,
        content: Some(json!({"title": "local copy"})),
    };
    store.save_item(&mut item).unwrap();
}

fn collection(store: &mut Store, key: &str, dirty: DirtyState) {
    let mut collection = Collection {
        local_id: None,
        key: key.to_string(),
        name: "Reading".to_string(),
        parent_key: None,
        size: 0,
        etag: Some("v1".to_string()),
        timestamp: Some(T1.to_string()),
        dirty,
        content: Some(json!({"name": "Reading"})),
    };
    store.save_collection(&mut collection).unwrap();
}

fn page_two(collection: &str) -> String {
    format!("{}/collections/{}/items?start=3", API_BASE, collection)
}

#[tokio::test]
async fn test_collection_listing_stops_at_cached_entry() {
    suppress_logs();
    let mut store = Store::open_in_memory().unwrap();
    collection(&mut store, "COLL0001", DirtyState::Clean);
    clean_item(&mut store, "X0000001", T1);

    let listing = FeedBuilder::collection_items("COLL0001")
        .entry(EntryBuilder::item("A0000001", T2))
        .entry(EntryBuilder::item("B0000001", T2))
        .entry(EntryBuilder::item("X0000001", T1).content(json!({"title": "server copy"})))
        .next(&page_two("COLL0001"))
        .body();
    let transport = ScriptedTransport::new()
        .get("/collections/COLL0001/items", listing)
        .get(&page_two("COLL0001"), FeedBuilder::new().body());

    let engine = SyncEngine::new(shared(store), transport, SyncOptions::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    let summary = engine
        .sync(&SyncScope::Collection("COLL0001".to_string()), &tx)
        .await
        .unwrap();

    assert_eq!(summary.requests_done, 1);
    assert_eq!(summary.requests_pending, 0);
    assert_eq!(engine.transport().requests().len(), 1, "page two is never requested");

    let store = engine.store();
    let store = store.lock().await;
    let coll = store.collection_by_key("COLL0001").unwrap().unwrap();
    assert_eq!(coll.size, 3);
    assert_eq!(coll.dirty, DirtyState::Clean);
    assert_eq!(
        store.member_keys("COLL0001").unwrap(),
        vec!["X0000001", "A0000001", "B0000001"]
    );

    let cached = store.item_by_key("X0000001").unwrap().unwrap();
    assert_eq!(cached.content, Some(json!({"title": "local copy"})));
    assert_eq!(
        store.item_by_key("A0000001").unwrap().unwrap().dirty,
        DirtyState::Clean
    );
}

#[tokio::test]
async fn test_listing_follows_next_until_cached_page() {
    suppress_logs();
    let mut store = Store::open_in_memory().unwrap();
    collection(&mut store, "COLL0001", DirtyState::Clean);

    let first = FeedBuilder::collection_items("COLL0001")
        .entry(EntryBuilder::item("A0000001", T2))
        .next(&page_two("COLL0001"))
        .body();
    let second = FeedBuilder::collection_items("COLL0001")
        .entry(EntryBuilder::item("B0000001", T1))
        .body();
    let transport = ScriptedTransport::new()
        .get("/collections/COLL0001/items", first)
        .get(&page_two("COLL0001"), second);

    let engine = SyncEngine::new(shared(store), transport, SyncOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let summary = engine
        .sync(&SyncScope::Collection("COLL0001".to_string()), &tx)
        .await
        .unwrap();

    assert_eq!(summary.requests_done, 2);
    assert_eq!(summary.requests_queued, 1);
    let sent = engine.transport().requests();
    assert_eq!(sent[1].path, page_two("COLL0001"));

    let mut queued_more = false;
    while let Ok(update) = rx.try_recv() {
        if matches!(update, Ok(Update::QueuedMore(1))) {
            queued_more = true;
        }
    }
    assert!(queued_more);
    assert_eq!(
        engine.store().lock().await.member_keys("COLL0001").unwrap().len(),
        2
    );
}

#[test]
fn test_same_page_twice_changes_nothing() {
    let mut store = Store::open_in_memory().unwrap();
    let options = SyncOptions::default();
    let requests = RequestFactory::new(&options);
    let body = FeedBuilder::new()
        .self_link(&format!("{}/items/top", API_BASE))
        .entry(EntryBuilder::item("A0000001", T2).num_children(1))
        .entry(EntryBuilder::collection("COLL0001", T2))
        .entry(EntryBuilder::attachment("ATT00001", "A0000001", T2).enclosure("https://files.example.org/a"))
        .body();
    let page = FeedPage::parse(&body, Disposition::Feed, None).unwrap();
    let context = ReconcileContext::new(RequestKind::FetchItems, Disposition::Feed);

    let first = FeedReconciler::new(&mut store, &options, &requests)
        .apply_page(&page, &context)
        .unwrap();
    assert_eq!(first.inserted, 3);
    assert_eq!(first.queued, 1, "children of the new item");
    let stats = store.stats().unwrap();
    let ledger = store.ledger_counts().unwrap();

    let second = FeedReconciler::new(&mut store, &options, &requests)
        .apply_page(&page, &context)
        .unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.unchanged, 3);
    assert_eq!(second.queued, 0);
    assert_eq!(store.stats().unwrap(), stats);
    assert_eq!(store.ledger_counts().unwrap(), ledger);
}

#[test]
fn test_server_change_never_overwrites_local_edit() {
    let mut store = Store::open_in_memory().unwrap();
    clean_item(&mut store, "A0000001", T1);
    store
        .update_item_content("A0000001", "Edited", json!({"title": "Edited"}))
        .unwrap();

    let options = SyncOptions::default();
    let requests = RequestFactory::new(&options);
    let body = FeedBuilder::new()
        .entry(EntryBuilder::item("A0000001", T2).content(json!({"title": "Remote"})))
        .body();
    let page = FeedPage::parse(&body, Disposition::Feed, None).unwrap();
    let context = ReconcileContext::new(RequestKind::FetchItems, Disposition::Feed);

    let outcome = FeedReconciler::new(&mut store, &options, &requests)
        .apply_page(&page, &context)
        .unwrap();
    assert_eq!(outcome.skipped, 1);

    let item = store.item_by_key("A0000001").unwrap().unwrap();
    assert_eq!(item.dirty, DirtyState::Dirty);
    assert_eq!(item.content, Some(json!({"title": "Edited"})));
    assert_eq!(item.timestamp.as_deref(), Some(T1));
}

#[tokio::test]
async fn test_stale_collection_fetches_few_missing_keys() {
    suppress_logs();
    let mut store = Store::open_in_memory().unwrap();
    collection(&mut store, "COLL0001", DirtyState::Stale);
    for key in ["A0000001", "A0000002", "A0000003"] {
        clean_item(&mut store, key, T1);
    }

    let transport = ScriptedTransport::new()
        .get("/collections", FeedBuilder::new().body())
        .get("/items/top", FeedBuilder::new().body())
        .get(
            "/collections/COLL0001/items?format=keys",
            keys_body(&["A0000001", "A0000002", "A0000003", "B0000001"]),
        )
        .get("/items/B0000001", EntryBuilder::item("B0000001", T2).body());

    let engine = SyncEngine::new(shared(store), transport, SyncOptions::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    let summary = engine.sync(&SyncScope::Everything, &tx).await.unwrap();
    assert_eq!(summary.requests_failed, 0);
    assert_eq!(engine.transport().count(HttpMethod::Get, "/items/B0000001"), 1);

    let store = engine.store();
    let store = store.lock().await;
    let coll = store.collection_by_key("COLL0001").unwrap().unwrap();
    assert_eq!(coll.size, 4);
    assert!(store.is_member("B0000001", "COLL0001").unwrap());
}

#[tokio::test]
async fn test_stale_collection_refetched_when_mostly_unknown() {
    suppress_logs();
    let mut store = Store::open_in_memory().unwrap();
    collection(&mut store, "COLL0001", DirtyState::Stale);
    clean_item(&mut store, "A0000001", T1);

    let listing = FeedBuilder::collection_items("COLL0001")
        .entry(EntryBuilder::item("B0000001", T2))
        .entry(EntryBuilder::item("B0000002", T2))
        .entry(EntryBuilder::item("A0000001", T1))
        .body();
    let transport = ScriptedTransport::new()
        .get("/collections", FeedBuilder::new().body())
        .get("/items/top", FeedBuilder::new().body())
        .get(
            "/collections/COLL0001/items?format=keys",
            keys_body(&["B0000001", "B0000002", "A0000001"]),
        )
        .get("/collections/COLL0001/items", listing);

    let engine = SyncEngine::new(shared(store), transport, SyncOptions::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    engine.sync(&SyncScope::Everything, &tx).await.unwrap();

    let listings = engine
        .transport()
        .requests()
        .iter()
        .filter(|r| r.path.starts_with("/collections/COLL0001/items?format=json"))
        .count();
    assert_eq!(listings, 1);

    let store = engine.store();
    let store = store.lock().await;
    let coll = store.collection_by_key("COLL0001").unwrap().unwrap();
    assert_eq!(coll.size, 3);
    assert_eq!(coll.dirty, DirtyState::Clean);
}

#[tokio::test]
async fn test_transport_failure_leaves_error_entry() {
    suppress_logs();
    let store = Store::open_in_memory().unwrap();
    let transport = ScriptedTransport::new()
        .get("/collections", FeedBuilder::new().body())
        .fail(
            HttpMethod::Get,
            "/items/top",
            SyncError::transport_retryable("connection refused"),
        );

    let engine = SyncEngine::new(shared(store), transport, SyncOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let summary = engine.sync(&SyncScope::Everything, &tx).await.unwrap();
    assert_eq!(summary.requests_done, 1);
    assert_eq!(summary.requests_failed, 1);
    assert!(!summary.is_clean());

    let mut failures = Vec::new();
    while let Ok(update) = rx.try_recv() {
        if let Err(failure) = update {
            failures.push(failure);
        }
    }
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, RequestKind::FetchItems);
    assert!(failures[0].error.is_retryable());

    let store = engine.store();
    let mut store = store.lock().await;
    let errors = store.ledger_entries(Some(RequestStatus::Error)).unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("connection refused"));
    assert_eq!(errors[0].attempts, 1);

    assert_eq!(store.requeue_failed(5).unwrap(), 1);
    assert_eq!(store.ledger_counts().unwrap().new, 1);
}

#[tokio::test]
async fn test_cancelled_run_leaves_requests_queued() {
    suppress_logs();
    let store = Store::open_in_memory().unwrap();
    let engine = SyncEngine::new(shared(store), ScriptedTransport::new(), SyncOptions::default());

    let queued = engine.prepare(&SyncScope::Everything).await.unwrap();
    assert_eq!(queued, 2);
    engine.cancel_handle().cancel();

    let (tx, _rx) = mpsc::unbounded_channel();
    let summary = engine.run(&tx).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.requests_pending, 2);
    assert!(engine.transport().requests().is_empty());
}

#[tokio::test]
async fn test_dropped_receiver_stops_run() {
    suppress_logs();
    let store = Store::open_in_memory().unwrap();
    let engine = SyncEngine::new(shared(store), ScriptedTransport::new(), SyncOptions::default());
    engine.prepare(&SyncScope::Everything).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    let summary = engine.run(&tx).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.requests_done, 0);
}

#[tokio::test]
async fn test_listing_after_failed_delete_keeps_item_deleted() {
    suppress_logs();
    let mut store = Store::open_in_memory().unwrap();
    collection(&mut store, "COLL0001", DirtyState::Clean);
    clean_item(&mut store, "A0000001", T1);
    store.delete_item("A0000001").unwrap();

    let listing = FeedBuilder::collection_items("COLL0001")
        .entry(EntryBuilder::item("A0000001", T2))
        .entry(EntryBuilder::item("B0000001", T2))
        .body();
    let transport = ScriptedTransport::new()
        .respond(
            HttpMethod::Delete,
            "/items/A0000001",
            TransportResponse::new(503, "Service Unavailable"),
        )
        .get("/collections/COLL0001/items", listing);

    let engine = SyncEngine::new(shared(store), transport, SyncOptions::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    let summary = engine
        .sync(&SyncScope::Collection("COLL0001".to_string()), &tx)
        .await
        .unwrap();
    assert_eq!(summary.requests_failed, 1);
    assert_eq!(summary.requests_done, 1);

    let store = engine.store();
    let store = store.lock().await;
    assert!(store.item_by_key("A0000001").unwrap().is_none());
    assert!(!store.is_member("A0000001", "COLL0001").unwrap());
    assert!(store.item_by_key("B0000001").unwrap().is_some());

    let failed = store.ledger_entries(Some(RequestStatus::Error)).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].kind, RequestKind::Delete);
    assert!(store.deletion_pending(refsync_store::EntityKind::Item, "A0000001").unwrap());
}
