//! Sync engine orchestration

use crate::config::SyncOptions;
use crate::events::{BatchSummary, Change, EntitySummary, SyncFailure, SyncUpdate, Update};
use crate::feed::{parse_keys, FeedPage};
use crate::reconciler::{FeedReconciler, ReconcileContext, ReconcileOutcome};
use crate::requests::RequestFactory;
use crate::transport::{OutboundRequest, Transport, TransportResponse};
use crate::{Result, SyncError, HTTP_PRECONDITION_FAILED};
use refsync_common::sanitizer::LogSanitizer;
use refsync_store::{
    Confirmation, DirtyQueue, DirtyState, Disposition, HttpMethod, LedgerEntry, Store,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const HTTP_NOT_FOUND: u16 = 404;

/// What a sync pulls from the server besides pushing local changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    /// All collections and all top-level items
    Everything,
    /// Members of one collection
    Collection(String),
    /// Local changes only
    PushOnly,
}

/// Stops a running sync after the request in flight
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Status code and result of executing one ledger entry
struct Attempt {
    http_status: Option<u16>,
    result: Result<ReconcileOutcome>,
}

/// Main sync engine
///
/// Drains the request ledger one entry at a time. The store is shared with
/// local editors through the mutex, which is never held across a network call.
pub struct SyncEngine<T: Transport> {
    store: Arc<Mutex<Store>>,
    transport: T,
    options: SyncOptions,
    requests: RequestFactory,
    cancel: CancelHandle,
    sanitizer: LogSanitizer,
}

impl<T: Transport> SyncEngine<T> {
    pub fn new(store: Arc<Mutex<Store>>, transport: T, options: SyncOptions) -> Self {
        let requests = RequestFactory::new(&options);
        Self {
            store,
            transport,
            options,
            requests,
            cancel: CancelHandle::default(),
            sanitizer: LogSanitizer::new(),
        }
    }

    pub fn store(&self) -> Arc<Mutex<Store>> {
        Arc::clone(&self.store)
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn requests(&self) -> &RequestFactory {
        &self.requests
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Queue everything one sync batch needs
    ///
    /// Returns the number of ledger entries written.
    pub async fn prepare(&self, scope: &SyncScope) -> Result<usize> {
        self.options.validate()?;
        let mut store = self.store.lock().await;
        store.set_default_credential(self.options.credential.clone());

        store.recover_interrupted()?;
        store.prune_done()?;
        store.requeue_failed(self.options.max_attempts)?;

        let deletes = store.take_tombstones(|tombstone| self.requests.delete(tombstone))?;
        let mut queued = deletes.len();

        let dirty = DirtyQueue::snapshot(&store)?;
        for entry in dirty.entries() {
            if *scope == SyncScope::PushOnly && !entry.dirty().has_local_changes() {
                continue;
            }
            for request in self.requests.for_dirty(&entry) {
                if store.enqueue_push(&request)?.is_some() {
                    queued += 1;
                }
            }
        }

        let pulls = match scope {
            SyncScope::Everything => vec![
                self.requests.fetch_collections(),
                self.requests.fetch_top_items(),
            ],
            SyncScope::Collection(key) => vec![self.requests.fetch_collection_items(key)],
            SyncScope::PushOnly => Vec::new(),
        };
        for request in pulls {
            if store.enqueue_unique(&request)?.is_some() {
                queued += 1;
            }
        }

        tracing::info!(
            "Prepared sync: {} requests queued ({} deletions, {} local changes)",
            queued,
            deletes.len(),
            dirty.count_in(DirtyState::New) + dirty.count_in(DirtyState::Dirty)
        );
        Ok(queued)
    }

    /// Drain the ledger, reporting progress on `events`
    ///
    /// Stops when the ledger has no runnable entry, on cancellation, or when
    /// the receiver is dropped. A local storage failure aborts the run.
    pub async fn run(&self, events: &mpsc::UnboundedSender<SyncUpdate>) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();

        loop {
            if self.cancel.is_cancelled() || events.is_closed() {
                tracing::info!("Sync cancelled, remaining requests stay queued");
                summary.cancelled = true;
                break;
            }

            let entry = self.store.lock().await.claim_next()?;
            let Some(entry) = entry else {
                break;
            };
            let descriptor = self.sanitizer.sanitize(&entry.describe());
            tracing::debug!("Executing {} (attempt {})", descriptor, entry.attempts);

            let attempt = self.attempt(&entry).await;
            match attempt.result {
                Ok(outcome) => {
                    self.store
                        .lock()
                        .await
                        .mark_done(&entry.uuid, attempt.http_status)?;
                    summary.requests_done += 1;
                    summary.entities_updated += outcome.entities.len();
                    summary.requests_queued += outcome.queued;

                    // A closed receiver is picked up at the top of the loop
                    for entity in outcome.entities {
                        let _ = events.send(Ok(Update::EntityUpdated(entity)));
                    }
                    if outcome.queued > 0 {
                        let _ = events.send(Ok(Update::QueuedMore(outcome.queued)));
                    }
                }
                Err(error) => {
                    let http_status = error.http_status().or(attempt.http_status);
                    let message = self.sanitizer.sanitize(&error.to_string());

                    if error.is_fatal() {
                        tracing::error!("{} aborted the sync: {}", descriptor, message);
                        let recorded = self
                            .store
                            .lock()
                            .await
                            .mark_error(&entry.uuid, http_status, &message);
                        if let Err(mark) = recorded {
                            tracing::error!("Could not record failure of {}: {}", descriptor, mark);
                        }
                        return Err(error);
                    }

                    if matches!(error, SyncError::Conflict { .. }) {
                        tracing::warn!("{}: {}", descriptor, message);
                    } else {
                        tracing::error!("{} failed: {}", descriptor, message);
                    }
                    self.store
                        .lock()
                        .await
                        .mark_error(&entry.uuid, http_status, &message)?;
                    summary.requests_failed += 1;
                    let _ = events.send(Err(SyncFailure {
                        request: descriptor,
                        kind: entry.kind,
                        ledger_uuid: entry.uuid.clone(),
                        http_status,
                        error,
                    }));
                }
            }
        }

        summary.requests_pending = self.store.lock().await.ledger_counts()?.new;
        tracing::info!(
            "Sync batch complete: {} done, {} failed, {} pending",
            summary.requests_done,
            summary.requests_failed,
            summary.requests_pending
        );
        let _ = events.send(Ok(Update::BatchComplete(summary.clone())));
        Ok(summary)
    }

    /// `prepare` followed by `run`
    pub async fn sync(
        &self,
        scope: &SyncScope,
        events: &mpsc::UnboundedSender<SyncUpdate>,
    ) -> Result<BatchSummary> {
        self.cancel.reset();
        self.prepare(scope).await?;
        self.run(events).await
    }

    async fn attempt(&self, entry: &LedgerEntry) -> Attempt {
        let request = OutboundRequest::from(entry);
        match self.transport.execute(&request).await {
            Ok(response) => Attempt {
                http_status: Some(response.status),
                result: self.handle_response(entry, response).await,
            },
            Err(error) => Attempt {
                http_status: None,
                result: Err(error),
            },
        }
    }

    async fn handle_response(
        &self,
        entry: &LedgerEntry,
        response: TransportResponse,
    ) -> Result<ReconcileOutcome> {
        if response.status == HTTP_PRECONDITION_FAILED {
            return Err(SyncError::Conflict {
                request: entry.describe(),
            });
        }
        if response.status == HTTP_NOT_FOUND && entry.method == HttpMethod::Delete {
            tracing::debug!("{} was already gone on the server", entry.describe());
            return Ok(ReconcileOutcome::default());
        }
        if !response.is_success() {
            return Err(SyncError::Http {
                status: response.status,
                message: response.body.chars().take(200).collect(),
            });
        }

        let context = ReconcileContext::from(entry);
        let mut store = self.store.lock().await;
        match entry.disposition {
            Disposition::None => Ok(ReconcileOutcome::default()),
            Disposition::Keys => FeedReconciler::new(&mut store, &self.options, &self.requests)
                .apply_keys(&parse_keys(&response.body), &context),
            Disposition::Feed | Disposition::Entry => {
                if response.body.trim().is_empty() {
                    return confirm_without_body(&mut store, entry, response.etag);
                }
                let page = FeedPage::parse(&response.body, entry.disposition, response.next_link)?;
                FeedReconciler::new(&mut store, &self.options, &self.requests)
                    .apply_page(&page, &context)
            }
        }
    }
}

/// An update accepted with an empty body only carries the new version
fn confirm_without_body(
    store: &mut Store,
    entry: &LedgerEntry,
    etag: Option<String>,
) -> Result<ReconcileOutcome> {
    let mut outcome = ReconcileOutcome::default();
    let Some(target) = &entry.update_target else {
        return Ok(outcome);
    };
    let confirmation = Confirmation {
        key: target.old_key.clone(),
        etag,
        timestamp: None,
        revision: target.revision,
    };
    match store.confirm(target.kind, &target.old_key, &confirmation)? {
        Some(confirmed) => {
            outcome.processed = 1;
            outcome.confirmed = 1;
            outcome.entities.push(EntitySummary::new(
                target.kind,
                &target.old_key,
                confirmed.dirty,
                Change::Confirmed,
            ));
        }
        None => {
            tracing::warn!(
                "{} confirmed {} '{}' which is no longer cached",
                entry.describe(),
                target.kind,
                target.old_key
            );
            outcome.skipped = 1;
        }
    }
    Ok(outcome)
}
