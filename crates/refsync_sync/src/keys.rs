//! Reconciliation of keys-only listings.
//!
//! A stale collection is checked against the list of its member keys.
//! Memberships are corrected from the list directly; the items that are
//! not cached yet are fetched one by one, or, when too few are cached
//! for that to be worthwhile, with a full listing.

use crate::events::{Change, EntitySummary};
use crate::reconciler::{FeedReconciler, ReconcileContext, ReconcileOutcome};
use crate::{Result, SyncError};
use refsync_store::{DirtyState, EntityKind, Origin, RequestKind};
use std::collections::HashSet;

impl<'a> FeedReconciler<'a> {
    /// Apply a newline-separated key listing
    pub fn apply_keys(
        &mut self,
        keys: &[String],
        context: &ReconcileContext,
    ) -> Result<ReconcileOutcome> {
        let subject = context.subject_key.as_deref().ok_or_else(|| {
            SyncError::MalformedResponse("keys listing without a subject".to_string())
        })?;
        let subject_kind = match context.kind {
            RequestKind::FetchChildKeys => EntityKind::Item,
            _ => EntityKind::Collection,
        };
        if self.store.deletion_pending(subject_kind, subject)? {
            tracing::debug!("{} {} was deleted here, ignoring its keys", subject_kind, subject);
            return Ok(ReconcileOutcome::default());
        }
        match context.kind {
            RequestKind::FetchKeys => self.apply_collection_keys(subject, keys),
            RequestKind::FetchChildKeys => self.apply_child_keys(subject, keys),
            other => Err(SyncError::MalformedResponse(format!(
                "keys body for a {} request",
                other
            ))),
        }
    }

    fn apply_collection_keys(
        &mut self,
        collection: &str,
        keys: &[String],
    ) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        self.ensure_collection(collection)?;

        let listed: HashSet<&str> = keys.iter().map(String::as_str).collect();
        for member in self.store.member_keys(collection)? {
            if !listed.contains(member.as_str()) {
                self.store
                    .remove_membership(&member, collection, Origin::Remote)?;
            }
        }

        let mut known = 0usize;
        let mut missing = Vec::new();
        for key in keys {
            if self.store.contains(EntityKind::Item, key)? {
                self.store.add_membership(key, collection, Origin::Remote)?;
                known += 1;
            } else if self.store.contains(EntityKind::Attachment, key)? {
                // Child records are listed too but carry no membership
                known += 1;
            } else if !self.store.deletion_pending(EntityKind::Item, key)? {
                missing.push(key.as_str());
            }
        }
        let size = self.store.recompute_collection_size(collection)?;

        if missing.is_empty() {
            self.mark_listing_complete(collection)?;
        } else if known_fraction(known, keys.len()) < self.options.keys_refetch_cutoff {
            tracing::info!(
                "Only {}/{} members of {} cached, refetching the listing",
                known,
                keys.len(),
                collection
            );
            let listing = self.requests.fetch_collection_items(collection);
            outcome.queued += self.queue(&listing)?;
        } else {
            for key in missing {
                let fetch = self.requests.fetch_item(key, Some(collection));
                outcome.queued += self.queue(&fetch)?;
            }
        }

        let dirty = self
            .store
            .collection_by_key(collection)?
            .map_or(DirtyState::Missing, |c| c.dirty);
        tracing::debug!(
            "Collection {} lists {} keys, {} cached members",
            collection,
            keys.len(),
            size
        );
        outcome.processed = 1;
        outcome.updated = 1;
        outcome.entities.push(EntitySummary::new(
            EntityKind::Collection,
            collection,
            dirty,
            Change::Updated,
        ));
        Ok(outcome)
    }

    fn apply_child_keys(&mut self, item: &str, keys: &[String]) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();

        let mut missing = Vec::new();
        for key in keys {
            if !self.store.contains(EntityKind::Attachment, key)?
                && !self.store.deletion_pending(EntityKind::Attachment, key)?
            {
                missing.push(key.as_str());
            }
        }
        if missing.is_empty() {
            return Ok(outcome);
        }

        let known = keys.len() - missing.len();
        if known_fraction(known, keys.len()) < self.options.keys_refetch_cutoff {
            let children = self.requests.fetch_children(item);
            outcome.queued += self.queue(&children)?;
        } else {
            for key in missing {
                let fetch = self.requests.fetch_item(key, None);
                outcome.queued += self.queue(&fetch)?;
            }
        }
        Ok(outcome)
    }
}

fn known_fraction(known: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        known as f64 / total as f64
    }
}
