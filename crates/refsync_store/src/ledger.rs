//! Persisted queue of outbound requests.
//!
//! Entries are written the moment they are created and drained oldest
//! first. An entry whose path or body still names a temporary key is
//! blocked until that key is confirmed by the server.

use crate::model::find_temporary_key;
use crate::store::{self, Store};
use crate::{EntityKind, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

/// Credential profile used when a request does not name one
pub const DEFAULT_CREDENTIAL: &str = "default";

const CONFLICT_STATUS: u16 = 412;

macro_rules! sql_text_enum {
    ($ty:ident, $what:literal) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let raw = value.as_str()?;
                $ty::parse(raw).ok_or_else(|| {
                    FromSqlError::Other(format!("unknown {} '{}'", $what, raw).into())
                })
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// What a ledger entry asks the server to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    FetchItems,
    FetchCollections,
    FetchChildren,
    FetchItem,
    FetchCollectionItems,
    FetchKeys,
    FetchChildKeys,
    Create,
    Update,
    Delete,
    AddMembership,
    RemoveMembership,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::FetchItems => "fetch_items",
            RequestKind::FetchCollections => "fetch_collections",
            RequestKind::FetchChildren => "fetch_children",
            RequestKind::FetchItem => "fetch_item",
            RequestKind::FetchCollectionItems => "fetch_collection_items",
            RequestKind::FetchKeys => "fetch_keys",
            RequestKind::FetchChildKeys => "fetch_child_keys",
            RequestKind::Create => "create",
            RequestKind::Update => "update",
            RequestKind::Delete => "delete",
            RequestKind::AddMembership => "add_membership",
            RequestKind::RemoveMembership => "remove_membership",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "fetch_items" => RequestKind::FetchItems,
            "fetch_collections" => RequestKind::FetchCollections,
            "fetch_children" => RequestKind::FetchChildren,
            "fetch_item" => RequestKind::FetchItem,
            "fetch_collection_items" => RequestKind::FetchCollectionItems,
            "fetch_keys" => RequestKind::FetchKeys,
            "fetch_child_keys" => RequestKind::FetchChildKeys,
            "create" => RequestKind::Create,
            "update" => RequestKind::Update,
            "delete" => RequestKind::Delete,
            "add_membership" => RequestKind::AddMembership,
            "remove_membership" => RequestKind::RemoveMembership,
            _ => return None,
        })
    }
}

sql_text_enum!(RequestKind, "request kind");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "DELETE" => Some(HttpMethod::Delete),
            _ => None,
        }
    }
}

sql_text_enum!(HttpMethod, "http method");

/// How the response body is to be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Paginated multi-entry listing
    Feed,
    /// Single entity body
    Entry,
    /// Newline-separated keys
    Keys,
    /// Body ignored
    None,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Feed => "feed",
            Disposition::Entry => "entry",
            Disposition::Keys => "keys",
            Disposition::None => "none",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "feed" => Some(Disposition::Feed),
            "entry" => Some(Disposition::Entry),
            "keys" => Some(Disposition::Keys),
            "none" => Some(Disposition::None),
            _ => None,
        }
    }
}

sql_text_enum!(Disposition, "disposition");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    New,
    InProgress,
    Done,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::New => "new",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Done => "done",
            RequestStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(RequestStatus::New),
            "in_progress" => Some(RequestStatus::InProgress),
            "done" => Some(RequestStatus::Done),
            "error" => Some(RequestStatus::Error),
            _ => None,
        }
    }
}

sql_text_enum!(RequestStatus, "request status");

/// Local entity a creation or update response confirms
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateTarget {
    pub old_key: String,
    pub kind: EntityKind,
    /// Local revision the request body was built from, recorded at enqueue
    pub revision: Option<i64>,
}

impl UpdateTarget {
    pub fn new(old_key: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            old_key: old_key.into(),
            kind,
            revision: None,
        }
    }
}

/// A request about to be written to the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct NewRequest {
    pub kind: RequestKind,
    pub method: HttpMethod,
    /// Relative to the library prefix, or an absolute continuation URL
    pub path: String,
    pub disposition: Disposition,
    pub credential: Option<String>,
    /// Collection or item the request is about
    pub subject_key: Option<String>,
    pub if_match: Option<String>,
    pub body: Option<String>,
    pub update_target: Option<UpdateTarget>,
}

impl NewRequest {
    pub fn new(
        kind: RequestKind,
        method: HttpMethod,
        path: impl Into<String>,
        disposition: Disposition,
    ) -> Self {
        Self {
            kind,
            method,
            path: path.into(),
            disposition,
            credential: None,
            subject_key: None,
            if_match: None,
            body: None,
            update_target: None,
        }
    }

    pub fn with_subject(mut self, key: impl Into<String>) -> Self {
        self.subject_key = Some(key.into());
        self
    }

    pub fn with_if_match(mut self, etag: Option<String>) -> Self {
        self.if_match = etag;
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_update_target(mut self, target: UpdateTarget) -> Self {
        self.update_target = Some(target);
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// `POST /collections/{c}/items` with the item key as body
    pub fn add_membership(collection_key: &str, item_key: &str) -> Self {
        Self::new(
            RequestKind::AddMembership,
            HttpMethod::Post,
            format!("/collections/{}/items", collection_key),
            Disposition::None,
        )
        .with_subject(collection_key)
        .with_body(item_key)
    }

    /// `DELETE /collections/{c}/items/{i}`
    pub fn remove_membership(collection_key: &str, item_key: &str) -> Self {
        Self::new(
            RequestKind::RemoveMembership,
            HttpMethod::Delete,
            format!("/collections/{}/items/{}", collection_key, item_key),
            Disposition::None,
        )
        .with_subject(collection_key)
    }

    fn blocked_on(&self) -> Option<String> {
        find_temporary_key(&self.path)
            .or_else(|| self.body.as_deref().and_then(find_temporary_key))
    }
}

/// A persisted request with its lifecycle state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    /// FIFO position
    pub seq: i64,
    /// Also used as the write token for POST requests
    pub uuid: String,
    pub kind: RequestKind,
    pub method: HttpMethod,
    pub path: String,
    pub disposition: Disposition,
    pub credential: String,
    pub subject_key: Option<String>,
    pub if_match: Option<String>,
    pub body: Option<String>,
    pub update_target: Option<UpdateTarget>,
    pub blocked_on: Option<String>,
    pub status: RequestStatus,
    pub http_status: Option<u16>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub last_attempt_at: Option<i64>,
}

impl LedgerEntry {
    /// Short human-readable descriptor, e.g. `GET /items/top`
    pub fn describe(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    pub new: usize,
    pub in_progress: usize,
    pub done: usize,
    pub error: usize,
    /// `NEW` entries waiting on a temporary key
    pub blocked: usize,
}

impl LedgerCounts {
    pub fn pending(&self) -> usize {
        self.new + self.in_progress
    }
}

const ENTRY_COLUMNS: &str = "seq, uuid, kind, method, path, disposition, credential, subject_key, \
     if_match, body, update_key, update_kind, blocked_on, status, http_status, attempts, \
     last_error, created_at, last_attempt_at, update_revision";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let update_key: Option<String> = row.get(10)?;
    let update_kind: Option<String> = row.get(11)?;
    let revision: Option<i64> = row.get(19)?;
    let update_target = match (update_key, update_kind) {
        (Some(old_key), Some(kind)) => EntityKind::parse(&kind).map(|kind| UpdateTarget {
            old_key,
            kind,
            revision,
        }),
        _ => None,
    };

    Ok(LedgerEntry {
        seq: row.get(0)?,
        uuid: row.get(1)?,
        kind: row.get(2)?,
        method: row.get(3)?,
        path: row.get(4)?,
        disposition: row.get(5)?,
        credential: row.get(6)?,
        subject_key: row.get(7)?,
        if_match: row.get(8)?,
        body: row.get(9)?,
        update_target,
        blocked_on: row.get(12)?,
        status: row.get(13)?,
        http_status: row.get(14)?,
        attempts: row.get(15)?,
        last_error: row.get(16)?,
        created_at: row.get(17)?,
        last_attempt_at: row.get(18)?,
    })
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn insert_entry(
    conn: &Connection,
    request: &NewRequest,
    default_credential: &str,
) -> Result<LedgerEntry> {
    let uuid = Uuid::new_v4().to_string();
    let credential = request
        .credential
        .clone()
        .unwrap_or_else(|| default_credential.to_string());
    let (update_key, update_kind) = match &request.update_target {
        Some(target) => (Some(target.old_key.clone()), Some(target.kind.as_str())),
        None => (None, None),
    };
    let update_revision = pushed_revision(conn, request.update_target.as_ref())?;
    let blocked_on = request.blocked_on();

    conn.execute(
        "INSERT INTO ledger (uuid, kind, method, path, disposition, credential, subject_key,
            if_match, body, update_key, update_kind, update_revision, blocked_on, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            uuid,
            request.kind,
            request.method,
            request.path,
            request.disposition,
            credential,
            request.subject_key,
            request.if_match,
            request.body,
            update_key,
            update_kind,
            update_revision,
            blocked_on,
            RequestStatus::New,
            now()
        ],
    )?;

    let seq = conn.last_insert_rowid();
    tracing::debug!(
        "Queued {} {} {} (seq {}{})",
        request.kind,
        request.method,
        request.path,
        seq,
        if blocked_on.is_some() { ", blocked" } else { "" }
    );
    get_entry(conn, &uuid)?.ok_or_else(|| {
        crate::StoreError::InvalidState(format!("ledger entry {} vanished after insert", uuid))
    })
}

/// Revision a push carries: the one it names, else the row's current one
fn pushed_revision(conn: &Connection, target: Option<&UpdateTarget>) -> Result<Option<i64>> {
    match target {
        Some(UpdateTarget {
            revision: Some(revision),
            ..
        }) => Ok(Some(*revision)),
        Some(target) => store::revision_of(conn, target.kind, &target.old_key),
        None => Ok(None),
    }
}

fn get_entry(conn: &Connection, uuid: &str) -> Result<Option<LedgerEntry>> {
    let sql = format!("SELECT {} FROM ledger WHERE uuid = ?1", ENTRY_COLUMNS);
    Ok(conn.query_row(&sql, [uuid], entry_from_row).optional()?)
}

/// Point pending entries at a confirmed key and unblock them
pub(crate) fn rewrite_key_references(conn: &Connection, old_key: &str, new_key: &str) -> Result<()> {
    // Other attempts to create the same entity are now redundant
    conn.execute(
        "DELETE FROM ledger
         WHERE kind = 'create' AND update_key = ?1 AND status IN ('new', 'error')",
        [old_key],
    )?;

    conn.execute(
        "UPDATE ledger SET
            path = REPLACE(path, ?1, ?2),
            body = REPLACE(body, ?1, ?2),
            subject_key = CASE WHEN subject_key = ?1 THEN ?2 ELSE subject_key END,
            update_key = CASE WHEN update_key = ?1 THEN ?2 ELSE update_key END
         WHERE status != 'done'",
        params![old_key, new_key],
    )?;

    let mut stmt = conn.prepare("SELECT seq, path, body FROM ledger WHERE blocked_on = ?1")?;
    let unblocked = stmt
        .query_map([old_key], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (seq, path, body) in unblocked {
        // Still blocked if it names another unconfirmed key
        let next = find_temporary_key(&path).or_else(|| body.as_deref().and_then(find_temporary_key));
        conn.execute(
            "UPDATE ledger SET blocked_on = ?2 WHERE seq = ?1",
            params![seq, next],
        )?;
    }
    Ok(())
}

/// Drop unfinished entries that only make sense for a vanished temporary key
pub(crate) fn discard_for_key(conn: &Connection, key: &str) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM ledger
         WHERE status IN ('new', 'error')
           AND (blocked_on = ?1 OR update_key = ?1 OR subject_key = ?1)",
        [key],
    )?;
    if removed > 0 {
        tracing::debug!("Discarded {} ledger entries for {}", removed, key);
    }
    Ok(removed)
}

impl Store {
    /// Credential profile recorded on entries that do not name one
    pub fn set_default_credential(&mut self, credential: impl Into<String>) {
        self.credential = credential.into();
    }

    /// Persist a request as `NEW`
    pub fn enqueue(&mut self, request: &NewRequest) -> Result<LedgerEntry> {
        insert_entry(&self.conn, request, &self.credential)
    }

    /// Persist a request unless an identical one is already waiting
    pub fn enqueue_unique(&mut self, request: &NewRequest) -> Result<Option<LedgerEntry>> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT seq FROM ledger
                 WHERE status = 'new' AND method = ?1 AND path = ?2 AND body IS ?3
                 LIMIT 1",
                params![request.method, request.path, request.body],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(None);
        }
        self.enqueue(request).map(Some)
    }

    /// Persist a create/update, folding it into a waiting one for the same entity
    ///
    /// A second local edit before the first push replaces the queued body
    /// instead of racing it with a stale `If-Match`.
    pub fn enqueue_push(&mut self, request: &NewRequest) -> Result<Option<LedgerEntry>> {
        let Some(target) = &request.update_target else {
            return self.enqueue_unique(request);
        };
        let waiting: Option<String> = self
            .conn
            .query_row(
                "SELECT uuid FROM ledger
                 WHERE status = 'new' AND kind = ?1 AND update_key = ?2 AND update_kind = ?3
                 LIMIT 1",
                params![request.kind, target.old_key, target.kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match waiting {
            Some(uuid) => {
                let revision = pushed_revision(&self.conn, Some(target))?;
                self.conn.execute(
                    "UPDATE ledger SET path = ?2, body = ?3, if_match = ?4, blocked_on = ?5,
                        update_revision = ?6
                     WHERE uuid = ?1",
                    params![
                        uuid,
                        request.path,
                        request.body,
                        request.if_match,
                        request.blocked_on(),
                        revision
                    ],
                )?;
                Ok(None)
            }
            None => self.enqueue(request).map(Some),
        }
    }

    /// Move the oldest runnable `NEW` entry to `IN_PROGRESS`
    pub fn claim_next(&mut self) -> Result<Option<LedgerEntry>> {
        let tx = self.conn.transaction()?;
        let uuid: Option<String> = tx
            .query_row(
                "SELECT uuid FROM ledger
                 WHERE status = 'new' AND blocked_on IS NULL
                 ORDER BY seq LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(uuid) = uuid else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE ledger SET status = ?2, attempts = attempts + 1, last_attempt_at = ?3
             WHERE uuid = ?1",
            params![uuid, RequestStatus::InProgress, now()],
        )?;
        let entry = get_entry(&tx, &uuid)?;
        tx.commit()?;
        Ok(entry)
    }

    pub fn mark_done(&mut self, uuid: &str, http_status: Option<u16>) -> Result<()> {
        self.conn.execute(
            "UPDATE ledger SET status = ?2, http_status = ?3, last_error = NULL WHERE uuid = ?1",
            params![uuid, RequestStatus::Done, http_status],
        )?;
        Ok(())
    }

    pub fn mark_error(&mut self, uuid: &str, http_status: Option<u16>, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE ledger SET status = ?2, http_status = ?3, last_error = ?4 WHERE uuid = ?1",
            params![uuid, RequestStatus::Error, http_status, error],
        )?;
        Ok(())
    }

    /// Return failed entries to `NEW` while they are under the attempt cap
    ///
    /// Version conflicts (412) stay in `ERROR` until retried by hand.
    pub fn requeue_failed(&mut self, max_attempts: u32) -> Result<usize> {
        let requeued = self.conn.execute(
            "UPDATE ledger SET status = 'new' WHERE status = 'error' AND attempts < ?1 \
             AND (http_status IS NULL OR http_status != ?2)",
            params![max_attempts, CONFLICT_STATUS],
        )?;
        if requeued > 0 {
            tracing::info!("Requeued {} failed requests", requeued);
        }
        Ok(requeued)
    }

    /// Manual retry of one failed entry, ignoring the attempt cap
    pub fn requeue_entry(&mut self, uuid: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE ledger SET status = 'new' WHERE uuid = ?1 AND status = 'error'",
            [uuid],
        )?;
        Ok(changed > 0)
    }

    /// Entries left `IN_PROGRESS` by an interrupted run go back to `NEW`
    pub fn recover_interrupted(&mut self) -> Result<usize> {
        let recovered = self
            .conn
            .execute("UPDATE ledger SET status = 'new' WHERE status = 'in_progress'", [])?;
        if recovered > 0 {
            tracing::warn!("Recovered {} interrupted requests", recovered);
        }
        Ok(recovered)
    }

    pub fn prune_done(&mut self) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM ledger WHERE status = 'done'", [])?)
    }

    pub fn ledger_entry(&self, uuid: &str) -> Result<Option<LedgerEntry>> {
        get_entry(&self.conn, uuid)
    }

    /// Entries in FIFO order, optionally filtered by status
    pub fn ledger_entries(&self, status: Option<RequestStatus>) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM ledger WHERE status = ?1 ORDER BY seq",
                    ENTRY_COLUMNS
                );
                let mut stmt = self.conn.prepare(&sql)?;
                for entry in stmt.query_map([status], entry_from_row)? {
                    entries.push(entry?);
                }
            }
            None => {
                let sql = format!("SELECT {} FROM ledger ORDER BY seq", ENTRY_COLUMNS);
                let mut stmt = self.conn.prepare(&sql)?;
                for entry in stmt.query_map([], entry_from_row)? {
                    entries.push(entry?);
                }
            }
        }
        Ok(entries)
    }

    pub fn ledger_counts(&self) -> Result<LedgerCounts> {
        let mut counts = LedgerCounts::default();
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM ledger GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, RequestStatus>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            let n = n as usize;
            match status {
                RequestStatus::New => counts.new = n,
                RequestStatus::InProgress => counts.in_progress = n,
                RequestStatus::Done => counts.done = n,
                RequestStatus::Error => counts.error = n,
            }
        }
        let blocked: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM ledger WHERE status = 'new' AND blocked_on IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        counts.blocked = blocked as usize;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::temporary_key;

    fn fetch_top() -> NewRequest {
        NewRequest::new(
            RequestKind::FetchItems,
            HttpMethod::Get,
            "/items/top?format=json",
            Disposition::Feed,
        )
    }

    #[test]
    fn test_entries_drain_in_fifo_order() {
        let mut store = Store::open_in_memory().unwrap();
        let first = store.enqueue(&fetch_top()).unwrap();
        let second = store
            .enqueue(&NewRequest::new(
                RequestKind::FetchCollections,
                HttpMethod::Get,
                "/collections",
                Disposition::Feed,
            ))
            .unwrap();

        let claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.uuid, first.uuid);
        assert_eq!(claimed.status, RequestStatus::InProgress);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.last_attempt_at.is_some());

        store.mark_done(&claimed.uuid, Some(200)).unwrap();
        let next = store.claim_next().unwrap().unwrap();
        assert_eq!(next.uuid, second.uuid);
        assert!(store.claim_next().unwrap().is_none());
    }

    #[test]
    fn test_enqueue_unique_skips_waiting_duplicate() {
        let mut store = Store::open_in_memory().unwrap();
        assert!(store.enqueue_unique(&fetch_top()).unwrap().is_some());
        assert!(store.enqueue_unique(&fetch_top()).unwrap().is_none());
        assert_eq!(store.ledger_counts().unwrap().new, 1);
    }

    #[test]
    fn test_error_entries_stay_visible_and_requeue() {
        let mut store = Store::open_in_memory().unwrap();
        store.enqueue(&fetch_top()).unwrap();

        let entry = store.claim_next().unwrap().unwrap();
        store.mark_error(&entry.uuid, Some(503), "unavailable").unwrap();

        let failed = store.ledger_entries(Some(RequestStatus::Error)).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].http_status, Some(503));
        assert_eq!(failed[0].last_error.as_deref(), Some("unavailable"));

        assert_eq!(store.requeue_failed(1).unwrap(), 0, "attempt cap reached");
        assert_eq!(store.requeue_failed(5).unwrap(), 1);
        assert_eq!(store.ledger_counts().unwrap().new, 1);
    }

    #[test]
    fn test_conflicts_wait_for_manual_retry() {
        let mut store = Store::open_in_memory().unwrap();
        store.enqueue(&fetch_top()).unwrap();
        store
            .enqueue(&NewRequest::new(
                RequestKind::FetchCollections,
                HttpMethod::Get,
                "/collections",
                Disposition::Feed,
            ))
            .unwrap();

        let conflicted = store.claim_next().unwrap().unwrap();
        store
            .mark_error(&conflicted.uuid, Some(412), "version conflict")
            .unwrap();
        let unavailable = store.claim_next().unwrap().unwrap();
        store
            .mark_error(&unavailable.uuid, Some(503), "unavailable")
            .unwrap();

        assert_eq!(store.requeue_failed(5).unwrap(), 1);
        let waiting = store.ledger_entries(Some(RequestStatus::New)).unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].uuid, unavailable.uuid);

        assert!(store.requeue_entry(&conflicted.uuid).unwrap());
        assert_eq!(store.ledger_counts().unwrap().new, 2);
    }

    #[test]
    fn test_interrupted_entries_recover() {
        let mut store = Store::open_in_memory().unwrap();
        store.enqueue(&fetch_top()).unwrap();
        store.claim_next().unwrap().unwrap();

        assert_eq!(store.recover_interrupted().unwrap(), 1);
        assert!(store.claim_next().unwrap().is_some());
    }

    #[test]
    fn test_ledger_survives_reopen() {
        let temp = assert_fs::TempDir::new().unwrap();
        let path = temp.path().join("cache.db");

        let uuid = {
            let mut store = Store::open(&path).unwrap();
            store.enqueue(&fetch_top()).unwrap().uuid
        };

        let store = Store::open(&path).unwrap();
        let entry = store.ledger_entry(&uuid).unwrap().unwrap();
        assert_eq!(entry.status, RequestStatus::New);
        assert_eq!(entry.kind, RequestKind::FetchItems);
        assert_eq!(entry.credential, DEFAULT_CREDENTIAL);
    }

    #[test]
    fn test_temporary_key_blocks_until_rewritten() {
        let mut store = Store::open_in_memory().unwrap();
        let temp_collection = temporary_key();
        let entry = store
            .enqueue(&NewRequest::add_membership(&temp_collection, "ITEM0001"))
            .unwrap();
        assert_eq!(entry.blocked_on.as_deref(), Some(temp_collection.as_str()));
        assert!(store.claim_next().unwrap().is_none());
        assert_eq!(store.ledger_counts().unwrap().blocked, 1);

        rewrite_key_references(&store.conn, &temp_collection, "COLL0001").unwrap();

        let claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.path, "/collections/COLL0001/items");
        assert_eq!(claimed.subject_key.as_deref(), Some("COLL0001"));
        assert!(claimed.blocked_on.is_none());
    }

    #[test]
    fn test_doubly_blocked_entry_waits_for_both_keys() {
        let mut store = Store::open_in_memory().unwrap();
        let collection = temporary_key();
        let item = temporary_key();
        store
            .enqueue(&NewRequest::add_membership(&collection, &item))
            .unwrap();

        rewrite_key_references(&store.conn, &collection, "COLL0001").unwrap();
        assert!(store.claim_next().unwrap().is_none());

        rewrite_key_references(&store.conn, &item, "ITEM0001").unwrap();
        let claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.body.as_deref(), Some("ITEM0001"));
    }

    #[test]
    fn test_enqueue_push_replaces_waiting_body() {
        let mut store = Store::open_in_memory().unwrap();
        let update = |body: &str| {
            NewRequest::new(
                RequestKind::Update,
                HttpMethod::Put,
                "/items/ABCD1234",
                Disposition::Entry,
            )
            .with_body(body)
            .with_if_match(Some("v1".to_string()))
            .with_update_target(UpdateTarget::new("ABCD1234", EntityKind::Item))
        };

        assert!(store.enqueue_push(&update("{\"title\":\"a\"}")).unwrap().is_some());
        assert!(store.enqueue_push(&update("{\"title\":\"b\"}")).unwrap().is_none());

        let entries = store.ledger_entries(None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].body.as_deref(), Some("{\"title\":\"b\"}"));
    }

    #[test]
    fn test_update_target_round_trips() {
        let mut store = Store::open_in_memory().unwrap();
        let request = NewRequest::new(
            RequestKind::Create,
            HttpMethod::Post,
            "/items",
            Disposition::Feed,
        )
        .with_body("{\"items\":[]}")
        .with_update_target(UpdateTarget::new("tmp-1", EntityKind::Item))
        .with_credential("work");

        let entry = store.enqueue(&request).unwrap();
        assert_eq!(
            entry.update_target,
            Some(UpdateTarget::new("tmp-1", EntityKind::Item))
        );
        assert_eq!(entry.credential, "work");
        assert_eq!(entry.describe(), "POST /items");
    }
}
