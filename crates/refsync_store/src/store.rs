//! SQLite connection, entity reads and writes, key confirmation.

use crate::ledger;
use crate::model::{Attachment, Collection, DirtyState, Item};
use crate::{EntityKind, Result, StoreError};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

pub(crate) const ITEM_COLUMNS: &str =
    "id, key, item_type, title, etag, timestamp, dirty, num_children, content";
pub(crate) const COLLECTION_COLUMNS: &str =
    "id, key, name, parent_key, size, etag, timestamp, dirty, content";
pub(crate) const ATTACHMENT_COLUMNS: &str =
    "id, key, parent_key, title, url, status, etag, timestamp, dirty, content";

/// Single-writer handle on the local cache
pub struct Store {
    pub(crate) conn: Connection,
    pub(crate) credential: String,
}

/// Row counts across the cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub items: usize,
    pub collections: usize,
    pub attachments: usize,
    pub memberships: usize,
    pub tombstones: usize,
}

/// Server acknowledgement of a pushed entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub key: String,
    pub etag: Option<String>,
    pub timestamp: Option<String>,
    /// Local revision the push carried; `None` accepts whatever is cached
    pub revision: Option<i64>,
}

/// Row a confirmation was applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmed {
    pub local_id: i64,
    /// `DIRTY` when the row was edited again after the push was built
    pub dirty: DirtyState,
}

impl Store {
    /// Open or create the cache database
    ///
    /// # Arguments
    /// * `path` - Path to the SQLite database file; parent directories are created
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        tracing::info!("Cache opened at {:?}", path);
        Ok(store)
    }

    /// In-memory cache, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self {
            conn,
            credential: ledger::DEFAULT_CREDENTIAL.to_string(),
        })
    }

    /// Close the database connection
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| e)?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let count = |table: &str| -> Result<usize> {
            let n: i64 =
                self.conn
                    .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                        row.get(0)
                    })?;
            Ok(n as usize)
        };

        Ok(StoreStats {
            items: count("items")?,
            collections: count("collections")?,
            attachments: count("attachments")?,
            memberships: count("collection_items")?,
            tombstones: count("tombstones")?,
        })
    }

    //
    // Reads
    //

    pub fn item_by_key(&self, key: &str) -> Result<Option<Item>> {
        let sql = format!("SELECT {} FROM items WHERE key = ?1", ITEM_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, [key], item_from_row)
            .optional()?)
    }

    pub fn item_by_local_id(&self, local_id: i64) -> Result<Option<Item>> {
        let sql = format!("SELECT {} FROM items WHERE id = ?1", ITEM_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, [local_id], item_from_row)
            .optional()?)
    }

    pub fn collection_by_key(&self, key: &str) -> Result<Option<Collection>> {
        let sql = format!("SELECT {} FROM collections WHERE key = ?1", COLLECTION_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, [key], collection_from_row)
            .optional()?)
    }

    pub fn attachment_by_key(&self, key: &str) -> Result<Option<Attachment>> {
        let sql = format!("SELECT {} FROM attachments WHERE key = ?1", ATTACHMENT_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, [key], attachment_from_row)
            .optional()?)
    }

    /// Whether an entity of `kind` with this key is cached
    pub fn contains(&self, kind: EntityKind, key: &str) -> Result<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE key = ?1", table_for(kind));
        Ok(self
            .conn
            .query_row(&sql, [key], |_| Ok(()))
            .optional()?
            .is_some())
    }

    pub fn all_items(&self) -> Result<Vec<Item>> {
        let sql = format!("SELECT {} FROM items ORDER BY id", ITEM_COLUMNS);
        self.query_items(&sql, [])
    }

    pub fn all_collections(&self) -> Result<Vec<Collection>> {
        let sql = format!("SELECT {} FROM collections ORDER BY id", COLLECTION_COLUMNS);
        self.query_collections(&sql, [])
    }

    pub fn attachments_for_item(&self, parent_key: &str) -> Result<Vec<Attachment>> {
        let sql = format!(
            "SELECT {} FROM attachments WHERE parent_key = ?1 ORDER BY id",
            ATTACHMENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let attachments = stmt
            .query_map([parent_key], attachment_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(attachments)
    }

    pub fn subcollections(&self, parent_key: &str) -> Result<Vec<Collection>> {
        let sql = format!(
            "SELECT {} FROM collections WHERE parent_key = ?1 ORDER BY name",
            COLLECTION_COLUMNS
        );
        self.query_collections(&sql, [parent_key])
    }

    pub fn top_level_collections(&self) -> Result<Vec<Collection>> {
        let sql = format!(
            "SELECT {} FROM collections WHERE parent_key IS NULL ORDER BY name",
            COLLECTION_COLUMNS
        );
        self.query_collections(&sql, [])
    }

    pub fn items_in_collection(&self, collection_key: &str) -> Result<Vec<Item>> {
        let columns = ITEM_COLUMNS
            .split(", ")
            .map(|c| format!("i.{}", c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM items i
             JOIN collection_items ci ON ci.item_id = i.id
             JOIN collections c ON c.id = ci.collection_id
             WHERE c.key = ?1
             ORDER BY i.id",
            columns
        );
        self.query_items(&sql, [collection_key])
    }

    pub fn collections_for_item(&self, item_key: &str) -> Result<Vec<Collection>> {
        let columns = COLLECTION_COLUMNS
            .split(", ")
            .map(|c| format!("c.{}", c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM collections c
             JOIN collection_items ci ON ci.collection_id = c.id
             JOIN items i ON i.id = ci.item_id
             WHERE i.key = ?1
             ORDER BY c.name",
            columns
        );
        self.query_collections(&sql, [item_key])
    }

    fn query_items<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Item>> {
        let mut stmt = self.conn.prepare(sql)?;
        let items = stmt
            .query_map(params, item_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn query_collections<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<Collection>> {
        let mut stmt = self.conn.prepare(sql)?;
        let collections = stmt
            .query_map(params, collection_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(collections)
    }

    //
    // Writes
    //

    /// Insert or update an item; assigns `local_id` on first save
    pub fn save_item(&mut self, item: &mut Item) -> Result<i64> {
        ensure_new_has_no_etag(EntityKind::Item, &item.key, item.dirty, &item.etag)?;
        let id = save_item_row(&self.conn, item)?;
        item.local_id = Some(id);
        Ok(id)
    }

    pub fn save_collection(&mut self, collection: &mut Collection) -> Result<i64> {
        ensure_new_has_no_etag(
            EntityKind::Collection,
            &collection.key,
            collection.dirty,
            &collection.etag,
        )?;
        let id = save_collection_row(&self.conn, collection)?;
        collection.local_id = Some(id);
        Ok(id)
    }

    pub fn save_attachment(&mut self, attachment: &mut Attachment) -> Result<i64> {
        ensure_new_has_no_etag(
            EntityKind::Attachment,
            &attachment.key,
            attachment.dirty,
            &attachment.etag,
        )?;
        let id = save_attachment_row(&self.conn, attachment)?;
        attachment.local_id = Some(id);
        Ok(id)
    }

    /// Record the server's acceptance of a pushed entity
    ///
    /// Children referencing `old_key` and pending ledger entries are
    /// rewritten before the entity's own key, all in one transaction.
    /// The row takes the server's etag and timestamp; it only becomes
    /// `CLEAN` if no local edit landed after the pushed revision.
    /// Returns `None` when nothing is cached under `old_key`.
    pub fn confirm(
        &mut self,
        kind: EntityKind,
        old_key: &str,
        confirmation: &Confirmation,
    ) -> Result<Option<Confirmed>> {
        let table = table_for(kind);
        let tx = self.conn.transaction()?;

        let row: Option<(i64, i64)> = tx
            .query_row(
                &format!("SELECT id, revision FROM {} WHERE key = ?1", table),
                [old_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((id, revision)) = row else {
            return Ok(None);
        };
        let dirty = match confirmation.revision {
            Some(pushed) if pushed != revision => {
                tracing::info!(
                    "{} {} changed while its push was in flight (revision {} pushed, {} cached)",
                    kind,
                    old_key,
                    pushed,
                    revision
                );
                DirtyState::Dirty
            }
            _ => DirtyState::Clean,
        };

        let new_key = confirmation.key.as_str();
        if new_key != old_key {
            // The server copy may already be cached from a listing
            let duplicate: Option<i64> = tx
                .query_row(
                    &format!("SELECT id FROM {} WHERE key = ?1", table),
                    [new_key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(duplicate) = duplicate {
                merge_duplicate(&tx, kind, duplicate, id)?;
            }

            match kind {
                EntityKind::Item => {
                    tx.execute(
                        "UPDATE attachments SET parent_key = ?2 WHERE parent_key = ?1",
                        params![old_key, new_key],
                    )?;
                }
                EntityKind::Collection => {
                    tx.execute(
                        "UPDATE collections SET parent_key = ?2 WHERE parent_key = ?1",
                        params![old_key, new_key],
                    )?;
                }
                EntityKind::Attachment => {}
            }
            ledger::rewrite_key_references(&tx, old_key, new_key)?;

            tx.execute(
                &format!("UPDATE {} SET key = ?2 WHERE id = ?1", table),
                params![id, new_key],
            )?;
            tracing::debug!("Rewrote {} key {} -> {}", kind, old_key, new_key);
        }

        tx.execute(
            &format!(
                "UPDATE {} SET etag = COALESCE(?2, etag), timestamp = COALESCE(?3, timestamp), dirty = ?4 WHERE id = ?1",
                table
            ),
            params![id, confirmation.etag, confirmation.timestamp, dirty],
        )?;

        tx.commit()?;
        Ok(Some(Confirmed {
            local_id: id,
            dirty,
        }))
    }
}

/// Local edit count of a cached row
pub(crate) fn revision_of(conn: &Connection, kind: EntityKind, key: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            &format!("SELECT revision FROM {} WHERE key = ?1", table_for(kind)),
            [key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Counts one local edit of the row
pub(crate) fn bump_revision(conn: &Connection, kind: EntityKind, local_id: i64) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE {} SET revision = revision + 1 WHERE id = ?1",
            table_for(kind)
        ),
        [local_id],
    )?;
    Ok(())
}

/// Folds a row that duplicates `keep` (same server key) into it
fn merge_duplicate(conn: &Connection, kind: EntityKind, duplicate: i64, keep: i64) -> Result<()> {
    match kind {
        EntityKind::Item => {
            conn.execute(
                "INSERT OR IGNORE INTO collection_items (collection_id, item_id)
                 SELECT collection_id, ?2 FROM collection_items WHERE item_id = ?1",
                params![duplicate, keep],
            )?;
        }
        EntityKind::Collection => {
            conn.execute(
                "INSERT OR IGNORE INTO collection_items (collection_id, item_id)
                 SELECT ?2, item_id FROM collection_items WHERE collection_id = ?1",
                params![duplicate, keep],
            )?;
        }
        EntityKind::Attachment => {}
    }
    conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1", table_for(kind)),
        [duplicate],
    )?;
    tracing::warn!("Merged duplicate {} row {} into {}", kind, duplicate, keep);
    Ok(())
}

pub(crate) fn table_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Item => "items",
        EntityKind::Collection => "collections",
        EntityKind::Attachment => "attachments",
    }
}

fn ensure_new_has_no_etag(
    kind: EntityKind,
    key: &str,
    dirty: DirtyState,
    etag: &Option<String>,
) -> Result<()> {
    if dirty == DirtyState::New && etag.is_some() {
        return Err(StoreError::InvalidState(format!(
            "{} '{}' is NEW but carries an etag",
            kind, key
        )));
    }
    Ok(())
}

pub(crate) fn save_item_row(conn: &Connection, item: &Item) -> Result<i64> {
    match item.local_id {
        Some(id) => {
            let changed = conn.execute(
                "UPDATE items SET key = ?2, item_type = ?3, title = ?4, etag = ?5,
                    timestamp = ?6, dirty = ?7, num_children = ?8, content = ?9
                 WHERE id = ?1",
                params![
                    id,
                    item.key,
                    item.item_type,
                    item.title,
                    item.etag,
                    item.timestamp,
                    item.dirty,
                    item.num_children,
                    item.content
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found(EntityKind::Item, item.key.as_str()));
            }
            Ok(id)
        }
        None => Ok(conn.query_row(
            "INSERT INTO items (key, item_type, title, etag, timestamp, dirty, num_children, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(key) DO UPDATE SET
                item_type = excluded.item_type,
                title = excluded.title,
                etag = excluded.etag,
                timestamp = excluded.timestamp,
                dirty = excluded.dirty,
                num_children = excluded.num_children,
                content = excluded.content
             RETURNING id",
            params![
                item.key,
                item.item_type,
                item.title,
                item.etag,
                item.timestamp,
                item.dirty,
                item.num_children,
                item.content
            ],
            |row| row.get(0),
        )?),
    }
}

pub(crate) fn save_collection_row(conn: &Connection, collection: &Collection) -> Result<i64> {
    match collection.local_id {
        Some(id) => {
            let changed = conn.execute(
                "UPDATE collections SET key = ?2, name = ?3, parent_key = ?4, size = ?5,
                    etag = ?6, timestamp = ?7, dirty = ?8, content = ?9
                 WHERE id = ?1",
                params![
                    id,
                    collection.key,
                    collection.name,
                    collection.parent_key,
                    collection.size,
                    collection.etag,
                    collection.timestamp,
                    collection.dirty,
                    collection.content
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found(
                    EntityKind::Collection,
                    collection.key.as_str(),
                ));
            }
            Ok(id)
        }
        None => Ok(conn.query_row(
            "INSERT INTO collections (key, name, parent_key, size, etag, timestamp, dirty, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(key) DO UPDATE SET
                name = excluded.name,
                parent_key = excluded.parent_key,
                size = excluded.size,
                etag = excluded.etag,
                timestamp = excluded.timestamp,
                dirty = excluded.dirty,
                content = excluded.content
             RETURNING id",
            params![
                collection.key,
                collection.name,
                collection.parent_key,
                collection.size,
                collection.etag,
                collection.timestamp,
                collection.dirty,
                collection.content
            ],
            |row| row.get(0),
        )?),
    }
}

pub(crate) fn save_attachment_row(conn: &Connection, attachment: &Attachment) -> Result<i64> {
    match attachment.local_id {
        Some(id) => {
            let changed = conn.execute(
                "UPDATE attachments SET key = ?2, parent_key = ?3, title = ?4, url = ?5,
                    status = ?6, etag = ?7, timestamp = ?8, dirty = ?9, content = ?10
                 WHERE id = ?1",
                params![
                    id,
                    attachment.key,
                    attachment.parent_key,
                    attachment.title,
                    attachment.url,
                    attachment.status,
                    attachment.etag,
                    attachment.timestamp,
                    attachment.dirty,
                    attachment.content
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found(
                    EntityKind::Attachment,
                    attachment.key.as_str(),
                ));
            }
            Ok(id)
        }
        None => Ok(conn.query_row(
            "INSERT INTO attachments (key, parent_key, title, url, status, etag, timestamp, dirty, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(key) DO UPDATE SET
                parent_key = excluded.parent_key,
                title = excluded.title,
                url = excluded.url,
                status = excluded.status,
                etag = excluded.etag,
                timestamp = excluded.timestamp,
                dirty = excluded.dirty,
                content = excluded.content
             RETURNING id",
            params![
                attachment.key,
                attachment.parent_key,
                attachment.title,
                attachment.url,
                attachment.status,
                attachment.etag,
                attachment.timestamp,
                attachment.dirty,
                attachment.content
            ],
            |row| row.get(0),
        )?),
    }
}

pub(crate) fn item_from_row(row: &Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        local_id: Some(row.get(0)?),
        key: row.get(1)?,
        item_type: row.get(2)?,
        title: row.get(3)?,
        etag: row.get(4)?,
        timestamp: row.get(5)?,
        dirty: row.get(6)?,
        num_children: row.get(7)?,
        content: row.get(8)?,
    })
}

pub(crate) fn collection_from_row(row: &Row<'_>) -> rusqlite::Result<Collection> {
    Ok(Collection {
        local_id: Some(row.get(0)?),
        key: row.get(1)?,
        name: row.get(2)?,
        parent_key: row.get(3)?,
        size: row.get(4)?,
        etag: row.get(5)?,
        timestamp: row.get(6)?,
        dirty: row.get(7)?,
        content: row.get(8)?,
    })
}

pub(crate) fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        local_id: Some(row.get(0)?),
        key: row.get(1)?,
        parent_key: row.get(2)?,
        title: row.get(3)?,
        url: row.get(4)?,
        status: row.get(5)?,
        etag: row.get(6)?,
        timestamp: row.get(7)?,
        dirty: row.get(8)?,
        content: row.get(9)?,
    })
}
