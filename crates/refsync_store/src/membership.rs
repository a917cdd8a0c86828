//! Item/collection membership.
//!
//! Every entry point takes an [`Origin`]: local changes enqueue the
//! matching remote request in the same transaction, remote ones were
//! read from the server and are only recorded.

use crate::ledger::{self, NewRequest};
use crate::model::Origin;
use crate::store::{self, Store};
use crate::{EntityKind, Result, StoreError};
use rusqlite::{params, Connection, OptionalExtension};

fn local_id(conn: &Connection, kind: EntityKind, key: &str) -> Result<i64> {
    conn.query_row(
        &format!("SELECT id FROM {} WHERE key = ?1", store::table_for(kind)),
        [key],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found(kind, key))
}

impl Store {
    /// Put `item_key` into `collection_key`
    ///
    /// Returns `false` when the membership already existed, in which case
    /// nothing is queued either.
    pub fn add_membership(
        &mut self,
        item_key: &str,
        collection_key: &str,
        origin: Origin,
    ) -> Result<bool> {
        let credential = self.credential.clone();
        let tx = self.conn.transaction()?;
        let item_id = local_id(&tx, EntityKind::Item, item_key)?;
        let collection_id = local_id(&tx, EntityKind::Collection, collection_key)?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO collection_items (collection_id, item_id) VALUES (?1, ?2)",
            params![collection_id, item_id],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        if origin == Origin::Local {
            ledger::insert_entry(
                &tx,
                &NewRequest::add_membership(collection_key, item_key),
                &credential,
            )?;
        }
        tx.commit()?;
        tracing::debug!("{} added to {} ({:?})", item_key, collection_key, origin);
        Ok(true)
    }

    /// Take `item_key` out of `collection_key`; `false` if it was not a member
    pub fn remove_membership(
        &mut self,
        item_key: &str,
        collection_key: &str,
        origin: Origin,
    ) -> Result<bool> {
        let credential = self.credential.clone();
        let tx = self.conn.transaction()?;
        let item_id = local_id(&tx, EntityKind::Item, item_key)?;
        let collection_id = local_id(&tx, EntityKind::Collection, collection_key)?;

        let removed = tx.execute(
            "DELETE FROM collection_items WHERE collection_id = ?1 AND item_id = ?2",
            params![collection_id, item_id],
        )?;
        if removed == 0 {
            return Ok(false);
        }

        if origin == Origin::Local {
            ledger::insert_entry(
                &tx,
                &NewRequest::remove_membership(collection_key, item_key),
                &credential,
            )?;
        }
        tx.commit()?;
        tracing::debug!("{} removed from {} ({:?})", item_key, collection_key, origin);
        Ok(true)
    }

    pub fn is_member(&self, item_key: &str, collection_key: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM collection_items ci
                 JOIN items i ON i.id = ci.item_id
                 JOIN collections c ON c.id = ci.collection_id
                 WHERE i.key = ?1 AND c.key = ?2",
                params![item_key, collection_key],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Keys of the items in a collection
    pub fn member_keys(&self, collection_key: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.key FROM collection_items ci
             JOIN items i ON i.id = ci.item_id
             JOIN collections c ON c.id = ci.collection_id
             WHERE c.key = ?1
             ORDER BY i.id",
        )?;
        let keys = stmt
            .query_map([collection_key], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// Count members and persist the cached size
    pub fn recompute_collection_size(&mut self, collection_key: &str) -> Result<u32> {
        let tx = self.conn.transaction()?;
        let collection_id = local_id(&tx, EntityKind::Collection, collection_key)?;
        let size: u32 = tx.query_row(
            "SELECT COUNT(*) FROM collection_items WHERE collection_id = ?1",
            [collection_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE collections SET size = ?2 WHERE id = ?1",
            params![collection_id, size],
        )?;
        tx.commit()?;
        Ok(size)
    }
}
