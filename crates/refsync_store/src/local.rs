//! Mutations made on this device.
//!
//! These are the only writers besides the reconciler. They never touch
//! etags or timestamps, and deletes leave tombstones behind for anything
//! the server already knows about.

use crate::ledger::{self, NewRequest, RequestKind};
use crate::model::{
    temporary_key, Attachment, AttachmentStatus, Collection, DirtyState, Item, Tombstone,
};
use crate::store::{self, Store};
use crate::{EntityKind, Result, StoreError};
use rusqlite::{params, Connection};
use serde_json::Value;

impl Store {
    /// Create an item offline under a temporary key
    pub fn create_item(&mut self, item_type: &str, title: &str, content: Value) -> Result<Item> {
        let mut item = Item {
            local_id: None,
            key: temporary_key(),
            item_type: item_type.to_string(),
            title: title.to_string(),
            etag: None,
            timestamp: None,
            dirty: DirtyState::New,
            num_children: 0,
            content: Some(content),
        };
        self.save_item(&mut item)?;
        tracing::info!("Created item {}", item.key);
        Ok(item)
    }

    pub fn create_collection(&mut self, name: &str, parent_key: Option<&str>) -> Result<Collection> {
        if let Some(parent) = parent_key {
            if !self.contains(EntityKind::Collection, parent)? {
                return Err(StoreError::not_found(EntityKind::Collection, parent));
            }
        }
        let mut collection = Collection {
            local_id: None,
            key: temporary_key(),
            name: name.to_string(),
            parent_key: parent_key.map(str::to_string),
            size: 0,
            etag: None,
            timestamp: None,
            dirty: DirtyState::New,
            content: Some(serde_json::json!({ "name": name })),
        };
        self.save_collection(&mut collection)?;
        tracing::info!("Created collection {}", collection.key);
        Ok(collection)
    }

    /// Create an attachment owned by `parent_key`
    pub fn create_attachment(
        &mut self,
        parent_key: &str,
        title: &str,
        content: Value,
    ) -> Result<Attachment> {
        if !self.contains(EntityKind::Item, parent_key)? {
            return Err(StoreError::not_found(EntityKind::Item, parent_key));
        }
        let mut attachment = Attachment {
            local_id: None,
            key: temporary_key(),
            parent_key: Some(parent_key.to_string()),
            title: title.to_string(),
            url: None,
            status: AttachmentStatus::Local,
            etag: None,
            timestamp: None,
            dirty: DirtyState::New,
            content: Some(content),
        };
        self.save_attachment(&mut attachment)?;
        Ok(attachment)
    }

    /// Replace an item's content; `CLEAN` items become `DIRTY`
    ///
    /// Every edit advances the row's revision.
    pub fn update_item_content(&mut self, key: &str, title: &str, content: Value) -> Result<Item> {
        let mut item = self
            .item_by_key(key)?
            .ok_or_else(|| StoreError::not_found(EntityKind::Item, key))?;
        item.title = title.to_string();
        item.content = Some(content);
        item.dirty = item.dirty.after_local_edit();
        let id = self.save_item(&mut item)?;
        store::bump_revision(&self.conn, EntityKind::Item, id)?;
        Ok(item)
    }

    pub fn rename_collection(&mut self, key: &str, name: &str) -> Result<Collection> {
        let mut collection = self
            .collection_by_key(key)?
            .ok_or_else(|| StoreError::not_found(EntityKind::Collection, key))?;
        collection.name = name.to_string();
        let mut content = collection
            .content
            .take()
            .unwrap_or_else(|| serde_json::json!({}));
        if let Some(map) = content.as_object_mut() {
            map.insert("name".to_string(), Value::String(name.to_string()));
        }
        collection.content = Some(content);
        collection.dirty = collection.dirty.after_local_edit();
        let id = self.save_collection(&mut collection)?;
        store::bump_revision(&self.conn, EntityKind::Collection, id)?;
        Ok(collection)
    }

    pub fn update_attachment_content(
        &mut self,
        key: &str,
        title: &str,
        content: Value,
    ) -> Result<Attachment> {
        let mut attachment = self
            .attachment_by_key(key)?
            .ok_or_else(|| StoreError::not_found(EntityKind::Attachment, key))?;
        attachment.title = title.to_string();
        attachment.content = Some(content);
        attachment.dirty = attachment.dirty.after_local_edit();
        let id = self.save_attachment(&mut attachment)?;
        store::bump_revision(&self.conn, EntityKind::Attachment, id)?;
        Ok(attachment)
    }

    /// Download-layer status change; never dirties the attachment
    pub fn set_attachment_status(&mut self, key: &str, status: AttachmentStatus) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE attachments SET status = ?2 WHERE key = ?1",
            params![key, status],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found(EntityKind::Attachment, key));
        }
        Ok(())
    }

    /// Delete an item, its attachments and its memberships
    ///
    /// Returns the number of tombstones written.
    pub fn delete_item(&mut self, key: &str) -> Result<usize> {
        let item = self
            .item_by_key(key)?
            .ok_or_else(|| StoreError::not_found(EntityKind::Item, key))?;
        let attachments = self.attachments_for_item(key)?;

        let tx = self.conn.transaction()?;
        let mut tombstones = 0;
        for attachment in &attachments {
            tombstones += remove_entity(
                &tx,
                EntityKind::Attachment,
                &attachment.key,
                attachment.dirty,
                &attachment.etag,
            )?;
        }
        tombstones += remove_entity(&tx, EntityKind::Item, &item.key, item.dirty, &item.etag)?;
        tx.commit()?;

        tracing::info!(
            "Deleted item {} with {} attachments ({} tombstones)",
            key,
            attachments.len(),
            tombstones
        );
        Ok(tombstones)
    }

    /// Delete a collection; sub-collections move to the top level
    pub fn delete_collection(&mut self, key: &str) -> Result<usize> {
        let collection = self
            .collection_by_key(key)?
            .ok_or_else(|| StoreError::not_found(EntityKind::Collection, key))?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE collections SET parent_key = NULL WHERE parent_key = ?1",
            [key],
        )?;
        let tombstones = remove_entity(
            &tx,
            EntityKind::Collection,
            &collection.key,
            collection.dirty,
            &collection.etag,
        )?;
        tx.commit()?;
        Ok(tombstones)
    }

    pub fn delete_attachment(&mut self, key: &str) -> Result<usize> {
        let attachment = self
            .attachment_by_key(key)?
            .ok_or_else(|| StoreError::not_found(EntityKind::Attachment, key))?;

        let tx = self.conn.transaction()?;
        let tombstones = remove_entity(
            &tx,
            EntityKind::Attachment,
            &attachment.key,
            attachment.dirty,
            &attachment.etag,
        )?;
        tx.commit()?;
        Ok(tombstones)
    }

    pub fn tombstones(&self) -> Result<Vec<Tombstone>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, kind, key, etag, deleted_at FROM tombstones ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut tombstones = Vec::new();
        for row in rows {
            let (id, kind, key, etag, deleted_at) = row?;
            let kind = EntityKind::parse(&kind)
                .ok_or_else(|| StoreError::InvalidState(format!("bad tombstone kind '{}'", kind)))?;
            tombstones.push(Tombstone {
                id,
                kind,
                key,
                etag,
                deleted_at,
            });
        }
        Ok(tombstones)
    }

    /// Whether this device deleted the entity and the server may still list it
    ///
    /// True while a tombstone or an unpruned delete request names the key.
    pub fn deletion_pending(&self, kind: EntityKind, key: &str) -> Result<bool> {
        let pending: i64 = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM tombstones WHERE kind = ?1 AND key = ?2)
                 OR EXISTS (SELECT 1 FROM ledger WHERE kind = ?3 AND subject_key = ?2)",
            params![kind.as_str(), key, RequestKind::Delete],
            |row| row.get(0),
        )?;
        Ok(pending != 0)
    }

    /// Turn every tombstone into a ledger entry and clear them, atomically
    pub fn take_tombstones<F>(&mut self, mut to_request: F) -> Result<Vec<crate::LedgerEntry>>
    where
        F: FnMut(&Tombstone) -> NewRequest,
    {
        let tombstones = self.tombstones()?;
        let credential = self.credential.clone();

        let tx = self.conn.transaction()?;
        let mut entries = Vec::with_capacity(tombstones.len());
        for tombstone in &tombstones {
            let request = to_request(tombstone);
            entries.push(ledger::insert_entry(&tx, &request, &credential)?);
            tx.execute("DELETE FROM tombstones WHERE id = ?1", [tombstone.id])?;
        }
        tx.commit()?;
        Ok(entries)
    }
}

/// Deletes one row; writes a tombstone unless it was never pushed
fn remove_entity(
    conn: &Connection,
    kind: EntityKind,
    key: &str,
    dirty: DirtyState,
    etag: &Option<String>,
) -> Result<usize> {
    conn.execute(
        &format!("DELETE FROM {} WHERE key = ?1", store::table_for(kind)),
        [key],
    )?;

    if dirty == DirtyState::New {
        ledger::discard_for_key(conn, key)?;
        return Ok(0);
    }

    conn.execute(
        "INSERT INTO tombstones (kind, key, etag, deleted_at) VALUES (?1, ?2, ?3, ?4)",
        params![kind.as_str(), key, etag, chrono::Utc::now().timestamp()],
    )?;
    Ok(1)
}
