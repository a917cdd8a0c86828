//! Snapshot of everything that still has to go to, or come from, the server.

use crate::model::{Attachment, Collection, DirtyState, Item};
use crate::store::{
    attachment_from_row, collection_from_row, item_from_row, Store, ATTACHMENT_COLUMNS,
    COLLECTION_COLUMNS, ITEM_COLUMNS,
};
use crate::{EntityKind, Result};

/// One non-`CLEAN` entity
#[derive(Debug, Clone, PartialEq)]
pub enum DirtyEntry {
    Item(Item),
    Collection(Collection),
    Attachment(Attachment),
}

impl DirtyEntry {
    pub fn kind(&self) -> EntityKind {
        match self {
            DirtyEntry::Item(_) => EntityKind::Item,
            DirtyEntry::Collection(_) => EntityKind::Collection,
            DirtyEntry::Attachment(_) => EntityKind::Attachment,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            DirtyEntry::Item(item) => &item.key,
            DirtyEntry::Collection(collection) => &collection.key,
            DirtyEntry::Attachment(attachment) => &attachment.key,
        }
    }

    pub fn dirty(&self) -> DirtyState {
        match self {
            DirtyEntry::Item(item) => item.dirty,
            DirtyEntry::Collection(collection) => collection.dirty,
            DirtyEntry::Attachment(attachment) => attachment.dirty,
        }
    }
}

/// Entities whose dirty state is not `CLEAN`, read fresh from storage
///
/// Owned by the caller; nothing else holds or updates it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirtyQueue {
    pub collections: Vec<Collection>,
    pub items: Vec<Item>,
    pub attachments: Vec<Attachment>,
}

impl DirtyQueue {
    /// Full scan of the store
    pub fn snapshot(store: &Store) -> Result<Self> {
        let clean = DirtyState::Clean;

        let sql = format!(
            "SELECT {} FROM collections WHERE dirty != ?1 ORDER BY id",
            COLLECTION_COLUMNS
        );
        let mut stmt = store.conn.prepare(&sql)?;
        let collections = stmt
            .query_map([clean], collection_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let sql = format!("SELECT {} FROM items WHERE dirty != ?1 ORDER BY id", ITEM_COLUMNS);
        let mut stmt = store.conn.prepare(&sql)?;
        let items = stmt
            .query_map([clean], item_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let sql = format!(
            "SELECT {} FROM attachments WHERE dirty != ?1 ORDER BY id",
            ATTACHMENT_COLUMNS
        );
        let mut stmt = store.conn.prepare(&sql)?;
        let attachments = stmt
            .query_map([clean], attachment_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            collections,
            items,
            attachments,
        })
    }

    pub fn len(&self) -> usize {
        self.collections.len() + self.items.len() + self.attachments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collections first, then items, then attachments, each in row order
    pub fn entries(&self) -> impl Iterator<Item = DirtyEntry> + '_ {
        self.collections
            .iter()
            .cloned()
            .map(DirtyEntry::Collection)
            .chain(self.items.iter().cloned().map(DirtyEntry::Item))
            .chain(self.attachments.iter().cloned().map(DirtyEntry::Attachment))
    }

    pub fn count_in(&self, state: DirtyState) -> usize {
        self.entries().filter(|entry| entry.dirty() == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_reflects_storage_exactly() {
        let mut store = Store::open_in_memory().unwrap();
        assert!(DirtyQueue::snapshot(&store).unwrap().is_empty());

        let draft = store.create_item("book", "Draft", json!({})).unwrap();
        let mut stub = Item::missing("MISS0001");
        store.save_item(&mut stub).unwrap();
        let mut clean = Item::missing("CLEAN001");
        clean.dirty = DirtyState::Clean;
        store.save_item(&mut clean).unwrap();

        let queue = DirtyQueue::snapshot(&store).unwrap();
        assert_eq!(queue.items.len(), 2);
        assert_eq!(queue.count_in(DirtyState::New), 1);
        assert_eq!(queue.count_in(DirtyState::Missing), 1);

        // A later snapshot drops what has since been deleted
        store.delete_item(&draft.key).unwrap();
        let queue = DirtyQueue::snapshot(&store).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.items[0].key, "MISS0001");
    }

    #[test]
    fn test_entries_order_collections_first() {
        let mut store = Store::open_in_memory().unwrap();
        let item = store.create_item("book", "Draft", json!({})).unwrap();
        store.create_collection("Reading", None).unwrap();
        store.create_attachment(&item.key, "a.pdf", json!({})).unwrap();

        let queue = DirtyQueue::snapshot(&store).unwrap();
        let kinds: Vec<_> = queue
            .entries()
            .map(|entry| match entry {
                DirtyEntry::Collection(_) => "collection",
                DirtyEntry::Item(_) => "item",
                DirtyEntry::Attachment(_) => "attachment",
            })
            .collect();
        assert_eq!(kinds, vec!["collection", "item", "attachment"]);
    }
}
