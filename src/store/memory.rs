//! In-process store adapter.

use crate::config::CollectionOptions;
use crate::error::{MqError, Result};
use crate::store::bounded::{BoundedCollection, IdSource};
use crate::store::{Collection, StoreAdapter, TailCursor, TailOptions};
use crate::types::{Record, RecordId, RecordInput};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Store adapter keeping every collection in memory.
///
/// Ids come from one store-wide sequence, so a collection recreated after a
/// drop never reuses ids a reader may already have seen.
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Arc<BoundedCollection>>>,
    ids: IdSource,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            ids: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Look up a collection without creating it.
    pub fn collection(&self, name: &str) -> Option<Arc<BoundedCollection>> {
        self.collections.read().get(name).cloned()
    }

    /// Drop a collection. Open cursors on it end; the next create starts empty.
    pub fn drop_collection(&self, name: &str) -> bool {
        match self.collections.write().remove(name) {
            Some(collection) => {
                collection.drop_collection();
                true
            }
            None => false,
        }
    }

    /// End every open cursor on a collection, keeping its data.
    pub fn break_cursors(&self, name: &str) -> bool {
        match self.collection(name) {
            Some(collection) => {
                collection.break_cursors();
                true
            }
            None => false,
        }
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreAdapter for MemoryStore {
    fn create_bounded_collection(
        &self,
        name: &str,
        options: &CollectionOptions,
    ) -> Result<Arc<dyn Collection>> {
        let mut collections = self.collections.write();
        let collection = collections
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(BoundedCollection::with_id_source(
                    name,
                    *options,
                    Arc::clone(&self.ids),
                ))
            })
            .clone();
        Ok(Arc::new(MemoryCollection { inner: collection }))
    }
}

/// Collection handle returned by [`MemoryStore`].
struct MemoryCollection {
    inner: Arc<BoundedCollection>,
}

impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn insert(&self, input: RecordInput, _durable: bool) -> Result<Record> {
        self.inner.insert(input)
    }

    fn find_latest(&self, at: Option<RecordId>) -> Result<Option<Record>> {
        self.inner.find_latest(at)
    }

    fn tail(&self, after: RecordId, options: TailOptions) -> Result<Box<dyn TailCursor>> {
        if self.inner.is_dropped() {
            return Err(MqError::CollectionDropped(self.inner.name().to_string()));
        }
        Ok(Box::new(self.inner.cursor(after, options)?))
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_create_is_idempotent() {
        let store = MemoryStore::new();
        let opts = CollectionOptions::default();

        let a = store.create_bounded_collection("news", &opts).unwrap();
        a.insert(RecordInput::message("e", json!(1)), true).unwrap();

        let b = store.create_bounded_collection("news", &opts).unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(store.collection_names(), vec!["news".to_string()]);
    }

    #[test]
    fn test_ids_do_not_restart_after_drop() {
        let store = MemoryStore::new();
        let opts = CollectionOptions::default();

        let a = store.create_bounded_collection("news", &opts).unwrap();
        let first = a.insert(RecordInput::message("e", json!(1)), true).unwrap();
        assert!(store.drop_collection("news"));
        assert!(a.insert(RecordInput::message("e", json!(2)), true).is_err());

        let b = store.create_bounded_collection("news", &opts).unwrap();
        assert!(b.is_empty());
        let second = b.insert(RecordInput::message("e", json!(3)), true).unwrap();
        assert!(second.id > first.id);
    }

    #[test]
    fn test_tail_on_dropped_handle_fails() {
        let store = MemoryStore::new();
        let a = store
            .create_bounded_collection("news", &CollectionOptions::default())
            .unwrap();
        store.drop_collection("news");
        let result = a.tail(RecordId(0), TailOptions::new(Duration::from_millis(10)));
        assert!(matches!(result, Err(MqError::CollectionDropped(_))));
    }

    #[test]
    fn test_unknown_collection_ops() {
        let store = MemoryStore::new();
        assert!(!store.drop_collection("missing"));
        assert!(!store.break_cursors("missing"));
        assert!(store.collection("missing").is_none());
    }
}
