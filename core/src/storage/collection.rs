//! In-memory document collection
//!
//! Documents and their secondary indexes live behind one `RwLock`. Every write
//! bumps the collection epoch; readers that outlive a write observe the new
//! epoch and must stop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collation::Collation;
use crate::error::{KeyseekError, Result};
use crate::storage::catalog::{IndexCatalog, IndexSource};
use crate::storage::index::{IndexDescriptor, IndexSpec, IndexStore};
use crate::value::Value;

/// Stable identifier of a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct CollectionState {
    documents: BTreeMap<RecordId, Value>,
    indexes: Vec<IndexStore>,
    next_record_id: u64,
}

impl CollectionState {
    pub fn document(&self, id: RecordId) -> Option<&Value> {
        self.documents.get(&id)
    }

    /// Documents in record-id (insertion) order.
    pub fn documents(&self) -> impl Iterator<Item = (RecordId, &Value)> {
        self.documents.iter().map(|(id, doc)| (*id, doc))
    }

    pub fn index(&self, name: &str) -> Option<&IndexStore> {
        self.indexes.iter().find(|idx| idx.name() == name)
    }

    pub fn indexes(&self) -> &[IndexStore] {
        &self.indexes
    }
}

/// A named collection shared as `Arc<Collection>`.
#[derive(Debug)]
pub struct Collection {
    name: String,
    state: RwLock<CollectionState>,
    epoch: AtomicU64,
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(CollectionState::default()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current write epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub fn len(&self) -> usize {
        self.state.read().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert one document. Only objects can be stored.
    pub fn insert(&self, doc: Value) -> Result<RecordId> {
        if doc.as_object().is_none() {
            return Err(KeyseekError::InvalidDocument(format!(
                "expected an object, got {}",
                doc.type_name()
            )));
        }

        let mut state = self.state.write();
        let id = RecordId(state.next_record_id);
        state.next_record_id += 1;

        for index in state.indexes.iter_mut() {
            index.insert_document(id, &doc);
        }
        state.documents.insert(id, doc);
        self.bump_epoch();

        Ok(id)
    }

    pub fn insert_many<I>(&self, docs: I) -> Result<Vec<RecordId>>
    where
        I: IntoIterator<Item = Value>,
    {
        docs.into_iter().map(|doc| self.insert(doc)).collect()
    }

    /// Remove a document. Returns the removed document, if any.
    pub fn remove(&self, id: RecordId) -> Option<Value> {
        let mut state = self.state.write();
        let removed = state.documents.remove(&id)?;
        for index in state.indexes.iter_mut() {
            index.remove_record(id);
        }
        self.bump_epoch();
        Some(removed)
    }

    pub fn get(&self, id: RecordId) -> Option<Value> {
        self.state.read().documents.get(&id).cloned()
    }

    /// Build a secondary index over all existing documents.
    pub fn create_index(&self, spec: IndexSpec) -> Result<String> {
        let mut state = self.state.write();

        let name = spec.resolved_name();
        if state.indexes.iter().any(|idx| idx.name() == name) {
            return Err(KeyseekError::AlreadyExists(format!("index '{}'", name)));
        }
        let collation = Collation::normalize(spec.collation.clone());
        if state.indexes.iter().any(|idx| {
            idx.descriptor().key_pattern == spec.key && idx.descriptor().collation == collation
        }) {
            return Err(KeyseekError::AlreadyExists(format!(
                "index with key pattern {}",
                spec.key
            )));
        }

        let mut store = IndexStore::new(&spec)?;
        for (id, doc) in state.documents.iter() {
            store.insert_document(*id, doc);
        }

        debug!(
            collection = %self.name,
            index = %name,
            entries = store.len(),
            multikey = store.descriptor().is_multikey(),
            "Built index"
        );

        state.indexes.push(store);
        self.bump_epoch();
        Ok(name)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        let pos = state
            .indexes
            .iter()
            .position(|idx| idx.name() == name)
            .ok_or_else(|| KeyseekError::IndexNotFound(name.to_string()))?;
        state.indexes.remove(pos);
        self.bump_epoch();
        Ok(())
    }

    /// Immutable snapshot of index metadata for planning.
    pub fn catalog(&self) -> IndexCatalog {
        IndexCatalog::snapshot(self)
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, CollectionState> {
        self.state.read()
    }
}

impl IndexSource for Collection {
    fn list_indexes(&self) -> Vec<IndexDescriptor> {
        self.state
            .read()
            .indexes
            .iter()
            .map(|idx| idx.descriptor().clone())
            .collect()
    }

    fn catalog_epoch(&self) -> u64 {
        self.epoch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::index::KeyPattern;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Value {
        Value::from_json(v)
    }

    #[test]
    fn test_insert_and_index_build() {
        let coll = Collection::new("c");
        coll.insert(doc(json!({"a": 1}))).unwrap();
        coll.insert(doc(json!({"a": 2}))).unwrap();

        let name = coll
            .create_index(IndexSpec::new(KeyPattern::ascending(&["a"])))
            .unwrap();
        assert_eq!(name, "a_1");

        coll.insert(doc(json!({"a": 0}))).unwrap();
        let state = coll.read_state();
        assert_eq!(state.index("a_1").unwrap().len(), 3);
    }

    #[test]
    fn test_rejects_non_object_documents() {
        let coll = Collection::new("c");
        let err = coll.insert(Value::Int64(3)).unwrap_err();
        assert_eq!(err.kind(), "invalid_document");
    }

    #[test]
    fn test_every_write_bumps_epoch() {
        let coll = Collection::new("c");
        let e0 = coll.epoch();
        let id = coll.insert(doc(json!({"a": 1}))).unwrap();
        let e1 = coll.epoch();
        coll.create_index(IndexSpec::new(KeyPattern::ascending(&["a"])))
            .unwrap();
        let e2 = coll.epoch();
        coll.remove(id).unwrap();
        let e3 = coll.epoch();
        coll.drop_index("a_1").unwrap();
        let e4 = coll.epoch();
        assert!(e0 < e1 && e1 < e2 && e2 < e3 && e3 < e4);
    }

    #[test]
    fn test_duplicate_and_missing_indexes() {
        let coll = Collection::new("c");
        coll.create_index(IndexSpec::new(KeyPattern::ascending(&["a"])))
            .unwrap();
        let dup = coll
            .create_index(IndexSpec::new(KeyPattern::ascending(&["a"])).named("other"))
            .unwrap_err();
        assert_eq!(dup.kind(), "already_exists");
        assert_eq!(coll.drop_index("nope").unwrap_err().kind(), "index_not_found");
    }
}
