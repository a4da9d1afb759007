//! Index catalog view
//!
//! A read-only snapshot of index metadata taken at one collection epoch. The
//! analyzer plans exclusively against a snapshot, so planning is a pure
//! function of `(catalog, query)` and safe to run concurrently.

use crate::storage::index::{IndexDescriptor, KeyPattern};

/// Source of index metadata (the `listIndexes` collaborator).
pub trait IndexSource: Send + Sync {
    fn list_indexes(&self) -> Vec<IndexDescriptor>;

    /// Epoch the listed indexes belong to.
    fn catalog_epoch(&self) -> u64;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexCatalog {
    epoch: u64,
    indexes: Vec<IndexDescriptor>,
}

impl IndexCatalog {
    pub fn new(epoch: u64, indexes: Vec<IndexDescriptor>) -> Self {
        Self { epoch, indexes }
    }

    pub fn snapshot<S: IndexSource + ?Sized>(source: &S) -> Self {
        Self::new(source.catalog_epoch(), source.list_indexes())
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn list_indexes(&self) -> &[IndexDescriptor] {
        &self.indexes
    }

    pub fn find_by_name(&self, name: &str) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|idx| idx.name == name)
    }

    pub fn find_by_key_pattern(&self, pattern: &KeyPattern) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|idx| &idx.key_pattern == pattern)
    }

    /// Indexes whose key pattern contains `group_by` at any position.
    pub fn candidate_indexes(&self, group_by: &str) -> Vec<&IndexDescriptor> {
        self.indexes
            .iter()
            .filter(|idx| idx.key_pattern.position_of(group_by).is_some())
            .collect()
    }

    /// True if any key field in positions `0..=upto` is multikey.
    pub fn is_multikey_on_prefix(index: &IndexDescriptor, upto: usize) -> bool {
        index
            .key_pattern
            .fields()
            .iter()
            .take(upto + 1)
            .any(|f| index.is_field_multikey(&f.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::index::IndexSpec;
    use crate::storage::Collection;
    use crate::value::Value;
    use serde_json::json;

    fn fixture() -> Collection {
        let coll = Collection::new("c");
        coll.insert(Value::from_json(json!({"a": 1, "b": [1, 2], "c": 1})))
            .unwrap();
        coll.create_index(IndexSpec::new(KeyPattern::ascending(&["a", "b", "c"])))
            .unwrap();
        coll.create_index(IndexSpec::new(KeyPattern::ascending(&["c"])))
            .unwrap();
        coll
    }

    #[test]
    fn test_candidates_by_field() {
        let catalog = fixture().catalog();
        let names: Vec<_> = catalog
            .candidate_indexes("c")
            .iter()
            .map(|idx| idx.name.clone())
            .collect();
        assert_eq!(names, vec!["a_1_b_1_c_1", "c_1"]);
        assert!(catalog.candidate_indexes("z").is_empty());
    }

    #[test]
    fn test_multikey_on_prefix() {
        let catalog = fixture().catalog();
        let idx = catalog.find_by_name("a_1_b_1_c_1").unwrap();
        assert!(!IndexCatalog::is_multikey_on_prefix(idx, 0));
        assert!(IndexCatalog::is_multikey_on_prefix(idx, 1));
        assert!(IndexCatalog::is_multikey_on_prefix(idx, 2));
    }

    #[test]
    fn test_snapshot_is_immutable() {
        let coll = fixture();
        let before = coll.catalog();
        coll.drop_index("c_1").unwrap();
        assert_eq!(before.list_indexes().len(), 2);
        assert!(coll.catalog().epoch() > before.epoch());
    }
}
