//! Storage layer: in-memory collections with sorted secondary indexes

pub mod catalog;
pub mod collection;
pub mod index;

pub use catalog::{IndexCatalog, IndexSource};
pub use collection::{Collection, CollectionState, RecordId};
pub use index::{
    IndexDescriptor, IndexEntry, IndexKey, IndexSpec, IndexStore, KeyDirection, KeyField,
    KeyPattern,
};
