//! Secondary index implementation
//!
//! An index is a sorted run of `(key, record id)` entries. Key order honours
//! every field's direction and the index collation, so a forward walk over
//! `entries()` is the index's native sort order.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_64;

use crate::collation::Collation;
use crate::document::{extract_index_values, is_path_prefix, validate_path};
use crate::error::{KeyseekError, Result};
use crate::storage::RecordId;
use crate::value::Value;

/// Per-field index direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyDirection {
    Ascending,
    Descending,
    Hashed,
}

impl KeyDirection {
    /// Parse `1`, `-1` or `"hashed"`.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(d) if d > 0.0 => Ok(KeyDirection::Ascending),
                Some(d) if d < 0.0 => Ok(KeyDirection::Descending),
                _ => Err(KeyseekError::InvalidPipeline(format!(
                    "invalid key direction: {}",
                    n
                ))),
            },
            serde_json::Value::String(s) if s == "hashed" => Ok(KeyDirection::Hashed),
            other => Err(KeyseekError::InvalidPipeline(format!(
                "invalid key direction: {}",
                other
            ))),
        }
    }

    pub fn to_json(self) -> serde_json::Value {
        match self {
            KeyDirection::Ascending => serde_json::json!(1),
            KeyDirection::Descending => serde_json::json!(-1),
            KeyDirection::Hashed => serde_json::json!("hashed"),
        }
    }

    pub fn reversed(self) -> Self {
        match self {
            KeyDirection::Ascending => KeyDirection::Descending,
            KeyDirection::Descending => KeyDirection::Ascending,
            KeyDirection::Hashed => KeyDirection::Hashed,
        }
    }
}

/// One `(path, direction)` component of a key pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyField {
    pub path: String,
    pub direction: KeyDirection,
}

impl KeyField {
    pub fn new(path: impl Into<String>, direction: KeyDirection) -> Self {
        Self {
            path: path.into(),
            direction,
        }
    }
}

/// Ordered key pattern, e.g. `{a: 1, b: -1}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct KeyPattern {
    fields: Vec<KeyField>,
}

impl KeyPattern {
    pub fn new(fields: Vec<KeyField>) -> Self {
        Self { fields }
    }

    /// Shorthand for all-ascending patterns.
    pub fn ascending(paths: &[&str]) -> Self {
        Self::new(
            paths
                .iter()
                .map(|p| KeyField::new(*p, KeyDirection::Ascending))
                .collect(),
        )
    }

    /// Parse a JSON key pattern object. Field order is significant.
    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        let obj = json
            .as_object()
            .ok_or_else(|| KeyseekError::InvalidPipeline("key pattern must be an object".into()))?;

        let fields = obj
            .iter()
            .map(|(path, dir)| Ok(KeyField::new(path.clone(), KeyDirection::from_json(dir)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(fields))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|f| (f.path.clone(), f.direction.to_json()))
                .collect(),
        )
    }

    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn position_of(&self, path: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.path == path)
    }

    /// Name an index gets when none is supplied: `a_1_b_-1`.
    pub fn default_name(&self) -> String {
        self.fields
            .iter()
            .map(|f| {
                let dir = match f.direction {
                    KeyDirection::Ascending => "1",
                    KeyDirection::Descending => "-1",
                    KeyDirection::Hashed => "hashed",
                };
                format!("{}_{}", f.path, dir)
            })
            .collect::<Vec<_>>()
            .join("_")
    }

    fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(KeyseekError::InvalidPipeline("key pattern is empty".into()));
        }
        let mut seen = BTreeSet::new();
        for field in &self.fields {
            validate_path(&field.path).map_err(KeyseekError::InvalidPipeline)?;
            if !seen.insert(field.path.as_str()) {
                return Err(KeyseekError::InvalidPipeline(format!(
                    "field '{}' appears twice in key pattern",
                    field.path
                )));
            }
        }
        let hashed = self
            .fields
            .iter()
            .filter(|f| f.direction == KeyDirection::Hashed)
            .count();
        if hashed > 1 {
            return Err(KeyseekError::InvalidPipeline(
                "a key pattern may contain at most one hashed field".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Request to build an index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub key: KeyPattern,
    #[serde(default)]
    pub collation: Option<Collation>,
}

impl IndexSpec {
    pub fn new(key: KeyPattern) -> Self {
        Self {
            name: None,
            key,
            collation: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = Collation::normalize(Some(collation));
        self
    }

    pub fn resolved_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.key.default_name())
    }
}

/// Read-only description of an index, as the planner sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDescriptor {
    pub name: String,
    pub key_pattern: KeyPattern,
    /// Stored paths known to hold arrays in at least one document.
    pub multikey_paths: BTreeSet<String>,
    pub collation: Option<Collation>,
}

impl IndexDescriptor {
    pub fn is_multikey(&self) -> bool {
        !self.multikey_paths.is_empty()
    }

    /// A field is multikey if an array was seen at the field or any ancestor path.
    pub fn is_field_multikey(&self, path: &str) -> bool {
        self.multikey_paths.iter().any(|mk| is_path_prefix(mk, path))
    }

    pub fn direction_at(&self, position: usize) -> Option<KeyDirection> {
        self.key_pattern.fields().get(position).map(|f| f.direction)
    }
}

pub type IndexKey = SmallVec<[Value; 4]>;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub key: IndexKey,
    pub record_id: RecordId,
}

/// Sorted entry storage for one index.
#[derive(Debug, Clone)]
pub struct IndexStore {
    descriptor: IndexDescriptor,
    entries: Vec<IndexEntry>,
}

impl IndexStore {
    pub fn new(spec: &IndexSpec) -> Result<Self> {
        spec.key.validate()?;
        Ok(Self {
            descriptor: IndexDescriptor {
                name: spec.resolved_name(),
                key_pattern: spec.key.clone(),
                multikey_paths: BTreeSet::new(),
                collation: Collation::normalize(spec.collation.clone()),
            },
            entries: Vec::new(),
        })
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Generate and insert every key `doc` produces.
    pub fn insert_document(&mut self, record_id: RecordId, doc: &Value) {
        let mut per_field: Vec<Vec<Value>> = Vec::with_capacity(self.descriptor.key_pattern.len());

        for field in self.descriptor.key_pattern.fields() {
            let extraction = extract_index_values(doc, &field.path);
            self.descriptor
                .multikey_paths
                .extend(extraction.multikey_paths.iter().cloned());

            let values = if field.direction == KeyDirection::Hashed {
                extraction.values.iter().map(hash_value).collect()
            } else {
                extraction.values
            };
            per_field.push(values);
        }

        for key in cartesian_keys(&per_field) {
            let entry = IndexEntry { key, record_id };
            let pos = self
                .entries
                .partition_point(|e| self.compare_entries(e, &entry) == Ordering::Less);
            self.entries.insert(pos, entry);
        }
    }

    pub fn remove_record(&mut self, record_id: RecordId) {
        self.entries.retain(|e| e.record_id != record_id);
    }

    /// Compare one key component in index order.
    pub fn compare_component(&self, position: usize, a: &Value, b: &Value) -> Ordering {
        match self.descriptor.direction_at(position) {
            Some(KeyDirection::Descending) => {
                a.compare(b, self.descriptor.collation.as_ref()).reverse()
            }
            Some(KeyDirection::Hashed) => a.total_cmp(b),
            _ => a.compare(b, self.descriptor.collation.as_ref()),
        }
    }

    /// Compare the first `len` components of two keys in index order.
    pub fn compare_prefix(&self, a: &[Value], b: &[Value], len: usize) -> Ordering {
        for pos in 0..len {
            let (Some(x), Some(y)) = (a.get(pos), b.get(pos)) else {
                break;
            };
            let ord = self.compare_component(pos, x, y);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Entry range whose leading components equal `prefix`.
    pub fn range_for_prefix(&self, prefix: &[Value]) -> Range<usize> {
        let len = prefix.len();
        let lo = self
            .entries
            .partition_point(|e| self.compare_prefix(&e.key, prefix, len) == Ordering::Less);
        let hi = self
            .entries
            .partition_point(|e| self.compare_prefix(&e.key, prefix, len) != Ordering::Greater);
        lo..hi
    }

    pub fn compare_entries(&self, a: &IndexEntry, b: &IndexEntry) -> Ordering {
        self.compare_prefix(&a.key, &b.key, self.descriptor.key_pattern.len())
            .then_with(|| a.record_id.cmp(&b.record_id))
    }
}

fn cartesian_keys(per_field: &[Vec<Value>]) -> Vec<IndexKey> {
    let mut keys: Vec<IndexKey> = vec![IndexKey::new()];
    for values in per_field {
        let mut next = Vec::with_capacity(keys.len() * values.len().max(1));
        for prefix in &keys {
            for value in values {
                let mut key = prefix.clone();
                key.push(value.clone());
                next.push(key);
            }
        }
        keys = next;
    }
    keys
}

/// Hash used by hashed key fields. Integral doubles hash like the equal integer.
pub fn hash_value(value: &Value) -> Value {
    let normalized = match value {
        Value::Float64(f) if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < -(i64::MIN as f64) => {
            Value::Int64(*f as i64)
        }
        other => other.clone(),
    };
    let bytes = bincode::serialize(&normalized).unwrap_or_default();
    Value::Int64(xxh3_64(&bytes) as i64)
}
