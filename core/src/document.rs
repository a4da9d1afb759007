//! Field path resolution
//!
//! Three flavours of dotted-path lookup live here because they disagree on
//! arrays:
//!
//! * index keys expand arrays into one key per element and report every path
//!   prefix at which an array was seen (the multikey paths),
//! * query predicates see both the expanded elements and the array itself,
//! * aggregation expressions map the remaining path over array elements and
//!   return an array.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::value::Value;

/// Values an index stores for one key field of one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyExtraction {
    pub values: Vec<Value>,
    /// Path prefixes (e.g. `"tags"` or `"items"` for `"items.sku"`) holding arrays.
    pub multikey_paths: Vec<String>,
}

impl KeyExtraction {
    pub fn is_multikey(&self) -> bool {
        !self.multikey_paths.is_empty()
    }
}

/// True when `prefix` equals `path` or is a leading dotted component of it.
pub fn is_path_prefix(prefix: &str, path: &str) -> bool {
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'.')
}

/// Check a dotted path is structurally valid: no empty components, no `$` prefix.
pub fn validate_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("field path is empty".into());
    }
    for part in path.split('.') {
        if part.is_empty() {
            return Err(format!("field path '{}' has an empty component", path));
        }
        if part.starts_with('$') {
            return Err(format!(
                "field path component '{}' in '{}' may not start with '$'",
                part, path
            ));
        }
    }
    Ok(())
}

/// Index-key semantics for `path` in `doc`.
pub fn extract_index_values(doc: &Value, path: &str) -> KeyExtraction {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = KeyExtraction::default();
    walk_keys(doc, &parts, String::new(), false, &mut out);
    dedup_values(&mut out.values);
    out.multikey_paths.sort();
    out.multikey_paths.dedup();
    out
}

/// Query-predicate semantics: every value a predicate on `path` may match.
pub fn query_candidates(doc: &Value, path: &str) -> Vec<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = KeyExtraction::default();
    walk_keys(doc, &parts, String::new(), true, &mut out);
    out.values
}

fn walk_keys(
    current: &Value,
    parts: &[&str],
    walked: String,
    include_arrays: bool,
    out: &mut KeyExtraction,
) {
    let Some((head, rest)) = parts.split_first() else {
        match current {
            Value::Array(items) => {
                out.multikey_paths.push(walked);
                if include_arrays || items.is_empty() {
                    out.values.push(current.clone());
                }
                out.values.extend(items.iter().cloned());
            }
            other => out.values.push(other.clone()),
        }
        return;
    };

    match current {
        Value::Object(map) => match map.get(*head) {
            Some(next) => walk_keys(next, rest, join_path(&walked, head), include_arrays, out),
            None => out.values.push(Value::Null),
        },
        Value::Array(items) => {
            out.multikey_paths.push(walked.clone());
            let before = out.values.len();
            for item in items {
                if item.as_object().is_some() {
                    walk_keys(item, parts, walked.clone(), include_arrays, out);
                }
            }
            if out.values.len() == before {
                out.values.push(Value::Null);
            }
        }
        _ => out.values.push(Value::Null),
    }
}

fn join_path(prefix: &str, part: &str) -> String {
    if prefix.is_empty() {
        part.to_string()
    } else {
        format!("{}.{}", prefix, part)
    }
}

fn dedup_values(values: &mut Vec<Value>) {
    values.sort_by(|a, b| a.total_cmp(b));
    values.dedup_by(|a, b| a.total_cmp(b) == Ordering::Equal);
}

/// Aggregation-expression semantics. `None` means the path is missing.
pub fn resolve_path(doc: &Value, path: &str) -> Option<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    resolve_parts(doc, &parts)
}

fn resolve_parts(current: &Value, parts: &[&str]) -> Option<Value> {
    let Some((head, rest)) = parts.split_first() else {
        return Some(current.clone());
    };

    match current {
        Value::Object(map) => map.get(*head).and_then(|next| resolve_parts(next, rest)),
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter(|item| item.as_object().is_some())
                .filter_map(|item| resolve_parts(item, parts))
                .collect(),
        )),
        _ => None,
    }
}

/// Set `path` inside `target`, creating intermediate objects as needed.
pub fn set_path(target: &mut BTreeMap<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(BTreeMap::new()));
            if !matches!(entry, Value::Object(_)) {
                *entry = Value::Object(BTreeMap::new());
            }
            if let Value::Object(inner) = entry {
                set_path(inner, rest, value);
            }
        }
    }
}
