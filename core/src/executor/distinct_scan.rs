//! DISTINCT_SCAN execution
//!
//! Walks the chosen index once per distinct value of the group-by field. For
//! `$first` (and key-only groups) the cursor emits the first entry of each
//! run and then seeks past every remaining entry sharing the `0..=pivot`
//! prefix. For `$last` it walks the run and keeps its final entry, so each
//! document is still fetched at most once per group.
//!
//! The scan holds no lock between calls to [`DistinctScan::advance`]. Each
//! call re-acquires the read lock and compares the collection epoch with the
//! one the plan was built against; any write in between yields
//! [`KeyseekError::ScanInvalidated`] and the scan never resumes.

use std::cmp::Ordering;
use std::ops::Range;
use std::sync::Arc;

use serde::Serialize;
use tracing::{trace, warn};

use crate::error::{KeyseekError, Result};
use crate::query::{AccumulatorMode, AccumulatorSource, ScanDirection, ScanPlan};
use crate::storage::{Collection, IndexKey, IndexStore, RecordId};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Cursor on the first entry of the next group.
    Positioned(usize),
    /// Cursor just past a group, on the entry that starts the next one.
    AtGroupBoundary(usize),
    Exhausted,
    Invalidated { observed_epoch: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStats {
    pub keys_examined: u64,
    pub docs_examined: u64,
    pub seeks: u64,
}

/// One group's representative entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DistinctRow {
    /// Group-by value as stored in the index.
    pub group_value: Value,
    /// Full key of the representative entry.
    pub key: IndexKey,
    pub record_id: RecordId,
    /// Present only when the plan requires a fetch.
    pub document: Option<Value>,
}

impl DistinctRow {
    /// Build the `$group` output document for this row.
    pub fn to_group_document(&self, plan: &ScanPlan) -> Result<Value> {
        let mut out = std::collections::BTreeMap::new();
        out.insert(
            "_id".to_string(),
            plan.group.id.from_field_value(self.group_value.clone()),
        );
        for (acc, source) in plan.group.accumulators.iter().zip(&plan.sources) {
            let value = match (source, &self.document) {
                (AccumulatorSource::Covered(pos), _) => {
                    self.key.get(*pos).cloned().unwrap_or(Value::Null)
                }
                (AccumulatorSource::Fetched, Some(doc)) => {
                    acc.expr.evaluate(doc)?.unwrap_or(Value::Null)
                }
                (AccumulatorSource::Fetched, None) => Value::Null,
            };
            out.insert(acc.output.clone(), value);
        }
        Ok(Value::Object(out))
    }
}

pub struct DistinctScan {
    collection: Arc<Collection>,
    plan: ScanPlan,
    range: Range<usize>,
    state: ScanState,
    stats: ScanStats,
}

impl DistinctScan {
    /// Position a scan at the start of its bounds.
    pub fn open(collection: Arc<Collection>, plan: ScanPlan) -> Result<Self> {
        let range = {
            let state = collection.read_state();
            let observed = collection.epoch();
            if observed != plan.catalog_epoch {
                return Err(invalidated(&plan, observed));
            }
            let index = state
                .index(&plan.index.name)
                .ok_or_else(|| KeyseekError::IndexNotFound(plan.index.name.clone()))?;
            let prefix: Vec<Value> = plan
                .bounds
                .iter()
                .map_while(|b| match b {
                    crate::query::Bounds::Point(v) => Some(v.clone()),
                    crate::query::Bounds::Full => None,
                })
                .collect();
            index.range_for_prefix(&prefix)
        };

        let state = if range.is_empty() {
            ScanState::Exhausted
        } else {
            match plan.direction {
                ScanDirection::Forward => ScanState::Positioned(range.start),
                ScanDirection::Backward => ScanState::Positioned(range.end - 1),
            }
        };

        Ok(Self {
            collection,
            plan,
            range,
            state,
            stats: ScanStats {
                seeks: 1,
                ..ScanStats::default()
            },
        })
    }

    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Produce the next group's representative, or `None` once exhausted.
    pub fn advance(&mut self) -> Result<Option<DistinctRow>> {
        let pos = match self.state {
            ScanState::Exhausted => return Ok(None),
            ScanState::Invalidated { observed_epoch } => {
                return Err(invalidated(&self.plan, observed_epoch));
            }
            ScanState::Positioned(pos) | ScanState::AtGroupBoundary(pos) => pos,
        };

        let collection = Arc::clone(&self.collection);
        let state = collection.read_state();
        let observed = collection.epoch();
        let index = match state.index(&self.plan.index.name) {
            Some(index) if observed == self.plan.catalog_epoch => index,
            _ => {
                warn!(
                    index = %self.plan.index.name,
                    expected = self.plan.catalog_epoch,
                    observed,
                    "DISTINCT_SCAN invalidated by concurrent write"
                );
                self.state = ScanState::Invalidated {
                    observed_epoch: observed,
                };
                return Err(invalidated(&self.plan, observed));
            }
        };

        let prefix_len = self.plan.pivot + 1;
        let (representative, next) = match self.plan.mode {
            AccumulatorMode::Last => {
                let (last, next) = self.scan_run(index, pos, prefix_len);
                (last, next)
            }
            AccumulatorMode::First | AccumulatorMode::KeyOnly => {
                self.stats.keys_examined += 1;
                self.stats.seeks += 1;
                (pos, self.seek_past(index, pos, prefix_len))
            }
        };

        let entries = index.entries();
        let leader = &entries[pos];
        let entry = &entries[representative];
        let document = if self.plan.fetch_required {
            self.stats.docs_examined += 1;
            state.document(entry.record_id).cloned()
        } else {
            None
        };

        let row = DistinctRow {
            group_value: leader.key[self.plan.pivot].clone(),
            key: entry.key.clone(),
            record_id: entry.record_id,
            document,
        };

        self.state = match next {
            Some(next) => {
                trace!(index = %self.plan.index.name, from = pos, to = next, "Seek to next group");
                ScanState::AtGroupBoundary(next)
            }
            None => ScanState::Exhausted,
        };

        Ok(Some(row))
    }

    /// First entry of the next group in walk order.
    fn seek_past(&self, index: &IndexStore, pos: usize, prefix_len: usize) -> Option<usize> {
        let entries = index.entries();
        let current = &entries[pos].key;
        match self.plan.direction {
            ScanDirection::Forward => {
                let offset = entries[pos..self.range.end].partition_point(|e| {
                    index.compare_prefix(&e.key, current, prefix_len) != Ordering::Greater
                });
                let next = pos + offset;
                (next < self.range.end).then_some(next)
            }
            ScanDirection::Backward => {
                let start = self.range.start;
                let offset = entries[start..=pos].partition_point(|e| {
                    index.compare_prefix(&e.key, current, prefix_len) == Ordering::Less
                });
                let first_of_group = start + offset;
                (first_of_group > start).then(|| first_of_group - 1)
            }
        }
    }

    /// Walk one run of equal prefixes. Returns the run's last entry in walk
    /// order and the entry after it.
    fn scan_run(&mut self, index: &IndexStore, pos: usize, prefix_len: usize) -> (usize, Option<usize>) {
        let entries = index.entries();
        let mut last = pos;
        let mut cursor = Some(pos);
        while let Some(i) = cursor {
            if index.compare_prefix(&entries[i].key, &entries[pos].key, prefix_len) != Ordering::Equal {
                break;
            }
            self.stats.keys_examined += 1;
            last = i;
            cursor = self.step(i);
        }
        (last, cursor)
    }

    fn step(&self, i: usize) -> Option<usize> {
        match self.plan.direction {
            ScanDirection::Forward => (i + 1 < self.range.end).then_some(i + 1),
            ScanDirection::Backward => (i > self.range.start).then(|| i - 1),
        }
    }
}

impl Iterator for DistinctScan {
    type Item = Result<DistinctRow>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

fn invalidated(plan: &ScanPlan, observed_epoch: u64) -> KeyseekError {
    KeyseekError::ScanInvalidated {
        index: plan.index.name.clone(),
        expected_epoch: plan.catalog_epoch,
        observed_epoch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerConfig;
    use crate::query::{Analyzer, Eligibility, GroupSpec, QueryShape};
    use crate::query::{AccumulatorOp, Expr, SortDirection, SortSpec};
    use crate::storage::{IndexSpec, KeyPattern};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn collection(docs: serde_json::Value, pattern: serde_json::Value) -> Arc<Collection> {
        let coll = Arc::new(Collection::new("test"));
        for d in docs.as_array().unwrap() {
            coll.insert(Value::from_json(d.clone())).unwrap();
        }
        coll.create_index(IndexSpec::new(KeyPattern::from_json(&pattern).unwrap()))
            .unwrap();
        coll
    }

    fn plan(coll: &Collection, shape: QueryShape) -> ScanPlan {
        let catalog = coll.catalog();
        let config = PlannerConfig::default();
        match Analyzer::new(&catalog, &config).analyze(&shape).unwrap() {
            Eligibility::Eligible(plan) => *plan,
            Eligibility::Ineligible(reason) => panic!("ineligible: {}", reason),
        }
    }

    fn group_values(scan: DistinctScan) -> Vec<Value> {
        scan.map(|row| row.unwrap().group_value).collect()
    }

    #[test]
    fn test_one_key_per_group() {
        let coll = collection(
            json!([{"a": 1, "b": 1}, {"a": 1, "b": 2}, {"a": 2, "b": 1}, {"a": 3}, {"a": 3}]),
            json!({"a": 1, "b": 1}),
        );
        let plan = plan(&coll, QueryShape::new(GroupSpec::by_field("a")));
        let mut scan = DistinctScan::open(coll, plan).unwrap();

        let mut values = Vec::new();
        while let Some(row) = scan.advance().unwrap() {
            values.push(row.group_value);
        }
        assert_eq!(values, vec![Value::Int64(1), Value::Int64(2), Value::Int64(3)]);
        assert_eq!(scan.state(), ScanState::Exhausted);
        assert_eq!(scan.stats().keys_examined, 3);
        assert_eq!(scan.stats().docs_examined, 0);
    }

    #[test]
    fn test_backward_walk() {
        let coll = collection(
            json!([{"a": 1, "b": 1}, {"a": 2, "b": 5}, {"a": 2, "b": 7}]),
            json!({"a": 1, "b": 1}),
        );
        let group = GroupSpec::by_field("a").with_accumulator("b", AccumulatorOp::First, Expr::Field("b".into()));
        let shape = QueryShape::new(group).with_sort(SortSpec::new(vec![
            ("a", SortDirection::Descending),
            ("b", SortDirection::Descending),
        ]));
        let plan = plan(&coll, shape);
        assert_eq!(plan.direction, ScanDirection::Backward);

        let docs: Vec<Value> = DistinctScan::open(coll, plan.clone())
            .unwrap()
            .map(|row| row.unwrap().to_group_document(&plan).unwrap())
            .collect();
        assert_eq!(
            docs,
            vec![
                Value::from_json(json!({"_id": 2, "b": 7})),
                Value::from_json(json!({"_id": 1, "b": 1})),
            ]
        );
    }

    #[test]
    fn test_last_scans_whole_run() {
        let coll = collection(
            json!([{"a": 1, "b": 1}, {"a": 1, "b": 2}, {"a": 1, "b": 3}, {"a": 2, "b": 0}]),
            json!({"a": 1, "b": 1}),
        );
        let group = GroupSpec::by_field("a").with_accumulator("doc", AccumulatorOp::Last, Expr::Root);
        let shape = QueryShape::new(group).with_sort(SortSpec::new(vec![
            ("a", SortDirection::Ascending),
            ("b", SortDirection::Ascending),
        ]));
        let plan = plan(&coll, shape);
        let mut scan = DistinctScan::open(coll, plan).unwrap();

        let first = scan.advance().unwrap().unwrap();
        assert_eq!(first.key[1], Value::Int64(3));
        assert!(first.document.is_some());
        let second = scan.advance().unwrap().unwrap();
        assert_eq!(second.key[1], Value::Int64(0));
        assert!(scan.advance().unwrap().is_none());

        assert_eq!(scan.stats().keys_examined, 4);
        assert_eq!(scan.stats().docs_examined, 2);
    }

    #[test]
    fn test_point_prefix_limits_range() {
        let coll = collection(
            json!([{"a": 1, "b": 1}, {"a": 2, "b": 1}, {"a": 2, "b": 2}, {"a": 3, "b": 9}]),
            json!({"a": 1, "b": 1}),
        );
        let shape = QueryShape::new(GroupSpec::by_field("b"))
            .with_equality(crate::query::EqualityPrefix::new().with("a", 2));
        let plan = plan(&coll, shape);
        let scan = DistinctScan::open(coll, plan).unwrap();
        assert_eq!(group_values(scan), vec![Value::Int64(1), Value::Int64(2)]);
    }

    #[test]
    fn test_empty_range_is_exhausted() {
        let coll = collection(json!([]), json!({"a": 1}));
        let plan = plan(&coll, QueryShape::new(GroupSpec::by_field("a")));
        let mut scan = DistinctScan::open(coll, plan).unwrap();
        assert_eq!(scan.state(), ScanState::Exhausted);
        assert!(scan.advance().unwrap().is_none());
    }

    #[test]
    fn test_write_invalidates_scan() {
        let coll = collection(json!([{"a": 1}, {"a": 2}, {"a": 3}]), json!({"a": 1}));
        let plan = plan(&coll, QueryShape::new(GroupSpec::by_field("a")));
        let mut scan = DistinctScan::open(Arc::clone(&coll), plan).unwrap();
        assert!(scan.advance().unwrap().is_some());

        coll.insert(Value::from_json(json!({"a": 0}))).unwrap();

        let err = scan.advance().unwrap_err();
        assert_eq!(err.kind(), "scan_invalidated");
        assert!(matches!(scan.state(), ScanState::Invalidated { .. }));
        // Never resumes.
        assert!(scan.advance().is_err());
    }

    #[test]
    fn test_stale_plan_rejected_at_open() {
        let coll = collection(json!([{"a": 1}]), json!({"a": 1}));
        let plan = plan(&coll, QueryShape::new(GroupSpec::by_field("a")));
        coll.insert(Value::from_json(json!({"a": 2}))).unwrap();
        let err = DistinctScan::open(coll, plan).err().unwrap();
        assert!(err.is_replannable());
    }
}
