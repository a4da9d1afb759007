//! Generic aggregation path
//!
//! Runs any supported pipeline over a collection scan or a plain index scan.
//! Used whenever the analyzer reports the pipeline ineligible for
//! DISTINCT_SCAN, and for the stages that follow `$group` in both paths.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::collation::{Collation, collations_match};
use crate::config::ExecutorConfig;
use crate::error::{KeyseekError, Result};
use crate::query::analyzer::sort_direction;
use crate::query::explain::trailing_names;
use crate::query::{
    AccumulatorOp, Bounds, Explain, GroupKey, GroupSpec, Hint, IneligibleReason, MatchSpec,
    PipelineStage, PlanStage, ScanDirection, SortSpec, StageType,
};
use crate::storage::index::hash_value;
use crate::storage::{Collection, IndexCatalog, IndexDescriptor, KeyDirection, RecordId};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum AccessPath {
    Collscan,
    /// Index scan followed by a FETCH of every matching record.
    Ixscan {
        index: IndexDescriptor,
        bounds: Vec<Bounds>,
        direction: ScanDirection,
    },
}

#[derive(Debug, Clone)]
pub struct FallbackPlan {
    access: AccessPath,
    filter: Option<MatchSpec>,
    sort: Option<SortSpec>,
    /// The access path already yields documents in `sort` order.
    sort_provided: bool,
    /// Stages after the leading `$match`/`$sort`, up to and including `$group`.
    body: Vec<PipelineStage>,
    trailing: Vec<PipelineStage>,
    collation: Option<Collation>,
}

impl FallbackPlan {
    pub fn build(
        catalog: &IndexCatalog,
        stages: &[PipelineStage],
        collation: Option<&Collation>,
        hint: &Hint,
    ) -> Result<Self> {
        if let Some(PipelineStage::Other(name)) =
            stages.iter().find(|s| matches!(s, PipelineStage::Other(_)))
        {
            return Err(KeyseekError::InvalidPipeline(format!(
                "unsupported stage {}",
                name
            )));
        }

        let mut rest = stages;
        let filter = match rest.first() {
            Some(PipelineStage::Match(spec)) => {
                rest = &rest[1..];
                Some(spec.clone())
            }
            _ => None,
        };
        let sort = match rest.first() {
            Some(PipelineStage::Sort(spec)) => {
                rest = &rest[1..];
                Some(spec.clone())
            }
            _ => None,
        };
        let split = rest
            .iter()
            .position(|s| matches!(s, PipelineStage::Group(_)))
            .map_or(rest.len(), |pos| pos + 1);
        let (body, trailing) = rest.split_at(split);

        let chooser = AccessChooser {
            catalog,
            filter: filter.as_ref(),
            sort: sort.as_ref(),
            body,
            collation,
        };
        let (access, sort_provided) = chooser.choose(hint)?;

        Ok(Self {
            access,
            filter,
            sort,
            sort_provided,
            body: body.to_vec(),
            trailing: trailing.to_vec(),
            collation: collation.cloned(),
        })
    }

    pub fn access(&self) -> &AccessPath {
        &self.access
    }

    pub fn execute(&self, collection: &Collection, config: &ExecutorConfig) -> Result<Vec<Value>> {
        let mut docs = self.scan(collection)?;
        let collation = self.collation.as_ref();

        if let Some(sort) = &self.sort
            && !self.sort_provided
        {
            docs = blocking_sort(docs, sort, collation, config)?;
        }

        let docs = run_stages(docs, &self.body, collation, config)?;
        run_stages(docs, &self.trailing, collation, config)
    }

    fn scan(&self, collection: &Collection) -> Result<Vec<Value>> {
        let state = collection.read_state();
        let passes = |doc: &Value| {
            self.filter
                .as_ref()
                .is_none_or(|f| f.matches(doc, self.collation.as_ref()))
        };

        match &self.access {
            AccessPath::Collscan => Ok(state
                .documents()
                .filter(|(_, doc)| passes(doc))
                .map(|(_, doc)| doc.clone())
                .collect()),
            AccessPath::Ixscan {
                index,
                bounds,
                direction,
            } => {
                let store = state
                    .index(&index.name)
                    .ok_or_else(|| KeyseekError::IndexNotFound(index.name.clone()))?;
                let prefix: Vec<Value> = bounds
                    .iter()
                    .map_while(|b| match b {
                        Bounds::Point(v) => Some(v.clone()),
                        Bounds::Full => None,
                    })
                    .collect();
                let entries = &store.entries()[store.range_for_prefix(&prefix)];
                let ids: Vec<RecordId> = match direction {
                    ScanDirection::Forward => entries.iter().map(|e| e.record_id).collect(),
                    ScanDirection::Backward => entries.iter().rev().map(|e| e.record_id).collect(),
                };

                let mut seen = HashSet::new();
                let mut docs = Vec::new();
                for id in ids {
                    if !seen.insert(id) {
                        continue;
                    }
                    if let Some(doc) = state.document(id)
                        && passes(doc)
                    {
                        docs.push(doc.clone());
                    }
                }
                Ok(docs)
            }
        }
    }

    pub fn explain(
        &self,
        namespace: &str,
        catalog_epoch: u64,
        reason: Option<&IneligibleReason>,
    ) -> Explain {
        let filter = self.filter.as_ref().map(MatchSpec::to_json);
        let mut stage = match &self.access {
            AccessPath::Collscan => PlanStage::new(StageType::Collscan).with_filter(filter),
            AccessPath::Ixscan {
                index,
                bounds,
                direction,
            } => PlanStage::new(StageType::Fetch)
                .with_filter(filter)
                .with_input(PlanStage::index_scan(StageType::Ixscan, index, *direction, bounds)),
        };

        if let Some(sort) = &self.sort
            && !self.sort_provided
        {
            stage = sort_stage(sort).with_input(stage);
        }
        for s in &self.body {
            if let Some(next) = plan_stage(s) {
                stage = next.with_input(stage);
            }
        }

        Explain {
            namespace: namespace.to_string(),
            catalog_epoch,
            winning_plan: stage,
            trailing_stages: trailing_names(&self.trailing),
            ineligible_reason: reason.map(ToString::to_string),
        }
    }
}

struct AccessChooser<'a> {
    catalog: &'a IndexCatalog,
    filter: Option<&'a MatchSpec>,
    sort: Option<&'a SortSpec>,
    body: &'a [PipelineStage],
    collation: Option<&'a Collation>,
}

impl AccessChooser<'_> {
    fn choose(&self, hint: &Hint) -> Result<(AccessPath, bool)> {
        let hinted = match hint {
            Hint::Natural => return Ok((AccessPath::Collscan, false)),
            Hint::ByName(name) => Some(
                self.catalog
                    .find_by_name(name)
                    .ok_or_else(|| KeyseekError::IndexNotFound(name.clone()))?,
            ),
            Hint::ByKeyPattern(pattern) => Some(
                self.catalog
                    .find_by_key_pattern(pattern)
                    .ok_or_else(|| KeyseekError::IndexNotFound(pattern.to_string()))?,
            ),
            Hint::None => None,
        };
        if let Some(index) = hinted {
            return Ok(self.index_scan(index));
        }

        let usable: Vec<&IndexDescriptor> = self
            .catalog
            .list_indexes()
            .iter()
            .filter(|idx| collations_match(self.collation, idx.collation.as_ref()))
            .collect();

        // Sort provided
        if self.sort.is_some()
            && let Some(index) = usable.iter().find(|idx| self.index_scan(idx).1)
        {
            debug!(index = %index.name, "Fallback IXSCAN provides the sort");
            return Ok(self.index_scan(index));
        }

        // Leading equality
        let points = self.points();
        if let Some(index) = usable.iter().find(|idx| {
            idx.key_pattern
                .fields()
                .first()
                .is_some_and(|f| points.contains_key(&f.path))
        }) {
            debug!(index = %index.name, "Fallback IXSCAN on leading equality");
            return Ok(self.index_scan(index));
        }

        // Covering
        if let Some(paths) = self.referenced_paths()
            && let Some(index) = usable.iter().find(|idx| covers(idx, &paths))
        {
            debug!(index = %index.name, "Fallback IXSCAN over covering index");
            return Ok(self.index_scan(index));
        }

        Ok((AccessPath::Collscan, false))
    }

    fn points(&self) -> BTreeMap<String, Value> {
        self.filter
            .map(|f| f.split_points().0)
            .unwrap_or_default()
    }

    /// Scan over `index` with whatever point bounds and sort it can honour.
    fn index_scan(&self, index: &IndexDescriptor) -> (AccessPath, bool) {
        let points = self.points();
        let collation_ok = collations_match(self.collation, index.collation.as_ref());

        let mut bounds = Vec::new();
        if collation_ok {
            for key in index.key_pattern.fields() {
                match points.get(&key.path) {
                    Some(v) if key.direction != KeyDirection::Hashed => {
                        bounds.push(Bounds::Point(v.clone()))
                    }
                    Some(v) if index.collation.is_none() => {
                        bounds.push(Bounds::Point(hash_value(v)))
                    }
                    _ => break,
                }
            }
        }

        let provided = match self.sort {
            Some(sort) if collation_ok => match sort_direction(sort, index, &bounds) {
                Ok((direction, None)) => Some(direction),
                _ => None,
            },
            _ => None,
        };

        (
            AccessPath::Ixscan {
                index: index.clone(),
                bounds,
                direction: provided.unwrap_or_default(),
            },
            provided.is_some(),
        )
    }

    /// Every field path the pipeline reads before `$group`, or `None` if some
    /// stage needs whole documents.
    fn referenced_paths(&self) -> Option<Vec<String>> {
        let mut out = Vec::new();
        if let Some(filter) = self.filter {
            out.extend(filter.predicates.iter().map(|p| p.path.clone()));
        }
        if let Some(sort) = self.sort {
            out.extend(sort.fields.iter().map(|f| f.path.clone()));
        }
        for stage in self.body {
            let complete = match stage {
                PipelineStage::Match(spec) => {
                    out.extend(spec.predicates.iter().map(|p| p.path.clone()));
                    true
                }
                PipelineStage::Sort(spec) => {
                    out.extend(spec.fields.iter().map(|f| f.path.clone()));
                    true
                }
                PipelineStage::Group(spec) => group_paths(spec, &mut out),
                PipelineStage::Limit(_) | PipelineStage::Skip(_) => true,
                PipelineStage::Project(_) | PipelineStage::Other(_) => false,
            };
            if !complete {
                return None;
            }
        }
        Some(out)
    }
}

fn group_paths(spec: &GroupSpec, out: &mut Vec<String>) -> bool {
    let id = match &spec.id {
        GroupKey::Field(path) | GroupKey::Wrapped { path, .. } => {
            out.push(path.clone());
            true
        }
        GroupKey::Compound(fields) => fields.iter().all(|(_, e)| e.referenced_paths(out)),
        GroupKey::Constant(_) => true,
        GroupKey::Expression(expr) => expr.referenced_paths(out),
    };
    id && spec.accumulators.iter().all(|a| a.expr.referenced_paths(out))
}

fn covers(index: &IndexDescriptor, paths: &[String]) -> bool {
    !index.is_multikey()
        && paths.iter().all(|path| {
            index
                .key_pattern
                .position_of(path)
                .is_some_and(|pos| index.direction_at(pos) != Some(KeyDirection::Hashed))
        })
}

fn sort_stage(sort: &SortSpec) -> PlanStage {
    PlanStage {
        sort_pattern: Some(sort.to_json()),
        ..PlanStage::new(StageType::Sort)
    }
}

fn plan_stage(stage: &PipelineStage) -> Option<PlanStage> {
    Some(match stage {
        PipelineStage::Match(spec) => {
            PlanStage::new(StageType::Match).with_filter(Some(spec.to_json()))
        }
        PipelineStage::Sort(spec) => sort_stage(spec),
        PipelineStage::Group(spec) => PlanStage::group(spec),
        PipelineStage::Limit(n) => PlanStage {
            limit_amount: Some(*n),
            ..PlanStage::new(StageType::Limit)
        },
        PipelineStage::Skip(n) => PlanStage {
            skip_amount: Some(*n),
            ..PlanStage::new(StageType::Skip)
        },
        PipelineStage::Project(_) => PlanStage::new(StageType::Projection),
        PipelineStage::Other(_) => return None,
    })
}

/// Run `stages` in order over an in-memory document stream.
pub fn run_stages(
    mut docs: Vec<Value>,
    stages: &[PipelineStage],
    collation: Option<&Collation>,
    config: &ExecutorConfig,
) -> Result<Vec<Value>> {
    for stage in stages {
        docs = match stage {
            PipelineStage::Match(spec) => docs
                .into_iter()
                .filter(|d| spec.matches(d, collation))
                .collect(),
            PipelineStage::Sort(spec) => blocking_sort(docs, spec, collation, config)?,
            PipelineStage::Limit(n) => {
                docs.truncate(usize::try_from(*n).unwrap_or(usize::MAX));
                docs
            }
            PipelineStage::Skip(n) => docs
                .into_iter()
                .skip(usize::try_from(*n).unwrap_or(usize::MAX))
                .collect(),
            PipelineStage::Project(spec) => docs
                .iter()
                .map(|d| spec.apply(d))
                .collect::<Result<_>>()?,
            PipelineStage::Group(spec) => group_documents(&docs, spec, collation)?,
            PipelineStage::Other(name) => {
                return Err(KeyseekError::InvalidPipeline(format!(
                    "unsupported stage {}",
                    name
                )));
            }
        };
    }
    Ok(docs)
}

/// Stable in-memory sort.
pub fn blocking_sort(
    docs: Vec<Value>,
    sort: &SortSpec,
    collation: Option<&Collation>,
    config: &ExecutorConfig,
) -> Result<Vec<Value>> {
    if docs.len() > config.max_blocking_sort_documents {
        return Err(KeyseekError::ResourceExhausted(format!(
            "blocking sort of {} documents exceeds limit of {}",
            docs.len(),
            config.max_blocking_sort_documents
        )));
    }

    let mut keyed: Vec<(Vec<Value>, Value)> = docs
        .into_iter()
        .map(|doc| (sort.sort_key(&doc, collation), doc))
        .collect();
    keyed.sort_by(|a, b| sort.compare_keys(&a.0, &b.0, collation));
    Ok(keyed.into_iter().map(|(_, doc)| doc).collect())
}

/// Group documents. Groups come out in the order their first document was
/// seen, so sorted input yields groups in sort order.
pub fn group_documents(
    docs: &[Value],
    spec: &GroupSpec,
    collation: Option<&Collation>,
) -> Result<Vec<Value>> {
    let mut groups: Vec<(Value, Vec<AccumulatorState>)> = Vec::new();
    // (key, position in `groups`), sorted by key under `collation`
    let mut lookup: Vec<(Value, usize)> = Vec::new();

    for doc in docs {
        let key = spec.id.evaluate(doc)?;
        let pos = match lookup.binary_search_by(|(k, _)| k.compare(&key, collation)) {
            Ok(slot) => lookup[slot].1,
            Err(slot) => {
                let states = spec
                    .accumulators
                    .iter()
                    .map(|acc| AccumulatorState::new(acc.op))
                    .collect();
                lookup.insert(slot, (key.clone(), groups.len()));
                groups.push((key, states));
                groups.len() - 1
            }
        };
        for (acc, state) in spec.accumulators.iter().zip(groups[pos].1.iter_mut()) {
            state.update(acc.expr.evaluate(doc)?, collation);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, states)| {
            let mut out = BTreeMap::new();
            out.insert("_id".to_string(), key);
            for (acc, state) in spec.accumulators.iter().zip(states) {
                out.insert(acc.output.clone(), state.finish());
            }
            Value::Object(out)
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq)]
enum AccumulatorState {
    First(Option<Value>),
    Last(Value),
    Sum { int: i64, float: f64, floating: bool },
    Avg { total: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Count(i64),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
}

impl AccumulatorState {
    fn new(op: AccumulatorOp) -> Self {
        match op {
            AccumulatorOp::First => AccumulatorState::First(None),
            AccumulatorOp::Last => AccumulatorState::Last(Value::Null),
            AccumulatorOp::Sum => AccumulatorState::Sum {
                int: 0,
                float: 0.0,
                floating: false,
            },
            AccumulatorOp::Avg => AccumulatorState::Avg {
                total: 0.0,
                count: 0,
            },
            AccumulatorOp::Min => AccumulatorState::Min(None),
            AccumulatorOp::Max => AccumulatorState::Max(None),
            AccumulatorOp::Count => AccumulatorState::Count(0),
            AccumulatorOp::Push => AccumulatorState::Push(Vec::new()),
            AccumulatorOp::AddToSet => AccumulatorState::AddToSet(Vec::new()),
        }
    }

    /// Fold one evaluated input. `None` is a missing value.
    fn update(&mut self, input: Option<Value>, collation: Option<&Collation>) {
        match self {
            AccumulatorState::First(slot) => {
                if slot.is_none() {
                    *slot = Some(input.unwrap_or(Value::Null));
                }
            }
            AccumulatorState::Last(slot) => *slot = input.unwrap_or(Value::Null),
            AccumulatorState::Sum {
                int,
                float,
                floating,
            } => match input {
                Some(Value::Int64(i)) if !*floating => match int.checked_add(i) {
                    Some(sum) => *int = sum,
                    None => {
                        *floating = true;
                        *float = *int as f64 + i as f64;
                    }
                },
                Some(Value::Int64(i)) => *float += i as f64,
                Some(Value::Float64(f)) => {
                    if !*floating {
                        *floating = true;
                        *float = *int as f64;
                    }
                    *float += f;
                }
                _ => {}
            },
            AccumulatorState::Avg { total, count } => {
                if let Some(f) = input.as_ref().and_then(Value::as_f64) {
                    *total += f;
                    *count += 1;
                }
            }
            AccumulatorState::Min(slot) => {
                if let Some(v) = input.filter(|v| !v.is_null())
                    && slot.as_ref().is_none_or(|cur| v.compare(cur, collation).is_lt())
                {
                    *slot = Some(v);
                }
            }
            AccumulatorState::Max(slot) => {
                if let Some(v) = input.filter(|v| !v.is_null())
                    && slot.as_ref().is_none_or(|cur| v.compare(cur, collation).is_gt())
                {
                    *slot = Some(v);
                }
            }
            AccumulatorState::Count(n) => *n += 1,
            AccumulatorState::Push(items) => items.extend(input),
            AccumulatorState::AddToSet(items) => {
                if let Some(v) = input
                    && !items.iter().any(|item| item.equals(&v, collation))
                {
                    items.push(v);
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            AccumulatorState::First(slot) => slot.unwrap_or(Value::Null),
            AccumulatorState::Last(v) => v,
            AccumulatorState::Sum {
                int,
                float,
                floating,
            } => {
                if floating {
                    Value::Float64(float)
                } else {
                    Value::Int64(int)
                }
            }
            AccumulatorState::Avg { total, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    Value::Float64(total / count as f64)
                }
            }
            AccumulatorState::Min(slot) | AccumulatorState::Max(slot) => {
                slot.unwrap_or(Value::Null)
            }
            AccumulatorState::Count(n) => Value::Int64(n),
            AccumulatorState::Push(items) | AccumulatorState::AddToSet(items) => {
                Value::Array(items)
            }
        }
    }
}
