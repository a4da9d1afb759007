//! Distinct scan eligibility analysis
//!
//! Decides whether a `[$match?, $sort?, $group]` prefix can be answered by a
//! DISTINCT_SCAN over one of the collection's indexes. Every candidate index
//! is checked independently:
//!
//! 1. the group-by field must be indexed and not hashed,
//! 2. query and index collations must match exactly,
//! 3. every key field before the group-by field (the pivot) needs a point bound,
//!    and every point predicate must land on one of those fields or the pivot,
//! 4. neither the pivot nor any point-bounded field before it may be multikey,
//! 5. `$first`/`$last` inputs are read from the key when possible, else FETCH,
//! 6. a requested sort must be a uniform native or uniform reversed walk.
//!
//! Surviving candidates are ranked: no FETCH first, then native direction,
//! then the shorter key pattern, then name. Analysis never fails for an
//! unsuitable query; it reports [`Eligibility::Ineligible`] instead.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::collation::{Collation, collations_match};
use crate::config::PlannerConfig;
use crate::error::Result;
use crate::query::group::{AccumulatorKind, GroupKey, GroupSpec};
use crate::query::pipeline::{PipelineStage, SortSpec, normalize_prefix};
use crate::query::plan::{
    AccumulatorMode, AccumulatorSource, Bounds, CandidateRejection, Eligibility, Hint,
    IneligibleReason, ScanDirection, ScanPlan,
};
use crate::storage::index::hash_value;
use crate::storage::{IndexCatalog, IndexDescriptor, KeyDirection};
use crate::value::Value;

/// Point-bound fields taken from a conjunctive `$match`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EqualityPrefix {
    fields: BTreeMap<String, Value>,
}

impl EqualityPrefix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(path.into(), value.into());
        self
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.fields.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<BTreeMap<String, Value>> for EqualityPrefix {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }
}

/// Normalized query shape handed to the analyzer.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryShape {
    pub equality_prefix: EqualityPrefix,
    pub requested_sort: Option<SortSpec>,
    pub group: GroupSpec,
    pub collation: Option<Collation>,
    pub hint: Hint,
    pub trailing: Vec<PipelineStage>,
}

impl QueryShape {
    pub fn new(group: GroupSpec) -> Self {
        Self {
            equality_prefix: EqualityPrefix::default(),
            requested_sort: None,
            group,
            collation: None,
            hint: Hint::None,
            trailing: Vec::new(),
        }
    }

    pub fn with_equality(mut self, prefix: EqualityPrefix) -> Self {
        self.equality_prefix = prefix;
        self
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.requested_sort = Some(sort);
        self
    }

    pub fn with_collation(mut self, collation: Option<Collation>) -> Self {
        self.collation = Collation::normalize(collation);
        self
    }

    pub fn with_hint(mut self, hint: Hint) -> Self {
        self.hint = hint;
        self
    }
}

pub struct Analyzer<'a> {
    catalog: &'a IndexCatalog,
    config: &'a PlannerConfig,
}

impl<'a> Analyzer<'a> {
    pub fn new(catalog: &'a IndexCatalog, config: &'a PlannerConfig) -> Self {
        Self { catalog, config }
    }

    /// Normalize a parsed pipeline and analyze it.
    pub fn analyze_pipeline(
        &self,
        stages: &[PipelineStage],
        collation: Option<&Collation>,
        hint: &Hint,
    ) -> Result<Eligibility> {
        if !self.config.enable_distinct_scan {
            return Ok(Eligibility::Ineligible(IneligibleReason::Disabled));
        }

        let prefix = match normalize_prefix(stages) {
            Ok(prefix) => prefix,
            Err(reason) => return Ok(Eligibility::Ineligible(reason)),
        };

        let mut points = BTreeMap::new();
        if let Some(spec) = prefix.match_spec {
            let (p, residual) = spec.split_points();
            if let Some(predicate) = residual.first() {
                return Ok(Eligibility::Ineligible(IneligibleReason::ResidualPredicate(
                    predicate.path.clone(),
                )));
            }
            points = p;
        }

        let shape = QueryShape {
            equality_prefix: points.into(),
            requested_sort: prefix.sort.cloned(),
            group: prefix.group.clone(),
            collation: Collation::normalize(collation.cloned()),
            hint: hint.clone(),
            trailing: prefix.trailing.to_vec(),
        };
        self.analyze(&shape)
    }

    /// Decide eligibility for an already-normalized query shape.
    pub fn analyze(&self, shape: &QueryShape) -> Result<Eligibility> {
        shape.group.validate()?;

        if !self.config.enable_distinct_scan {
            return Ok(Eligibility::Ineligible(IneligibleReason::Disabled));
        }

        let field = match &shape.group.id {
            GroupKey::Field(path) | GroupKey::Wrapped { path, .. } => path.as_str(),
            GroupKey::Compound(_) => {
                return Ok(Eligibility::Ineligible(IneligibleReason::CompoundGroupKey));
            }
            GroupKey::Constant(_) | GroupKey::Expression(_) => {
                return Ok(Eligibility::Ineligible(IneligibleReason::NonFieldGroupKey));
            }
        };

        let mode = match accumulator_mode(&shape.group) {
            Ok(mode) => mode,
            Err(reason) => return Ok(Eligibility::Ineligible(reason)),
        };

        let hinted = match &shape.hint {
            Hint::None => None,
            Hint::Natural => return Ok(Eligibility::Ineligible(IneligibleReason::NaturalHint)),
            Hint::ByName(name) => match self.catalog.find_by_name(name) {
                Some(index) => Some(index),
                None => {
                    return Ok(Eligibility::Ineligible(IneligibleReason::HintNotFound(
                        name.clone(),
                    )));
                }
            },
            Hint::ByKeyPattern(pattern) => match self.catalog.find_by_key_pattern(pattern) {
                Some(index) => Some(index),
                None => {
                    return Ok(Eligibility::Ineligible(IneligibleReason::HintNotFound(
                        pattern.to_string(),
                    )));
                }
            },
        };

        if let Some(index) = hinted {
            return Ok(match self.evaluate_candidate(shape, index, field, mode) {
                Ok(plan) => {
                    log_chosen(&plan);
                    Eligibility::Eligible(Box::new(plan))
                }
                Err(reason) => {
                    debug!(index = %index.name, reason = %reason, "Hinted index rejected for DISTINCT_SCAN");
                    Eligibility::Ineligible(IneligibleReason::HintedIndexRejected {
                        index: index.name.clone(),
                        reason,
                    })
                }
            });
        }

        let candidates = self.catalog.candidate_indexes(field);
        if candidates.is_empty() {
            debug!(field, "No index on group-by field");
            return Ok(Eligibility::Ineligible(IneligibleReason::NoCandidateIndex));
        }

        let mut plans = Vec::new();
        let mut rejections = Vec::new();
        for index in candidates {
            match self.evaluate_candidate(shape, index, field, mode) {
                Ok(plan) => plans.push(plan),
                Err(reason) => {
                    debug!(index = %index.name, reason = %reason, "Rejected DISTINCT_SCAN candidate");
                    rejections.push((index.name.clone(), reason));
                }
            }
        }

        let best = plans.into_iter().min_by(|a, b| {
            rank(a)
                .cmp(&rank(b))
                .then_with(|| a.index.name.cmp(&b.index.name))
        });

        Ok(match best {
            Some(plan) => {
                log_chosen(&plan);
                Eligibility::Eligible(Box::new(plan))
            }
            None => Eligibility::Ineligible(IneligibleReason::AllCandidatesRejected(rejections)),
        })
    }

    fn evaluate_candidate(
        &self,
        shape: &QueryShape,
        index: &IndexDescriptor,
        field: &str,
        mode: AccumulatorMode,
    ) -> std::result::Result<ScanPlan, CandidateRejection> {
        let fields = index.key_pattern.fields();
        let pivot = index
            .key_pattern
            .position_of(field)
            .ok_or(CandidateRejection::GroupFieldNotIndexed)?;

        if fields[pivot].direction == KeyDirection::Hashed {
            return Err(CandidateRejection::HashedGroupField);
        }
        if !collations_match(shape.collation.as_ref(), index.collation.as_ref()) {
            return Err(CandidateRejection::CollationMismatch);
        }

        // Prefix alignment
        let mut bounds = Vec::with_capacity(pivot + 1);
        for key in &fields[..pivot] {
            let value = shape
                .equality_prefix
                .get(&key.path)
                .ok_or_else(|| CandidateRejection::PrefixNotBound(key.path.clone()))?;
            if key.direction == KeyDirection::Hashed {
                if index.collation.is_some() {
                    return Err(CandidateRejection::HashedPointUnderCollation(key.path.clone()));
                }
                bounds.push(Bounds::Point(hash_value(value)));
            } else {
                bounds.push(Bounds::Point(value.clone()));
            }
        }
        bounds.push(match shape.equality_prefix.get(field) {
            Some(value) => Bounds::Point(value.clone()),
            None => Bounds::Full,
        });

        for path in shape.equality_prefix.paths() {
            match index.key_pattern.position_of(path) {
                Some(pos) if pos <= pivot => {}
                _ => return Err(CandidateRejection::UnboundPredicate(path.to_string())),
            }
        }

        // Multikey safety
        if IndexCatalog::is_multikey_on_prefix(index, pivot)
            && let Some(key) = fields[..=pivot]
                .iter()
                .find(|key| index.is_field_multikey(&key.path))
        {
            return Err(CandidateRejection::MultikeyPrefix(key.path.clone()));
        }

        // Direction
        let (direction, multikey_sort_field) = match &shape.requested_sort {
            Some(sort) => sort_direction(sort, index, &bounds)?,
            None => (ScanDirection::Forward, None),
        };
        if let Some(path) = &multikey_sort_field
            && mode == AccumulatorMode::Last
        {
            return Err(CandidateRejection::MultikeySortForLast(path.clone()));
        }

        // Accumulator reachability
        let sources: Vec<AccumulatorSource> = shape
            .group
            .accumulators
            .iter()
            .map(|acc| covered_position(index, acc.expr.as_field()))
            .map(|pos| pos.map_or(AccumulatorSource::Fetched, AccumulatorSource::Covered))
            .collect();

        let fetch_required = multikey_sort_field.is_some()
            || sources.iter().any(|s| *s == AccumulatorSource::Fetched);
        if fetch_required && !self.config.allow_fetch {
            return Err(CandidateRejection::FetchDisallowed);
        }

        Ok(ScanPlan {
            index: index.clone(),
            catalog_epoch: self.catalog.epoch(),
            group: shape.group.clone(),
            pivot,
            direction,
            bounds,
            fetch_required,
            mode,
            sources,
            trailing: shape.trailing.clone(),
        })
    }
}

fn accumulator_mode(group: &GroupSpec) -> std::result::Result<AccumulatorMode, IneligibleReason> {
    let mut mode = AccumulatorMode::KeyOnly;
    for acc in &group.accumulators {
        let next = match acc.op.kind() {
            AccumulatorKind::First => AccumulatorMode::First,
            AccumulatorKind::Last => AccumulatorMode::Last,
            AccumulatorKind::Other => {
                return Err(IneligibleReason::UnsupportedAccumulator(acc.op.name().to_string()));
            }
        };
        if mode != AccumulatorMode::KeyOnly && mode != next {
            return Err(IneligibleReason::MixedAccumulators);
        }
        mode = next;
    }
    Ok(mode)
}

/// Match the requested sort against the key pattern, skipping point-bound
/// fields. Returns the walk direction and the first multikey field the sort
/// runs through after the pivot.
pub(crate) fn sort_direction(
    sort: &SortSpec,
    index: &IndexDescriptor,
    bounds: &[Bounds],
) -> std::result::Result<(ScanDirection, Option<String>), CandidateRejection> {
    let fields = index.key_pattern.fields();
    let pinned = |path: &str| {
        index
            .key_pattern
            .position_of(path)
            .and_then(|pos| bounds.get(pos))
            .is_some_and(Bounds::is_point)
    };

    let mut direction = None;
    let mut multikey = None;
    let mut pos = 0;
    for wanted in sort.fields.iter().filter(|f| !pinned(&f.path)) {
        while fields.get(pos).is_some_and(|key| pinned(&key.path)) {
            pos += 1;
        }
        let key = fields
            .get(pos)
            .filter(|key| key.path == wanted.path)
            .ok_or(CandidateRejection::SortNotProvided)?;
        let walk = match wanted.direction.agrees_with(key.direction) {
            Some(true) => ScanDirection::Forward,
            Some(false) => ScanDirection::Backward,
            None => return Err(CandidateRejection::SortNotProvided),
        };
        if direction.is_some_and(|d| d != walk) {
            return Err(CandidateRejection::SortNotProvided);
        }
        direction = Some(walk);
        if multikey.is_none() && index.is_field_multikey(&key.path) {
            multikey = Some(key.path.clone());
        }
        pos += 1;
    }

    Ok((direction.unwrap_or_default(), multikey))
}

/// Key position an accumulator can read `path` from without a fetch.
fn covered_position(index: &IndexDescriptor, path: Option<&str>) -> Option<usize> {
    if index.collation.is_some() {
        return None;
    }
    let path = path?;
    let pos = index.key_pattern.position_of(path)?;
    let key = &index.key_pattern.fields()[pos];
    (key.direction != KeyDirection::Hashed && !index.is_field_multikey(path)).then_some(pos)
}

fn rank(plan: &ScanPlan) -> (bool, bool, usize) {
    (
        plan.fetch_required,
        plan.direction != ScanDirection::Forward,
        plan.index.key_pattern.len(),
    )
}

fn log_chosen(plan: &ScanPlan) {
    info!(
        index = %plan.index.name,
        direction = plan.direction.as_str(),
        fetch = plan.fetch_required,
        "Planned DISTINCT_SCAN"
    );
}
