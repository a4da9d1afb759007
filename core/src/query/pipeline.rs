//! Pipeline stage model and parsing
//!
//! A pipeline is a JSON array of single-key stage objects. Parsing is total
//! over the stage names this engine knows; anything else becomes
//! [`PipelineStage::Other`] so eligibility analysis can name it.

use std::collections::BTreeMap;

use crate::collation::Collation;
use crate::document::{extract_index_values, query_candidates, resolve_path, set_path, validate_path};
use crate::error::{KeyseekError, Result};
use crate::query::expr::Expr;
use crate::query::group::GroupSpec;
use crate::query::plan::IneligibleReason;
use crate::storage::KeyDirection;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineStage {
    Match(MatchSpec),
    Sort(SortSpec),
    Group(GroupSpec),
    Limit(u64),
    Skip(u64),
    Project(ProjectSpec),
    Other(String),
}

impl PipelineStage {
    pub fn parse(json: &serde_json::Value) -> Result<Self> {
        let obj = json
            .as_object()
            .filter(|o| o.len() == 1)
            .ok_or_else(|| {
                KeyseekError::InvalidPipeline(
                    "a pipeline stage must be an object with exactly one field".into(),
                )
            })?;
        let Some((name, spec)) = obj.iter().next() else {
            return Err(KeyseekError::InvalidPipeline("empty pipeline stage".into()));
        };

        match name.as_str() {
            "$match" => Ok(PipelineStage::Match(MatchSpec::parse(spec)?)),
            "$sort" => Ok(PipelineStage::Sort(SortSpec::parse(spec)?)),
            "$group" => Ok(PipelineStage::Group(GroupSpec::parse(spec)?)),
            "$limit" => Ok(PipelineStage::Limit(parse_count(name, spec, 1)?)),
            "$skip" => Ok(PipelineStage::Skip(parse_count(name, spec, 0)?)),
            "$project" => Ok(PipelineStage::Project(ProjectSpec::parse(spec)?)),
            other => Ok(PipelineStage::Other(other.to_string())),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PipelineStage::Match(_) => "$match",
            PipelineStage::Sort(_) => "$sort",
            PipelineStage::Group(_) => "$group",
            PipelineStage::Limit(_) => "$limit",
            PipelineStage::Skip(_) => "$skip",
            PipelineStage::Project(_) => "$project",
            PipelineStage::Other(name) => name,
        }
    }
}

/// Parse a JSON array of stages.
pub fn parse_pipeline(json: &serde_json::Value) -> Result<Vec<PipelineStage>> {
    json.as_array()
        .ok_or_else(|| KeyseekError::InvalidPipeline("a pipeline must be an array".into()))?
        .iter()
        .map(PipelineStage::parse)
        .collect()
}

fn parse_count(stage: &str, json: &serde_json::Value, min: u64) -> Result<u64> {
    json.as_u64()
        .or_else(|| json.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
        .filter(|n| *n >= min)
        .ok_or_else(|| {
            KeyseekError::InvalidPipeline(format!(
                "{} requires an integer of at least {}, got {}",
                stage, min, json
            ))
        })
}

/// The `[Match?, Sort?, Group]` prefix plus the stages after the group.
#[derive(Debug, Clone, Copy)]
pub struct PipelinePrefix<'a> {
    pub match_spec: Option<&'a MatchSpec>,
    pub sort: Option<&'a SortSpec>,
    pub group: &'a GroupSpec,
    pub trailing: &'a [PipelineStage],
}

/// Fit `stages` to `[Match?, Sort?, Group, ...]`.
pub fn normalize_prefix(
    stages: &[PipelineStage],
) -> std::result::Result<PipelinePrefix<'_>, IneligibleReason> {
    if !stages.iter().any(|s| matches!(s, PipelineStage::Group(_))) {
        return Err(IneligibleReason::NoGroupStage);
    }

    let mut pos = 0;
    let mut match_spec = None;
    let mut sort = None;
    if let Some(PipelineStage::Match(spec)) = stages.get(pos) {
        match_spec = Some(spec);
        pos += 1;
    }
    if let Some(PipelineStage::Sort(spec)) = stages.get(pos) {
        sort = Some(spec);
        pos += 1;
    }

    match stages.get(pos) {
        Some(PipelineStage::Group(group)) => Ok(PipelinePrefix {
            match_spec,
            sort,
            group,
            trailing: &stages[pos + 1..],
        }),
        Some(PipelineStage::Limit(_)) => Err(IneligibleReason::LimitBeforeGroup),
        Some(PipelineStage::Skip(_)) => Err(IneligibleReason::SkipBeforeGroup),
        Some(PipelineStage::Project(_)) => Err(IneligibleReason::ProjectBeforeGroup),
        Some(other) => Err(IneligibleReason::UnsupportedStage(other.name().to_string())),
        None => Err(IneligibleReason::NoGroupStage),
    }
}

// Match

#[derive(Debug, Clone, PartialEq)]
pub enum PredicateOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Exists(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub path: String,
    pub op: PredicateOp,
}

impl Predicate {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            op: PredicateOp::Eq(value.into()),
        }
    }

    /// The single value this predicate pins its field to, if it is a point query.
    pub fn point_value(&self) -> Option<&Value> {
        match &self.op {
            PredicateOp::Eq(v)
                if !matches!(
                    v,
                    Value::Array(_) | Value::Object(_) | Value::MinKey | Value::MaxKey
                ) =>
            {
                Some(v)
            }
            _ => None,
        }
    }

    pub fn matches(&self, doc: &Value, collation: Option<&Collation>) -> bool {
        let any = |f: &dyn Fn(&Value) -> bool| query_candidates(doc, &self.path).iter().any(f);
        let ranged = |v: &Value, accept: fn(std::cmp::Ordering) -> bool| {
            any(&|c: &Value| c.type_rank() == v.type_rank() && accept(c.compare(v, collation)))
        };

        match &self.op {
            PredicateOp::Eq(v) => any(&|c: &Value| c.equals(v, collation)),
            PredicateOp::Ne(v) => !any(&|c: &Value| c.equals(v, collation)),
            PredicateOp::Gt(v) => ranged(v, |o| o.is_gt()),
            PredicateOp::Gte(v) => ranged(v, |o| o.is_ge()),
            PredicateOp::Lt(v) => ranged(v, |o| o.is_lt()),
            PredicateOp::Lte(v) => ranged(v, |o| o.is_le()),
            PredicateOp::In(vs) => any(&|c: &Value| vs.iter().any(|v| c.equals(v, collation))),
            PredicateOp::Exists(expected) => resolve_path(doc, &self.path).is_some() == *expected,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        let (op, arg) = match &self.op {
            PredicateOp::Eq(v) => ("$eq", v.to_json()),
            PredicateOp::Ne(v) => ("$ne", v.to_json()),
            PredicateOp::Gt(v) => ("$gt", v.to_json()),
            PredicateOp::Gte(v) => ("$gte", v.to_json()),
            PredicateOp::Lt(v) => ("$lt", v.to_json()),
            PredicateOp::Lte(v) => ("$lte", v.to_json()),
            PredicateOp::In(vs) => (
                "$in",
                serde_json::Value::Array(vs.iter().map(Value::to_json).collect()),
            ),
            PredicateOp::Exists(b) => ("$exists", serde_json::Value::Bool(*b)),
        };
        let mut inner = serde_json::Map::new();
        inner.insert(op.to_string(), arg);
        let mut outer = serde_json::Map::new();
        outer.insert(self.path.clone(), serde_json::Value::Object(inner));
        serde_json::Value::Object(outer)
    }
}

/// A conjunction of field predicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchSpec {
    pub predicates: Vec<Predicate>,
}

impl MatchSpec {
    pub fn new(predicates: Vec<Predicate>) -> Self {
        Self { predicates }
    }

    pub fn parse(json: &serde_json::Value) -> Result<Self> {
        let mut spec = MatchSpec::default();
        spec.parse_into(json)?;
        Ok(spec)
    }

    fn parse_into(&mut self, json: &serde_json::Value) -> Result<()> {
        let obj = json
            .as_object()
            .ok_or_else(|| KeyseekError::InvalidPipeline("$match takes an object".into()))?;

        for (key, value) in obj {
            if key == "$and" {
                let clauses = value.as_array().ok_or_else(|| {
                    KeyseekError::InvalidPipeline("$and takes an array".into())
                })?;
                for clause in clauses {
                    self.parse_into(clause)?;
                }
                continue;
            }
            if key.starts_with('$') {
                return Err(KeyseekError::InvalidPipeline(format!(
                    "unsupported top-level match operator {}",
                    key
                )));
            }
            validate_path(key).map_err(KeyseekError::InvalidPipeline)?;

            let operators = value
                .as_object()
                .filter(|o| !o.is_empty() && o.keys().all(|k| k.starts_with('$')));
            match operators {
                Some(ops) => {
                    for (op, arg) in ops {
                        self.predicates.push(Predicate {
                            path: key.clone(),
                            op: parse_operator(op, arg)?,
                        });
                    }
                }
                None => self.predicates.push(Predicate {
                    path: key.clone(),
                    op: PredicateOp::Eq(Value::from_json(value.clone())),
                }),
            }
        }
        Ok(())
    }

    pub fn matches(&self, doc: &Value, collation: Option<&Collation>) -> bool {
        self.predicates.iter().all(|p| p.matches(doc, collation))
    }

    /// Split into point bounds (first point predicate per field) and residual predicates.
    pub fn split_points(&self) -> (BTreeMap<String, Value>, Vec<&Predicate>) {
        let mut points = BTreeMap::new();
        let mut residual = Vec::new();
        for predicate in &self.predicates {
            match predicate.point_value() {
                Some(v) if !points.contains_key(&predicate.path) => {
                    points.insert(predicate.path.clone(), v.clone());
                }
                _ => residual.push(predicate),
            }
        }
        (points, residual)
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "$and": self.predicates.iter().map(Predicate::to_json).collect::<Vec<_>>()
        })
    }
}

fn parse_operator(op: &str, arg: &serde_json::Value) -> Result<PredicateOp> {
    let value = || Value::from_json(arg.clone());
    Ok(match op {
        "$eq" => PredicateOp::Eq(value()),
        "$ne" => PredicateOp::Ne(value()),
        "$gt" => PredicateOp::Gt(value()),
        "$gte" => PredicateOp::Gte(value()),
        "$lt" => PredicateOp::Lt(value()),
        "$lte" => PredicateOp::Lte(value()),
        "$in" => PredicateOp::In(
            arg.as_array()
                .ok_or_else(|| KeyseekError::InvalidPipeline("$in needs an array".into()))?
                .iter()
                .cloned()
                .map(Value::from_json)
                .collect(),
        ),
        "$exists" => PredicateOp::Exists(match arg {
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            _ => true,
        }),
        other => {
            return Err(KeyseekError::InvalidPipeline(format!(
                "unsupported match operator {}",
                other
            )));
        }
    })
}

// Sort

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// Whether walking an index field of direction `key` forward yields this order.
    pub fn agrees_with(self, key: KeyDirection) -> Option<bool> {
        match (self, key) {
            (_, KeyDirection::Hashed) => None,
            (SortDirection::Ascending, KeyDirection::Ascending)
            | (SortDirection::Descending, KeyDirection::Descending) => Some(true),
            _ => Some(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    pub path: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub fields: Vec<SortField>,
}

impl SortSpec {
    pub fn new(fields: Vec<(&str, SortDirection)>) -> Self {
        Self {
            fields: fields
                .into_iter()
                .map(|(path, direction)| SortField {
                    path: path.to_string(),
                    direction,
                })
                .collect(),
        }
    }

    pub fn parse(json: &serde_json::Value) -> Result<Self> {
        let obj = json
            .as_object()
            .filter(|o| !o.is_empty())
            .ok_or_else(|| KeyseekError::InvalidPipeline("$sort takes a non-empty object".into()))?;

        let fields = obj
            .iter()
            .map(|(path, dir)| {
                validate_path(path).map_err(KeyseekError::InvalidPipeline)?;
                let direction = match dir.as_f64() {
                    Some(d) if d == 1.0 => SortDirection::Ascending,
                    Some(d) if d == -1.0 => SortDirection::Descending,
                    _ => {
                        return Err(KeyseekError::InvalidPipeline(format!(
                            "$sort direction for '{}' must be 1 or -1",
                            path
                        )));
                    }
                };
                Ok(SortField {
                    path: path.clone(),
                    direction,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { fields })
    }

    /// Per-field sort keys for `doc`. Arrays sort by their smallest element
    /// ascending and their largest element descending.
    pub fn sort_key(&self, doc: &Value, collation: Option<&Collation>) -> Vec<Value> {
        self.fields
            .iter()
            .map(|field| {
                let values = extract_index_values(doc, &field.path).values;
                let pick = match field.direction {
                    SortDirection::Ascending => values
                        .into_iter()
                        .min_by(|a, b| a.compare(b, collation)),
                    SortDirection::Descending => values
                        .into_iter()
                        .max_by(|a, b| a.compare(b, collation)),
                };
                pick.unwrap_or(Value::Null)
            })
            .collect()
    }

    pub fn compare_keys(
        &self,
        a: &[Value],
        b: &[Value],
        collation: Option<&Collation>,
    ) -> std::cmp::Ordering {
        for ((field, x), y) in self.fields.iter().zip(a).zip(b) {
            let ord = match field.direction {
                SortDirection::Ascending => x.compare(y, collation),
                SortDirection::Descending => y.compare(x, collation),
            };
            if ord.is_ne() {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|f| {
                    let dir = match f.direction {
                        SortDirection::Ascending => 1,
                        SortDirection::Descending => -1,
                    };
                    (f.path.clone(), serde_json::json!(dir))
                })
                .collect(),
        )
    }
}

// Project

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionItem {
    Include,
    Exclude,
    Computed(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectSpec {
    pub fields: Vec<(String, ProjectionItem)>,
}

impl ProjectSpec {
    pub fn parse(json: &serde_json::Value) -> Result<Self> {
        let obj = json
            .as_object()
            .filter(|o| !o.is_empty())
            .ok_or_else(|| {
                KeyseekError::InvalidPipeline("$project takes a non-empty object".into())
            })?;

        let mut fields = Vec::with_capacity(obj.len());
        for (path, spec) in obj {
            validate_path(path).map_err(KeyseekError::InvalidPipeline)?;
            let item = match spec {
                serde_json::Value::Bool(true) => ProjectionItem::Include,
                serde_json::Value::Bool(false) => ProjectionItem::Exclude,
                serde_json::Value::Number(n) if n.as_f64() == Some(0.0) => ProjectionItem::Exclude,
                serde_json::Value::Number(_) => ProjectionItem::Include,
                other => ProjectionItem::Computed(Expr::parse(other)?),
            };
            fields.push((path.clone(), item));
        }

        let spec = Self { fields };
        if spec.is_inclusion()
            && spec
                .fields
                .iter()
                .any(|(p, item)| *item == ProjectionItem::Exclude && p != "_id")
        {
            return Err(KeyseekError::InvalidPipeline(
                "cannot mix inclusion and exclusion in $project".into(),
            ));
        }
        Ok(spec)
    }

    fn is_inclusion(&self) -> bool {
        self.fields
            .iter()
            .any(|(_, item)| !matches!(item, ProjectionItem::Exclude))
    }

    pub fn apply(&self, doc: &Value) -> Result<Value> {
        if !self.is_inclusion() {
            let mut out = doc.as_object().cloned().unwrap_or_default();
            for (path, _) in &self.fields {
                remove_path(&mut out, path);
            }
            return Ok(Value::Object(out));
        }

        let mut out = BTreeMap::new();
        let id_excluded = self
            .fields
            .iter()
            .any(|(p, item)| p == "_id" && *item == ProjectionItem::Exclude);
        if !id_excluded {
            if let Some(id) = resolve_path(doc, "_id") {
                out.insert("_id".to_string(), id);
            }
        }
        for (path, item) in &self.fields {
            let value = match item {
                ProjectionItem::Include => resolve_path(doc, path),
                ProjectionItem::Computed(expr) => expr.evaluate(doc)?,
                ProjectionItem::Exclude => None,
            };
            if let Some(v) = value {
                set_path(&mut out, path, v);
            }
        }
        Ok(Value::Object(out))
    }
}

fn remove_path(target: &mut BTreeMap<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            target.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(inner)) = target.get_mut(head) {
                remove_path(inner, rest);
            }
        }
    }
}
