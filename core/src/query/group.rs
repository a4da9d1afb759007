//! `$group` specification

use std::collections::BTreeSet;

use crate::document::validate_path;
use crate::error::{KeyseekError, Result};
use crate::query::expr::Expr;
use crate::value::Value;

/// Shape of the `_id` of a `$group`.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupKey {
    /// `_id: "$a"`
    Field(String),
    /// `_id: {name: "$a"}`
    Wrapped { name: String, path: String },
    /// `_id: {x: "$a", y: "$b"}`
    Compound(Vec<(String, Expr)>),
    /// `_id: null`, `_id: 1`, ...
    Constant(Value),
    /// `$$ROOT` or an operator expression.
    Expression(Expr),
}

impl GroupKey {
    pub fn parse(json: &serde_json::Value) -> Result<Self> {
        if let serde_json::Value::String(s) = json {
            if s.starts_with('$') && !s.starts_with("$$") {
                let path = &s[1..];
                validate_path(path).map_err(KeyseekError::MalformedGroupSpec)?;
                return Ok(GroupKey::Field(path.to_string()));
            }
        }

        match Expr::parse(json)? {
            Expr::Object(mut fields) if fields.len() == 1 => match fields.pop() {
                Some((name, Expr::Field(path))) => Ok(GroupKey::Wrapped { name, path }),
                Some(field) => Ok(GroupKey::Compound(vec![field])),
                None => Ok(GroupKey::Compound(Vec::new())),
            },
            Expr::Object(fields) => Ok(GroupKey::Compound(fields)),
            Expr::Literal(v) => Ok(GroupKey::Constant(v)),
            other => Ok(GroupKey::Expression(other)),
        }
    }

    /// The single stored field this key groups by, if it has that shape.
    pub fn single_field(&self) -> Option<&str> {
        match self {
            GroupKey::Field(path) | GroupKey::Wrapped { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Group key for `doc`. Missing resolves to null.
    pub fn evaluate(&self, doc: &Value) -> Result<Value> {
        match self {
            GroupKey::Field(path) => Ok(Expr::Field(path.clone())
                .evaluate(doc)?
                .unwrap_or(Value::Null)),
            GroupKey::Wrapped { name, path } => {
                let v = Expr::Field(path.clone())
                    .evaluate(doc)?
                    .unwrap_or(Value::Null);
                Ok(Self::wrap(name, v))
            }
            GroupKey::Compound(fields) => Ok(Expr::Object(fields.clone())
                .evaluate(doc)?
                .unwrap_or(Value::Null)),
            GroupKey::Constant(v) => Ok(v.clone()),
            GroupKey::Expression(expr) => Ok(expr.evaluate(doc)?.unwrap_or(Value::Null)),
        }
    }

    /// Output `_id` for a group whose single field has value `value`.
    pub fn from_field_value(&self, value: Value) -> Value {
        match self {
            GroupKey::Wrapped { name, .. } => Self::wrap(name, value),
            _ => value,
        }
    }

    fn wrap(name: &str, value: Value) -> Value {
        Value::Object(std::iter::once((name.to_string(), value)).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccumulatorOp {
    First,
    Last,
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Push,
    AddToSet,
}

/// Coarse classification used by the eligibility analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorKind {
    First,
    Last,
    Other,
}

impl AccumulatorOp {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$first" => AccumulatorOp::First,
            "$last" => AccumulatorOp::Last,
            "$sum" => AccumulatorOp::Sum,
            "$avg" => AccumulatorOp::Avg,
            "$min" => AccumulatorOp::Min,
            "$max" => AccumulatorOp::Max,
            "$count" => AccumulatorOp::Count,
            "$push" => AccumulatorOp::Push,
            "$addToSet" => AccumulatorOp::AddToSet,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            AccumulatorOp::First => "$first",
            AccumulatorOp::Last => "$last",
            AccumulatorOp::Sum => "$sum",
            AccumulatorOp::Avg => "$avg",
            AccumulatorOp::Min => "$min",
            AccumulatorOp::Max => "$max",
            AccumulatorOp::Count => "$count",
            AccumulatorOp::Push => "$push",
            AccumulatorOp::AddToSet => "$addToSet",
        }
    }

    pub fn kind(self) -> AccumulatorKind {
        match self {
            AccumulatorOp::First => AccumulatorKind::First,
            AccumulatorOp::Last => AccumulatorKind::Last,
            _ => AccumulatorKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatorSpec {
    pub output: String,
    pub op: AccumulatorOp,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    pub id: GroupKey,
    pub accumulators: Vec<AccumulatorSpec>,
}

impl GroupSpec {
    pub fn new(id: GroupKey) -> Self {
        Self {
            id,
            accumulators: Vec::new(),
        }
    }

    /// Shorthand for `{_id: "$path"}`.
    pub fn by_field(path: impl Into<String>) -> Self {
        Self::new(GroupKey::Field(path.into()))
    }

    pub fn with_accumulator(mut self, output: impl Into<String>, op: AccumulatorOp, expr: Expr) -> Self {
        self.accumulators.push(AccumulatorSpec {
            output: output.into(),
            op,
            expr,
        });
        self
    }

    pub fn parse(json: &serde_json::Value) -> Result<Self> {
        let obj = json
            .as_object()
            .ok_or_else(|| KeyseekError::MalformedGroupSpec("$group takes an object".into()))?;
        let id_json = obj
            .get("_id")
            .ok_or_else(|| KeyseekError::MalformedGroupSpec("a group specification must include an _id".into()))?;
        let id = GroupKey::parse(id_json)?;

        let mut accumulators = Vec::new();
        for (output, spec) in obj.iter().filter(|(k, _)| k.as_str() != "_id") {
            let spec_obj = spec.as_object().filter(|o| o.len() == 1).ok_or_else(|| {
                KeyseekError::MalformedGroupSpec(format!(
                    "accumulator '{}' must be an object with exactly one operator",
                    output
                ))
            })?;
            let Some((op_name, arg)) = spec_obj.iter().next() else {
                continue;
            };
            let op = AccumulatorOp::from_name(op_name).ok_or_else(|| {
                KeyseekError::MalformedGroupSpec(format!("unknown group operator '{}'", op_name))
            })?;
            let expr = match op {
                AccumulatorOp::Count => Expr::Literal(Value::Int64(1)),
                _ => Expr::parse(arg)?,
            };
            accumulators.push(AccumulatorSpec {
                output: output.clone(),
                op,
                expr,
            });
        }

        let spec = Self { id, accumulators };
        spec.validate()?;
        Ok(spec)
    }

    /// Structural checks shared by parsed and hand-built specs.
    pub fn validate(&self) -> Result<()> {
        match &self.id {
            GroupKey::Field(path) => validate_path(path).map_err(KeyseekError::MalformedGroupSpec)?,
            GroupKey::Wrapped { name, path } => {
                validate_output_name(name)?;
                validate_path(path).map_err(KeyseekError::MalformedGroupSpec)?;
            }
            GroupKey::Compound(fields) => {
                for (name, _) in fields {
                    validate_output_name(name)?;
                }
            }
            GroupKey::Constant(_) | GroupKey::Expression(_) => {}
        }

        let mut seen = BTreeSet::new();
        for acc in &self.accumulators {
            validate_output_name(&acc.output)?;
            if acc.output == "_id" || !seen.insert(acc.output.as_str()) {
                return Err(KeyseekError::MalformedGroupSpec(format!(
                    "duplicate output field '{}'",
                    acc.output
                )));
            }
            if let Expr::Field(path) = &acc.expr {
                validate_path(path).map_err(KeyseekError::MalformedGroupSpec)?;
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        let id = match &self.id {
            GroupKey::Field(path) => serde_json::json!(format!("${}", path)),
            GroupKey::Wrapped { name, path } => single_entry(name, serde_json::json!(format!("${}", path))),
            GroupKey::Constant(v) => v.to_json(),
            GroupKey::Compound(_) | GroupKey::Expression(_) => serde_json::json!("<expression>"),
        };
        obj.insert("_id".into(), id);
        for acc in &self.accumulators {
            let arg = match &acc.expr {
                Expr::Field(path) => serde_json::json!(format!("${}", path)),
                Expr::Root => serde_json::json!("$$ROOT"),
                Expr::Literal(v) => v.to_json(),
                _ => serde_json::json!("<expression>"),
            };
            obj.insert(acc.output.clone(), single_entry(acc.op.name(), arg));
        }
        serde_json::Value::Object(obj)
    }
}

fn single_entry(key: &str, value: serde_json::Value) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    obj.insert(key.to_string(), value);
    serde_json::Value::Object(obj)
}

fn validate_output_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('$') || name.contains('.') {
        return Err(KeyseekError::MalformedGroupSpec(format!(
            "invalid output field name '{}'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_shapes() {
        assert_eq!(GroupKey::parse(&json!("$a")).unwrap(), GroupKey::Field("a".into()));
        assert_eq!(
            GroupKey::parse(&json!({"x": "$a.b"})).unwrap(),
            GroupKey::Wrapped {
                name: "x".into(),
                path: "a.b".into()
            }
        );
        assert!(matches!(
            GroupKey::parse(&json!({"aa": "$aa", "mkB": "$mkB"})).unwrap(),
            GroupKey::Compound(f) if f.len() == 2
        ));
        assert_eq!(GroupKey::parse(&json!(null)).unwrap(), GroupKey::Constant(Value::Null));
        assert_eq!(GroupKey::parse(&json!("$$ROOT")).unwrap(), GroupKey::Expression(Expr::Root));
    }

    #[test]
    fn test_wrapped_key_evaluates_missing_as_null() {
        let key = GroupKey::parse(&json!({"x": "$a"})).unwrap();
        let doc = Value::from_json(json!({"b": 1}));
        assert_eq!(key.evaluate(&doc).unwrap(), Value::from_json(json!({"x": null})));
    }

    #[test]
    fn test_parse_accumulators() {
        let spec = GroupSpec::parse(&json!({
            "_id": "$a",
            "f": {"$first": "$b"},
            "n": {"$count": {}},
        }))
        .unwrap();
        assert_eq!(spec.accumulators.len(), 2);
        assert_eq!(spec.accumulators[0].op.kind(), AccumulatorKind::First);
        assert_eq!(spec.accumulators[1].op, AccumulatorOp::Count);
    }

    #[test]
    fn test_malformed_specs() {
        for bad in [
            json!({"f": {"$first": "$b"}}),
            json!({"_id": "$"}),
            json!({"_id": "$a..b"}),
            json!({"_id": "$a", "f": {"$first": "$b", "$last": "$c"}}),
            json!({"_id": "$a", "f": {"$median": "$b"}}),
            json!({"_id": "$a", "x.y": {"$first": "$b"}}),
        ] {
            let err = GroupSpec::parse(&bad).unwrap_err();
            assert_eq!(err.kind(), "malformed_group_spec", "{}", bad);
        }
    }

    #[test]
    fn test_validate_hand_built_spec() {
        let spec = GroupSpec::by_field("");
        assert_eq!(spec.validate().unwrap_err().kind(), "malformed_group_spec");

        let spec = GroupSpec::by_field("a")
            .with_accumulator("f", AccumulatorOp::First, Expr::Field("b".into()))
            .with_accumulator("f", AccumulatorOp::First, Expr::Field("c".into()));
        assert!(spec.validate().is_err());
    }
}
