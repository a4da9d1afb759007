//! Aggregation expressions
//!
//! The small expression language accepted by `$group` keys, accumulator
//! arguments and computed `$project` fields.

use std::collections::BTreeMap;

use crate::document::{resolve_path, validate_path};
use crate::error::{KeyseekError, Result};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `"$a.b"`
    Field(String),
    /// `"$$ROOT"` / `"$$CURRENT"`
    Root,
    Literal(Value),
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Add(Vec<Expr>),
    Subtract(Box<Expr>, Box<Expr>),
    Multiply(Vec<Expr>),
    Concat(Vec<Expr>),
    IfNull(Vec<Expr>),
}

impl Expr {
    pub fn parse(json: &serde_json::Value) -> Result<Self> {
        match json {
            serde_json::Value::String(s) if s.starts_with("$$") => match s.as_str() {
                "$$ROOT" | "$$CURRENT" => Ok(Expr::Root),
                other => Err(KeyseekError::InvalidExpression(format!(
                    "unknown variable: {}",
                    other
                ))),
            },
            serde_json::Value::String(s) if s.starts_with('$') => {
                let path = &s[1..];
                validate_path(path).map_err(KeyseekError::InvalidExpression)?;
                Ok(Expr::Field(path.to_string()))
            }
            serde_json::Value::Array(items) => {
                Ok(Expr::Array(items.iter().map(Expr::parse).collect::<Result<_>>()?))
            }
            serde_json::Value::Object(map) => {
                let mut iter = map.iter();
                match (iter.next(), iter.next()) {
                    (Some((op, arg)), None) if op.starts_with('$') => Self::parse_operator(op, arg),
                    _ => {
                        let fields = map
                            .iter()
                            .map(|(name, value)| {
                                if name.starts_with('$') {
                                    return Err(KeyseekError::InvalidExpression(format!(
                                        "field name '{}' may not start with '$'",
                                        name
                                    )));
                                }
                                Ok((name.clone(), Expr::parse(value)?))
                            })
                            .collect::<Result<Vec<_>>>()?;
                        Ok(Expr::Object(fields))
                    }
                }
            }
            other => Ok(Expr::Literal(Value::from_json(other.clone()))),
        }
    }

    fn parse_operator(op: &str, arg: &serde_json::Value) -> Result<Self> {
        let args = || -> Result<Vec<Expr>> {
            match arg {
                serde_json::Value::Array(items) => items.iter().map(Expr::parse).collect(),
                single => Ok(vec![Expr::parse(single)?]),
            }
        };

        match op {
            "$literal" => Ok(Expr::Literal(Value::from_json(arg.clone()))),
            "$add" => Ok(Expr::Add(args()?)),
            "$multiply" => Ok(Expr::Multiply(args()?)),
            "$concat" => Ok(Expr::Concat(args()?)),
            "$ifNull" => {
                let args = args()?;
                if args.len() < 2 {
                    return Err(KeyseekError::InvalidExpression(
                        "$ifNull needs at least two arguments".into(),
                    ));
                }
                Ok(Expr::IfNull(args))
            }
            "$subtract" => {
                let [lhs, rhs]: [Expr; 2] = args()?.try_into().map_err(|_| {
                    KeyseekError::InvalidExpression("$subtract takes exactly two arguments".into())
                })?;
                Ok(Expr::Subtract(Box::new(lhs), Box::new(rhs)))
            }
            other => Err(KeyseekError::InvalidExpression(format!(
                "unsupported expression operator: {}",
                other
            ))),
        }
    }

    /// Evaluate against `doc`. `None` means the result is missing.
    pub fn evaluate(&self, doc: &Value) -> Result<Option<Value>> {
        match self {
            Expr::Field(path) => Ok(resolve_path(doc, path)),
            Expr::Root => Ok(Some(doc.clone())),
            Expr::Literal(v) => Ok(Some(v.clone())),
            Expr::Object(fields) => {
                let mut out = BTreeMap::new();
                for (name, expr) in fields {
                    if let Some(v) = expr.evaluate(doc)? {
                        out.insert(name.clone(), v);
                    }
                }
                Ok(Some(Value::Object(out)))
            }
            Expr::Array(items) => {
                let values = items
                    .iter()
                    .map(|e| Ok(e.evaluate(doc)?.unwrap_or(Value::Null)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Some(Value::Array(values)))
            }
            Expr::Add(args) => arithmetic("$add", args, doc, i64::checked_add, |a, b| a + b),
            Expr::Multiply(args) => {
                arithmetic("$multiply", args, doc, i64::checked_mul, |a, b| a * b)
            }
            Expr::Subtract(lhs, rhs) => {
                let pair = [lhs.as_ref().clone(), rhs.as_ref().clone()];
                arithmetic("$subtract", &pair, doc, i64::checked_sub, |a, b| a - b)
            }
            Expr::Concat(args) => {
                let mut out = String::new();
                for arg in args {
                    match arg.evaluate(doc)? {
                        None | Some(Value::Null) => return Ok(Some(Value::Null)),
                        Some(Value::String(s)) => out.push_str(&s),
                        Some(other) => {
                            return Err(KeyseekError::InvalidExpression(format!(
                                "$concat only supports strings, not {}",
                                other.type_name()
                            )));
                        }
                    }
                }
                Ok(Some(Value::String(out)))
            }
            Expr::IfNull(args) => {
                let (last, init) = match args.split_last() {
                    Some(split) => split,
                    None => return Ok(Some(Value::Null)),
                };
                for arg in init {
                    match arg.evaluate(doc)? {
                        None | Some(Value::Null) => continue,
                        Some(v) => return Ok(Some(v)),
                    }
                }
                last.evaluate(doc)
            }
        }
    }

    /// Collect the dotted paths this expression reads. Returns false if it needs
    /// the whole document.
    pub fn referenced_paths(&self, out: &mut Vec<String>) -> bool {
        match self {
            Expr::Field(path) => {
                out.push(path.clone());
                true
            }
            Expr::Root => false,
            Expr::Literal(_) => true,
            Expr::Object(fields) => fields.iter().all(|(_, e)| e.referenced_paths(out)),
            Expr::Array(items)
            | Expr::Add(items)
            | Expr::Multiply(items)
            | Expr::Concat(items)
            | Expr::IfNull(items) => items.iter().all(|e| e.referenced_paths(out)),
            Expr::Subtract(lhs, rhs) => lhs.referenced_paths(out) && rhs.referenced_paths(out),
        }
    }

    pub fn as_field(&self) -> Option<&str> {
        match self {
            Expr::Field(path) => Some(path),
            _ => None,
        }
    }
}

fn arithmetic(
    name: &str,
    args: &[Expr],
    doc: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Option<Value>> {
    let mut acc: Option<Value> = None;
    for arg in args {
        let v = match arg.evaluate(doc)? {
            None | Some(Value::Null) => return Ok(Some(Value::Null)),
            Some(v) if v.is_numeric() => v,
            Some(other) => {
                return Err(KeyseekError::InvalidExpression(format!(
                    "{} only supports numeric types, not {}",
                    name,
                    other.type_name()
                )));
            }
        };
        acc = Some(match (acc, v) {
            (None, v) => v,
            (Some(Value::Int64(a)), Value::Int64(b)) => match int_op(a, b) {
                Some(r) => Value::Int64(r),
                None => Value::Float64(float_op(a as f64, b as f64)),
            },
            (Some(a), b) => Value::Float64(float_op(
                a.as_f64().unwrap_or_default(),
                b.as_f64().unwrap_or_default(),
            )),
        });
    }
    Ok(acc.or(Some(Value::Int64(0))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: serde_json::Value, doc: serde_json::Value) -> Option<Value> {
        Expr::parse(&expr)
            .unwrap()
            .evaluate(&Value::from_json(doc))
            .unwrap()
    }

    #[test]
    fn test_field_and_root() {
        assert_eq!(eval(json!("$a.b"), json!({"a": {"b": 2}})), Some(Value::Int64(2)));
        assert_eq!(eval(json!("$missing"), json!({"a": 1})), None);
        assert_eq!(
            eval(json!("$$ROOT"), json!({"a": 1})),
            Some(Value::from_json(json!({"a": 1})))
        );
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval(json!({"$add": ["$a", 2]}), json!({"a": 1})), Some(Value::Int64(3)));
        assert_eq!(
            eval(json!({"$multiply": ["$a", 1.5]}), json!({"a": 2})),
            Some(Value::Float64(3.0))
        );
        assert_eq!(
            eval(json!({"$subtract": ["$a", "$b"]}), json!({"a": 5, "b": 7})),
            Some(Value::Int64(-2))
        );
        assert_eq!(eval(json!({"$add": ["$a", "$nope"]}), json!({"a": 1})), Some(Value::Null));

        let err = Expr::parse(&json!({"$add": ["$a", 1]}))
            .unwrap()
            .evaluate(&Value::from_json(json!({"a": "x"})))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_expression");
    }

    #[test]
    fn test_concat_and_if_null() {
        assert_eq!(
            eval(json!({"$concat": ["$a", "-", "$b"]}), json!({"a": "x", "b": "y"})),
            Some(Value::from("x-y"))
        );
        assert_eq!(
            eval(json!({"$ifNull": ["$a", "$b", "dflt"]}), json!({"b": null})),
            Some(Value::from("dflt"))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse(&json!("$")).is_err());
        assert!(Expr::parse(&json!("$$NOW")).is_err());
        assert!(Expr::parse(&json!({"$regexMatch": {}})).is_err());
        assert!(Expr::parse(&json!({"$subtract": [1]})).is_err());
    }

    #[test]
    fn test_referenced_paths() {
        let mut out = Vec::new();
        let e = Expr::parse(&json!({"x": "$a", "y": {"$add": ["$b.c", 1]}})).unwrap();
        assert!(e.referenced_paths(&mut out));
        assert_eq!(out, vec!["a".to_string(), "b.c".to_string()]);
        assert!(!Expr::Root.referenced_paths(&mut out));
    }
}
