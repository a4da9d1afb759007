use std::sync::Arc;

use keyseek_core::query::StageType;
use keyseek_core::{
    AggregateRequest, Aggregator, Collection, Config, Hint, IndexSpec, KeyPattern, Value,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn orders() -> Arc<Collection> {
    let coll = Arc::new(Collection::new("shop.orders"));
    let docs = json!([
        {"customer": "ann", "day": 3, "total": 30},
        {"customer": "bob", "day": 1, "total": 12},
        {"customer": "ann", "day": 1, "total": 10},
        {"customer": "cid", "day": 2, "total": 7},
        {"customer": "bob", "day": 5, "total": 50},
        {"day": 4, "total": 1}
    ]);
    for d in docs.as_array().unwrap() {
        coll.insert(Value::from_json(d.clone())).unwrap();
    }
    coll.create_index(IndexSpec::new(
        KeyPattern::from_json(&json!({"customer": 1, "day": -1})).unwrap(),
    ))
    .unwrap();
    coll
}

fn pipeline(p: serde_json::Value) -> AggregateRequest {
    AggregateRequest::from_json(&p).unwrap()
}

#[test]
fn test_latest_order_per_customer() {
    let aggregator = Aggregator::new(orders(), Config::default());
    let request = pipeline(json!([
        {"$sort": {"customer": 1, "day": -1}},
        {"$group": {"_id": "$customer", "latest": {"$first": "$day"}, "order": {"$first": "$$ROOT"}}},
        {"$project": {"latest": 1}}
    ]));

    let out = aggregator.aggregate(&request).unwrap();
    assert!(out.explain.uses_distinct_scan());
    assert_eq!(
        out.explain.stage_types(),
        vec![StageType::Group, StageType::Fetch, StageType::DistinctScan]
    );
    assert_eq!(out.explain.trailing_stages, vec!["$project".to_string()]);
    assert_eq!(
        out.documents,
        vec![
            Value::from_json(json!({"_id": null, "latest": 4})),
            Value::from_json(json!({"_id": "ann", "latest": 3})),
            Value::from_json(json!({"_id": "bob", "latest": 5})),
            Value::from_json(json!({"_id": "cid", "latest": 2})),
        ]
    );
}

#[test]
fn test_forced_collection_scan_gives_same_groups() {
    let coll = orders();
    let aggregator = Aggregator::new(Arc::clone(&coll), Config::default());
    let base = json!([
        {"$sort": {"customer": -1, "day": 1}},
        {"$group": {"_id": "$customer", "first": {"$first": "$total"}}}
    ]);

    let optimized = aggregator.aggregate(&pipeline(base.clone())).unwrap();
    let forced = aggregator
        .aggregate(&pipeline(base).with_hint(Hint::Natural))
        .unwrap();

    assert!(optimized.explain.uses_distinct_scan());
    assert_eq!(
        optimized
            .explain
            .find_stage(StageType::DistinctScan)
            .unwrap()
            .direction
            .as_deref(),
        Some("backward")
    );
    assert!(forced.explain.has_stage(StageType::Collscan));
    assert!(forced.explain.has_stage(StageType::Sort));

    let mut a = optimized.documents;
    let mut b = forced.documents;
    a.sort_by(|x, y| x.total_cmp(y));
    b.sort_by(|x, y| x.total_cmp(y));
    assert_eq!(a, b);
}

#[test]
fn test_explain_serializes() {
    let aggregator = Aggregator::new(orders(), Config::default());
    let explain = aggregator
        .explain(&pipeline(json!([{"$group": {"_id": "$customer"}}])))
        .unwrap();
    let json = explain.to_json();
    assert_eq!(json["namespace"], json!("shop.orders"));
    assert_eq!(
        json["winningPlan"]["inputStage"]["stageType"],
        json!("PROJECTION_COVERED")
    );
    assert_eq!(
        json["winningPlan"]["inputStage"]["inputStage"]["keyPattern"],
        json!({"customer": 1, "day": -1})
    );
}

#[test]
fn test_malformed_group_propagates() {
    let aggregator = Aggregator::new(orders(), Config::default());
    let err = AggregateRequest::from_json(&json!([{"$group": {"total": {"$sum": 1}}}]))
        .and_then(|request| aggregator.aggregate(&request))
        .unwrap_err();
    assert_eq!(err.kind(), "malformed_group_spec");
}
