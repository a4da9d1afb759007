use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;
use crate::collation::Collation;
use crate::config::{Config, ExecutorConfig, PlannerConfig};
use crate::query::{Hint, StageType};
use crate::storage::{IndexSpec, KeyPattern};

fn collection(docs: &[serde_json::Value], indexes: &[IndexSpec]) -> Arc<Collection> {
    let coll = Arc::new(Collection::new("test.coll"));
    for spec in indexes {
        coll.create_index(spec.clone()).unwrap();
    }
    for d in docs {
        coll.insert(Value::from_json(d.clone())).unwrap();
    }
    coll
}

fn index(pattern: serde_json::Value) -> IndexSpec {
    IndexSpec::new(KeyPattern::from_json(&pattern).unwrap())
}

fn fallback_only() -> Config {
    Config {
        planner: PlannerConfig {
            enable_distinct_scan: false,
            ..PlannerConfig::default()
        },
        ..Config::default()
    }
}

fn run(coll: &Arc<Collection>, request: &AggregateRequest, config: Config) -> AggregateOutput {
    Aggregator::new(Arc::clone(coll), config)
        .aggregate(request)
        .unwrap()
}

fn ids(docs: &[Value]) -> Vec<Value> {
    docs.iter()
        .map(|d| d.as_object().unwrap()["_id"].clone())
        .collect()
}

fn sorted(mut docs: Vec<Value>) -> Vec<Value> {
    docs.sort_by(|a, b| a.total_cmp(b));
    docs
}

/// Run with and without DISTINCT_SCAN. Asserts the optimized path was taken
/// and that both produce the same documents.
fn assert_equivalent(coll: &Arc<Collection>, request: &AggregateRequest) -> AggregateOutput {
    let optimized = run(coll, request, Config::default());
    let baseline = run(coll, request, fallback_only());
    assert!(
        optimized.explain.uses_distinct_scan(),
        "expected DISTINCT_SCAN, got {:?}",
        optimized.explain.stage_types()
    );
    assert!(!baseline.explain.uses_distinct_scan());
    assert_eq!(
        sorted(optimized.documents.clone()),
        sorted(baseline.documents)
    );
    optimized
}

/// Like [`assert_equivalent`] but also requires the same document order, both
/// against the disabled planner and against a forced collection scan.
fn assert_equivalent_in_order(coll: &Arc<Collection>, request: &AggregateRequest) -> AggregateOutput {
    let optimized = run(coll, request, Config::default());
    let baseline = run(coll, request, fallback_only());
    let natural = run(coll, &request.clone().with_hint(Hint::Natural), Config::default());
    assert!(
        optimized.explain.uses_distinct_scan(),
        "expected DISTINCT_SCAN, got {:?}",
        optimized.explain.stage_types()
    );
    assert!(natural.explain.has_stage(StageType::Collscan));
    assert_eq!(optimized.documents, baseline.documents);
    assert_eq!(optimized.documents, natural.documents);
    optimized
}

fn abc_docs() -> Vec<serde_json::Value> {
    vec![
        json!({"a": 1, "b": 2, "c": 3}),
        json!({"a": 1, "b": 1, "c": 9}),
        json!({"a": 2, "b": 5, "c": 0}),
        json!({"a": 2, "b": 4}),
        json!({"a": null, "b": 7, "c": 1}),
        json!({"b": 6, "c": 2}),
        json!({"a": 3, "b": 0, "c": 5}),
    ]
}

fn request(pipeline: serde_json::Value) -> AggregateRequest {
    AggregateRequest::from_json(&pipeline).unwrap()
}

#[test]
fn test_first_with_sort_matches_fallback() {
    let coll = collection(&abc_docs(), &[index(json!({"a": 1, "b": 1, "c": 1}))]);
    let out = assert_equivalent(
        &coll,
        &request(json!([
            {"$sort": {"a": 1, "b": 1}},
            {"$group": {"_id": "$a", "b": {"$first": "$b"}, "c": {"$first": "$c"}}}
        ])),
    );
    assert!(!out.explain.has_stage(StageType::Fetch));
    assert_eq!(
        out.documents,
        vec![
            Value::from_json(json!({"_id": null, "b": 6, "c": 2})),
            Value::from_json(json!({"_id": 1, "b": 1, "c": 9})),
            Value::from_json(json!({"_id": 2, "b": 4, "c": null})),
            Value::from_json(json!({"_id": 3, "b": 0, "c": 5})),
        ]
    );
}

#[test]
fn test_last_with_fetch_matches_fallback() {
    let coll = collection(&abc_docs(), &[index(json!({"a": 1, "b": 1}))]);
    let out = assert_equivalent(
        &coll,
        &request(json!([
            {"$sort": {"a": -1, "b": -1}},
            {"$group": {"_id": "$a", "doc": {"$last": "$$ROOT"}}}
        ])),
    );
    assert!(out.explain.has_stage(StageType::Fetch));
    let stats = out.stats.unwrap();
    assert_eq!(stats.docs_examined, 4);
    assert_eq!(stats.keys_examined, abc_docs().len() as u64);
}

#[test]
fn test_point_prefix_matches_fallback() {
    let mut docs = abc_docs();
    docs.push(json!({"a": 1, "b": 2, "c": 4}));
    let coll = collection(&docs, &[index(json!({"a": 1, "b": 1, "c": 1}))]);
    assert_equivalent(
        &coll,
        &request(json!([
            {"$match": {"a": 1}},
            {"$sort": {"a": 1, "b": 1, "c": 1}},
            {"$group": {"_id": "$b", "c": {"$first": "$c"}}}
        ])),
    );
}

#[test]
fn test_wrapped_id_and_trailing_stages() {
    let coll = collection(&abc_docs(), &[index(json!({"a": 1}))]);
    let req = request(json!([
        {"$group": {"_id": {"x": "$a"}}},
        {"$sort": {"_id.x": -1}},
        {"$limit": 2}
    ]));
    let optimized = run(&coll, &req, Config::default());
    let baseline = run(&coll, &req, fallback_only());

    assert!(optimized.explain.uses_distinct_scan());
    assert!(!optimized.explain.has_stage(StageType::Sort));
    assert_eq!(optimized.explain.trailing_stages, vec!["$sort", "$limit"]);
    assert_eq!(optimized.documents, baseline.documents);
    assert_eq!(
        optimized.documents,
        vec![
            Value::from_json(json!({"_id": {"x": 3}})),
            Value::from_json(json!({"_id": {"x": 2}})),
        ]
    );
}

#[test]
fn test_collated_index_matches_fallback() {
    let collation = Collation::new("en", 2);
    let docs = [
        json!({"s": "foo", "n": 1}),
        json!({"s": "FOO", "n": 2}),
        json!({"s": "bar", "n": 3}),
        json!({"s": "Bar", "n": 4}),
    ];
    let coll = collection(
        &docs,
        &[index(json!({"s": 1})).with_collation(collation.clone())],
    );
    let req = request(json!([{"$group": {"_id": "$s"}}])).with_collation(Some(collation));
    let out = assert_equivalent(&coll, &req);
    assert_eq!(out.documents.len(), 2);

    // Simple-collation query cannot use the collated index.
    let simple = run(&coll, &request(json!([{"$group": {"_id": "$s"}}])), Config::default());
    assert!(!simple.explain.uses_distinct_scan());
    assert_eq!(simple.documents.len(), 4);
}

#[test]
fn test_first_touches_one_key_per_group() {
    let docs: Vec<serde_json::Value> = (0..500)
        .map(|i| json!({"g": i % 10, "v": i}))
        .collect();
    let coll = collection(&docs, &[index(json!({"g": 1, "v": 1}))]);
    let out = assert_equivalent(
        &coll,
        &request(json!([
            {"$sort": {"g": 1, "v": 1}},
            {"$group": {"_id": "$g", "v": {"$first": "$v"}}}
        ])),
    );
    let stats = out.stats.unwrap();
    assert_eq!(stats.keys_examined, 10);
    assert_eq!(stats.docs_examined, 0);
    assert_eq!(out.documents[3], Value::from_json(json!({"_id": 3, "v": 3})));
}

#[test]
fn test_generated_dataset_equivalence() {
    // Deterministic pseudo-random documents with unique (a, b) pairs.
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };
    let docs: Vec<serde_json::Value> = (0..300)
        .map(|i| match next() % 7 {
            0 => json!({"b": i, "c": next() % 4}),
            1 => json!({"a": null, "b": i}),
            r => json!({"a": r % 4, "b": i, "c": next() % 4, "d": "x"}),
        })
        .collect();
    let coll = collection(
        &docs,
        &[index(json!({"a": 1, "b": 1, "c": 1})), index(json!({"c": 1, "a": -1}))],
    );

    let pipelines = [
        json!([{"$group": {"_id": "$a"}}]),
        json!([{"$sort": {"a": 1, "b": 1}}, {"$group": {"_id": "$a", "b": {"$first": "$b"}}}]),
        json!([{"$sort": {"a": -1, "b": -1}}, {"$group": {"_id": "$a", "b": {"$first": "$b"}, "d": {"$first": "$d"}}}]),
        json!([{"$sort": {"a": 1, "b": 1}}, {"$group": {"_id": "$a", "last": {"$last": "$$ROOT"}}}]),
        json!([{"$match": {"c": 2}}, {"$group": {"_id": "$a"}}]),
        json!([{"$match": {"a": 3}}, {"$sort": {"b": 1}}, {"$group": {"_id": "$b", "c": {"$first": "$c"}}}]),
        json!([{"$group": {"_id": "$a"}}, {"$match": {"_id": {"$gte": 1}}}, {"$skip": 1}]),
    ];
    for pipeline in pipelines {
        let has_sort = pipeline
            .as_array()
            .is_some_and(|stages| stages.iter().any(|s| s.get("$sort").is_some()));
        if has_sort {
            assert_equivalent_in_order(&coll, &request(pipeline));
        } else {
            assert_equivalent(&coll, &request(pipeline));
        }
    }
}

#[test]
fn test_order_dependent_trailing_stages_match_fallback() {
    let coll = collection(&abc_docs(), &[index(json!({"a": 1, "b": 1}))]);

    let out = assert_equivalent_in_order(
        &coll,
        &request(json!([{"$sort": {"a": -1}}, {"$group": {"_id": "$a"}}, {"$limit": 1}])),
    );
    assert_eq!(out.documents, vec![Value::from_json(json!({"_id": 3}))]);

    let out = assert_equivalent_in_order(
        &coll,
        &request(json!([
            {"$sort": {"a": 1, "b": 1}},
            {"$group": {"_id": "$a", "b": {"$first": "$b"}}},
            {"$skip": 1},
            {"$limit": 2}
        ])),
    );
    assert_eq!(
        out.documents,
        vec![
            Value::from_json(json!({"_id": 1, "b": 1})),
            Value::from_json(json!({"_id": 2, "b": 4})),
        ]
    );

    let out = assert_equivalent_in_order(
        &coll,
        &request(json!([
            {"$sort": {"a": -1, "b": -1}},
            {"$group": {"_id": "$a", "doc": {"$last": "$$ROOT"}}},
            {"$skip": 2}
        ])),
    );
    assert_eq!(
        ids(&out.documents),
        vec![Value::Int64(1), Value::Null]
    );
}

#[test]
fn test_large_integer_and_double_keys_match_fallback() {
    let docs = [
        json!({"a": 9_007_199_254_740_993_i64}),
        json!({"a": 9_007_199_254_740_992.0}),
        json!({"a": 9_007_199_254_740_992_i64}),
    ];
    let coll = collection(&docs, &[index(json!({"a": 1}))]);

    let out = assert_equivalent_in_order(
        &coll,
        &request(json!([{"$sort": {"a": 1}}, {"$group": {"_id": "$a"}}])),
    );
    assert_eq!(out.documents.len(), 2);
    assert_eq!(out.stats.unwrap().keys_examined, 2);

    let out = assert_equivalent_in_order(
        &coll,
        &request(json!([{"$sort": {"a": -1}}, {"$group": {"_id": "$a"}}, {"$limit": 1}])),
    );
    assert_eq!(
        out.documents,
        vec![Value::from_json(json!({"_id": 9_007_199_254_740_993_i64}))]
    );
}

#[test]
fn test_ineligible_pipelines_use_fallback() {
    let coll = collection(&abc_docs(), &[index(json!({"a": 1, "b": 1, "c": 1}))]);

    let sum = run(
        &coll,
        &request(json!([{"$group": {"_id": "$a", "s": {"$sum": "$b"}}}])),
        Config::default(),
    );
    assert_eq!(
        sum.explain.stage_types(),
        vec![StageType::Group, StageType::Fetch, StageType::Ixscan]
    );
    assert_eq!(
        sum.documents,
        vec![
            Value::from_json(json!({"_id": null, "s": 13})),
            Value::from_json(json!({"_id": 1, "s": 3})),
            Value::from_json(json!({"_id": 2, "s": 9})),
            Value::from_json(json!({"_id": 3, "s": 0})),
        ]
    );
    assert!(sum.stats.is_none());

    let limited = run(
        &coll,
        &request(json!([{"$limit": 3}, {"$group": {"_id": "$a"}}])),
        Config::default(),
    );
    assert!(!limited.explain.uses_distinct_scan());
    assert_eq!(
        limited.explain.ineligible_reason.as_deref(),
        Some("$limit before $group")
    );
    assert_eq!(limited.documents.len(), 2);
}

#[test]
fn test_multikey_path_prefix_falls_back() {
    let docs = [
        json!({"mkFoo": [{"a": 1}, {"a": 2}]}),
        json!({"mkFoo": {"a": 3}}),
    ];
    let coll = collection(&docs, &[index(json!({"mkFoo.a": 1}))]);
    let out = run(&coll, &request(json!([{"$group": {"_id": "$mkFoo.a"}}])), Config::default());
    assert!(!out.explain.uses_distinct_scan());
    assert_eq!(out.documents.len(), 2);
}

#[test]
fn test_hints() {
    let coll = collection(&abc_docs(), &[index(json!({"a": 1})), index(json!({"a": 1, "b": 1}))]);
    let req = request(json!([{"$group": {"_id": "$a"}}]));

    let natural = run(&coll, &req.clone().with_hint(Hint::Natural), Config::default());
    assert_eq!(natural.explain.stage_types(), vec![StageType::Group, StageType::Collscan]);

    let named = run(&coll, &req.clone().with_hint(Hint::ByName("a_1_b_1".into())), Config::default());
    assert_eq!(
        named.explain.find_stage(StageType::DistinctScan).unwrap().index_name.as_deref(),
        Some("a_1_b_1")
    );
    assert_eq!(sorted(named.documents), sorted(natural.documents));

    let err = Aggregator::new(Arc::clone(&coll), Config::default())
        .aggregate(&req.with_hint(Hint::ByName("nope".into())))
        .unwrap_err();
    assert_eq!(err.kind(), "index_not_found");
}

#[test]
fn test_explain_does_not_execute() {
    let coll = collection(&abc_docs(), &[index(json!({"a": 1}))]);
    let aggregator = Aggregator::new(Arc::clone(&coll), Config::default());
    let req = request(json!([{"$group": {"_id": "$a"}}]));
    let explain = aggregator.explain(&req).unwrap();
    assert!(explain.uses_distinct_scan());
    assert_eq!(explain.catalog_epoch, coll.epoch());
    assert_eq!(explain, aggregator.aggregate(&req).unwrap().explain);
}

#[test]
fn test_blocking_sort_limit_surfaces() {
    let coll = collection(&abc_docs(), &[]);
    let config = Config {
        executor: ExecutorConfig {
            max_blocking_sort_documents: 2,
            ..ExecutorConfig::default()
        },
        ..Config::default()
    };
    let err = Aggregator::new(coll, config)
        .aggregate(&request(json!([{"$sort": {"c": 1}}, {"$group": {"_id": "$a"}}])))
        .unwrap_err();
    assert_eq!(err.kind(), "resource_exhausted");
}

#[test]
fn test_concurrent_writes_never_corrupt_results() {
    let docs: Vec<serde_json::Value> = (0..200).map(|i| json!({"g": i % 20})).collect();
    let coll = collection(&docs, &[index(json!({"g": 1}))]);
    let req = request(json!([{"$group": {"_id": "$g"}}]));

    let writer = {
        let coll = Arc::clone(&coll);
        std::thread::spawn(move || {
            for i in 0..200 {
                coll.insert(Value::from_json(json!({"g": i % 20}))).unwrap();
            }
        })
    };

    let config = Config {
        executor: ExecutorConfig {
            max_replans: usize::MAX,
            ..ExecutorConfig::default()
        },
        ..Config::default()
    };
    for _ in 0..20 {
        let out = run(&coll, &req, config.clone());
        assert_eq!(out.documents.len(), 20);
    }
    writer.join().unwrap();
}
