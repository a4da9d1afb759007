//! Explain output
//!
//! The winning plan is a chain of stages from the output down to the access
//! path. Stages after `$group` are listed separately in `trailingStages`, so a
//! plan tree containing `DISTINCT_SCAN` never contains `SORT`.

use serde::Serialize;

use crate::query::group::GroupSpec;
use crate::query::plan::{Bounds, ScanDirection, ScanPlan};
use crate::query::pipeline::PipelineStage;
use crate::storage::IndexDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageType {
    Collscan,
    Ixscan,
    Fetch,
    DistinctScan,
    ProjectionCovered,
    Sort,
    Limit,
    Skip,
    Projection,
    Match,
    Group,
}

impl StageType {
    pub fn as_str(self) -> &'static str {
        match self {
            StageType::Collscan => "COLLSCAN",
            StageType::Ixscan => "IXSCAN",
            StageType::Fetch => "FETCH",
            StageType::DistinctScan => "DISTINCT_SCAN",
            StageType::ProjectionCovered => "PROJECTION_COVERED",
            StageType::Sort => "SORT",
            StageType::Limit => "LIMIT",
            StageType::Skip => "SKIP",
            StageType::Projection => "PROJECTION",
            StageType::Match => "MATCH",
            StageType::Group => "GROUP",
        }
    }
}

impl std::fmt::Display for StageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStage {
    pub stage_type: StageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_pattern: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_bounds: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_multi_key: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_pattern: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_stage: Option<Box<PlanStage>>,
}

impl PlanStage {
    pub fn new(stage_type: StageType) -> Self {
        Self {
            stage_type,
            key_pattern: None,
            index_name: None,
            direction: None,
            index_bounds: None,
            is_multi_key: None,
            filter: None,
            sort_pattern: None,
            limit_amount: None,
            skip_amount: None,
            group: None,
            input_stage: None,
        }
    }

    /// An index-backed scan stage (`IXSCAN` or `DISTINCT_SCAN`).
    pub fn index_scan(
        stage_type: StageType,
        index: &IndexDescriptor,
        direction: ScanDirection,
        bounds: &[Bounds],
    ) -> Self {
        let mut intervals = serde_json::Map::new();
        for (pos, field) in index.key_pattern.fields().iter().enumerate() {
            let walk = match (direction, field.direction) {
                (ScanDirection::Backward, dir) => dir.reversed(),
                (ScanDirection::Forward, dir) => dir,
            };
            let bound = bounds.get(pos).unwrap_or(&Bounds::Full);
            intervals.insert(
                field.path.clone(),
                serde_json::json!([bound.interval(walk)]),
            );
        }

        Self {
            key_pattern: Some(index.key_pattern.to_json()),
            index_name: Some(index.name.clone()),
            direction: Some(direction.as_str().to_string()),
            index_bounds: Some(serde_json::Value::Object(intervals)),
            is_multi_key: Some(index.is_multikey()),
            ..Self::new(stage_type)
        }
    }

    pub fn with_input(mut self, input: PlanStage) -> Self {
        self.input_stage = Some(Box::new(input));
        self
    }

    pub fn with_filter(mut self, filter: Option<serde_json::Value>) -> Self {
        self.filter = filter;
        self
    }

    pub fn group(spec: &GroupSpec) -> Self {
        Self {
            group: Some(spec.to_json()),
            ..Self::new(StageType::Group)
        }
    }

    /// Stage types from this stage down to the leaf.
    pub fn stage_types(&self) -> Vec<StageType> {
        let mut out = vec![self.stage_type];
        let mut current = self;
        while let Some(input) = &current.input_stage {
            out.push(input.stage_type);
            current = input;
        }
        out
    }

    pub fn find(&self, stage_type: StageType) -> Option<&PlanStage> {
        if self.stage_type == stage_type {
            return Some(self);
        }
        self.input_stage.as_ref()?.find(stage_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Explain {
    pub namespace: String,
    pub catalog_epoch: u64,
    pub winning_plan: PlanStage,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trailing_stages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ineligible_reason: Option<String>,
}

impl Explain {
    /// `GROUP <- PROJECTION_COVERED|FETCH <- DISTINCT_SCAN`
    pub fn distinct_scan(namespace: &str, plan: &ScanPlan) -> Self {
        let scan = PlanStage::index_scan(
            StageType::DistinctScan,
            &plan.index,
            plan.direction,
            &plan.full_bounds(),
        );
        let middle = if plan.fetch_required {
            PlanStage::new(StageType::Fetch)
        } else {
            PlanStage::new(StageType::ProjectionCovered)
        };

        Self {
            namespace: namespace.to_string(),
            catalog_epoch: plan.catalog_epoch,
            winning_plan: PlanStage::group(&plan.group).with_input(middle.with_input(scan)),
            trailing_stages: trailing_names(&plan.trailing),
            ineligible_reason: None,
        }
    }

    pub fn stage_types(&self) -> Vec<StageType> {
        self.winning_plan.stage_types()
    }

    pub fn has_stage(&self, stage_type: StageType) -> bool {
        self.winning_plan.find(stage_type).is_some()
    }

    pub fn find_stage(&self, stage_type: StageType) -> Option<&PlanStage> {
        self.winning_plan.find(stage_type)
    }

    pub fn uses_distinct_scan(&self) -> bool {
        self.has_stage(StageType::DistinctScan)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

pub fn trailing_names(stages: &[PipelineStage]) -> Vec<String> {
    stages.iter().map(|s| s.name().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{IndexDescriptor, KeyPattern};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn descriptor(pattern: serde_json::Value) -> IndexDescriptor {
        let key_pattern = KeyPattern::from_json(&pattern).unwrap();
        IndexDescriptor {
            name: key_pattern.default_name(),
            key_pattern,
            multikey_paths: BTreeSet::new(),
            collation: None,
        }
    }

    #[test]
    fn test_index_scan_bounds_follow_walk_direction() {
        let idx = descriptor(json!({"a": 1, "b": -1}));
        let stage = PlanStage::index_scan(
            StageType::Ixscan,
            &idx,
            ScanDirection::Backward,
            &[Bounds::Point(crate::Value::Int64(1))],
        );
        let json = serde_json::to_value(&stage).unwrap();
        assert_eq!(json["stageType"], json!("IXSCAN"));
        assert_eq!(json["direction"], json!("backward"));
        assert_eq!(json["indexBounds"]["a"], json!(["[1, 1]"]));
        assert_eq!(json["indexBounds"]["b"], json!(["[MinKey, MaxKey]"]));
        assert_eq!(json["isMultiKey"], json!(false));
    }

    #[test]
    fn test_stage_chain() {
        let chain = PlanStage::new(StageType::Group)
            .with_input(PlanStage::new(StageType::Fetch).with_input(PlanStage::new(StageType::Collscan)));
        assert_eq!(
            chain.stage_types(),
            vec![StageType::Group, StageType::Fetch, StageType::Collscan]
        );
        assert!(chain.find(StageType::Collscan).is_some());
        assert!(chain.find(StageType::Sort).is_none());
    }
}
