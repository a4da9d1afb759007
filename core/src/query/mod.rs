//! Query Module
//!
//! Pipeline model, DISTINCT_SCAN eligibility analysis and explain output.

pub mod analyzer;
pub mod explain;
pub mod expr;
pub mod group;
pub mod pipeline;
pub mod plan;


// Re-export commonly used types
pub use analyzer::{Analyzer, EqualityPrefix, QueryShape};
pub use explain::{Explain, PlanStage, StageType};
pub use expr::Expr;
pub use group::{AccumulatorKind, AccumulatorOp, AccumulatorSpec, GroupKey, GroupSpec};
pub use pipeline::{
    MatchSpec, PipelinePrefix, PipelineStage, Predicate, PredicateOp, ProjectSpec, SortDirection,
    SortSpec, normalize_prefix, parse_pipeline,
};
pub use plan::{
    AccumulatorMode, AccumulatorSource, Bounds, CandidateRejection, Eligibility, Hint,
    IneligibleReason, ScanDirection, ScanPlan,
};
