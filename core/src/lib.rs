//! Keyseek - DISTINCT_SCAN planning and execution for grouped aggregations
//!
//! A `$group` whose `_id` is a single indexed field can often be answered by
//! seeking through a sorted index once per distinct key instead of scanning
//! every document. This crate decides when that is safe, runs the scan, and
//! falls back to a generic aggregation path when it is not.

pub mod collation;
pub mod config;
pub mod document;
pub mod error;
pub mod executor;
pub mod query;
pub mod storage;
pub mod value;

pub use collation::Collation;
pub use config::{Config, ExecutorConfig, PlannerConfig};
pub use error::{KeyseekError, Result};
pub use executor::{AggregateOutput, AggregateRequest, Aggregator, DistinctScan, ScanStats};
pub use query::{Analyzer, Eligibility, Explain, Hint, IneligibleReason, ScanPlan};
pub use storage::{Collection, IndexSpec, KeyPattern, RecordId};
pub use value::Value;
