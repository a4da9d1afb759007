//! Executor Module
//!
//! Runs aggregation pipelines. [`Aggregator`] asks the analyzer for a
//! DISTINCT_SCAN plan and drives [`DistinctScan`] when one exists, otherwise
//! it runs the generic [`FallbackPlan`]. Both produce the same documents.

mod distinct_scan;
mod fallback;

#[cfg(test)]
mod tests;

pub use distinct_scan::{DistinctRow, DistinctScan, ScanState, ScanStats};
pub use fallback::{AccessPath, FallbackPlan, blocking_sort, group_documents, run_stages};

use std::sync::Arc;

use tracing::{debug, warn};

use crate::collation::Collation;
use crate::config::Config;
use crate::error::Result;
use crate::query::{Analyzer, Eligibility, Explain, Hint, IneligibleReason, PipelineStage, ScanPlan, parse_pipeline};
use crate::storage::{Collection, IndexCatalog};
use crate::value::Value;

/// One aggregate command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateRequest {
    pub pipeline: Vec<PipelineStage>,
    pub collation: Option<Collation>,
    pub hint: Hint,
}

impl AggregateRequest {
    pub fn new(pipeline: Vec<PipelineStage>) -> Self {
        Self {
            pipeline,
            ..Self::default()
        }
    }

    /// Parse a JSON pipeline array.
    pub fn from_json(pipeline: &serde_json::Value) -> Result<Self> {
        Ok(Self::new(parse_pipeline(pipeline)?))
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

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateOutput {
    pub explain: Explain,
    pub documents: Vec<Value>,
    /// Present when a DISTINCT_SCAN ran.
    pub stats: Option<ScanStats>,
}

pub struct Aggregator {
    collection: Arc<Collection>,
    config: Config,
}

impl Aggregator {
    pub fn new(collection: Arc<Collection>, config: Config) -> Self {
        Self { collection, config }
    }

    pub fn collection(&self) -> &Arc<Collection> {
        &self.collection
    }

    /// Plan without executing.
    pub fn explain(&self, request: &AggregateRequest) -> Result<Explain> {
        let (catalog, eligibility) = self.plan(request)?;
        match eligibility {
            Eligibility::Eligible(plan) => Ok(Explain::distinct_scan(self.collection.name(), &plan)),
            Eligibility::Ineligible(reason) => {
                let fallback = FallbackPlan::build(
                    &catalog,
                    &request.pipeline,
                    request.collation.as_ref(),
                    &request.hint,
                )?;
                Ok(fallback.explain(self.collection.name(), catalog.epoch(), Some(&reason)))
            }
        }
    }

    pub fn aggregate(&self, request: &AggregateRequest) -> Result<AggregateOutput> {
        let mut replans = 0;
        loop {
            let (catalog, eligibility) = self.plan(request)?;
            let plan = match eligibility {
                Eligibility::Eligible(plan) => plan,
                Eligibility::Ineligible(reason) => {
                    return self.run_fallback(&catalog, request, reason);
                }
            };

            match self.run_distinct_scan(*plan, request) {
                Err(err) if err.is_replannable() && replans < self.config.executor.max_replans => {
                    replans += 1;
                    warn!(attempt = replans, error = %err, "Re-planning aggregate");
                }
                result => return result,
            }
        }
    }

    fn plan(&self, request: &AggregateRequest) -> Result<(IndexCatalog, Eligibility)> {
        let catalog = self.collection.catalog();
        let eligibility = Analyzer::new(&catalog, &self.config.planner).analyze_pipeline(
            &request.pipeline,
            request.collation.as_ref(),
            &request.hint,
        )?;
        Ok((catalog, eligibility))
    }

    fn run_distinct_scan(&self, plan: ScanPlan, request: &AggregateRequest) -> Result<AggregateOutput> {
        let explain = Explain::distinct_scan(self.collection.name(), &plan);
        let mut scan = DistinctScan::open(Arc::clone(&self.collection), plan)?;

        let mut groups = Vec::new();
        while let Some(row) = scan.advance()? {
            groups.push(row.to_group_document(scan.plan())?);
        }

        let documents = run_stages(
            groups,
            &scan.plan().trailing,
            request.collation.as_ref(),
            &self.config.executor,
        )?;
        let stats = scan.stats();
        debug!(
            groups = documents.len(),
            keys_examined = stats.keys_examined,
            docs_examined = stats.docs_examined,
            "DISTINCT_SCAN finished"
        );

        Ok(AggregateOutput {
            explain,
            documents,
            stats: Some(stats),
        })
    }

    fn run_fallback(
        &self,
        catalog: &IndexCatalog,
        request: &AggregateRequest,
        reason: IneligibleReason,
    ) -> Result<AggregateOutput> {
        debug!(reason = %reason, "Running fallback aggregation");
        let plan = FallbackPlan::build(
            catalog,
            &request.pipeline,
            request.collation.as_ref(),
            &request.hint,
        )?;
        let documents = plan.execute(&self.collection, &self.config.executor)?;
        Ok(AggregateOutput {
            explain: plan.explain(self.collection.name(), catalog.epoch(), Some(&reason)),
            documents,
            stats: None,
        })
    }
}
