use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::pipeline::fact::DimensionLookups;
use crate::pipeline::orchestrator::PipelineState;
use crate::pipeline::quality_gate::CheckReport;
use crate::pipeline::staging::SourceReader;
use crate::warehouse::Warehouse;

/// Shared, read-only inputs for every stage of one run.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub config: Arc<PipelineConfig>,
    pub warehouse: Warehouse,
    pub reader: Arc<dyn SourceReader>,
    pub lookups: DimensionLookups,
}

/// Common trait for all pipeline steps
#[async_trait]
pub trait PipelineStep: Send + Sync {
    /// Execute this step. `cancel` fires when the stage's timeout expires.
    async fn execute(&self, ctx: &RunContext, cancel: &CancellationToken) -> Result<StepResult>;

    /// Get the name of this pipeline step
    fn step_name(&self) -> &'static str;

    /// The state a run is in while this step executes
    fn state(&self) -> PipelineState;

    /// Get the dependencies this step requires (previous steps that must complete)
    fn dependencies(&self) -> Vec<&'static str>;

    fn timeout(&self, config: &PipelineConfig) -> Duration;
}

/// Row counts for one relation touched by a step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationCounts {
    pub relation: String,
    pub inserted: u64,
    pub skipped: u64,
    pub unresolved: u64,
    pub duplicates: u64,
    pub missing_user: u64,
}

impl RelationCounts {
    pub fn inserted(relation: &str, inserted: u64) -> Self {
        Self {
            relation: relation.to_string(),
            inserted,
            ..Self::default()
        }
    }
}

/// Result of executing a pipeline step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub counts: Vec<RelationCounts>,
    pub message: String,
    /// Set by the quality step only
    pub report: Option<CheckReport>,
}

impl StepResult {
    pub fn success(counts: Vec<RelationCounts>, message: String) -> Self {
        Self {
            counts,
            message,
            report: None,
        }
    }

    pub fn with_report(mut self, report: CheckReport) -> Self {
        self.report = Some(report);
        self
    }

    pub fn processed_count(&self) -> u64 {
        self.counts.iter().map(|c| c.inserted).sum()
    }
}

pub mod dimensions;
pub mod facts;
pub mod quality;
pub mod staging;

pub use dimensions::DimensionsStep;
pub use facts::FactsStep;
pub use quality::QualityStep;
pub use staging::StagingStep;

/// The fixed songplay pipeline, in execution order.
pub fn default_steps() -> Vec<Box<dyn PipelineStep>> {
    vec![
        Box::new(StagingStep),
        Box::new(DimensionsStep),
        Box::new(FactsStep),
        Box::new(QualityStep),
    ]
}
