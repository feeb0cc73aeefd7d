// Songplay load pipeline: staging, dimensions, facts and the quality gate

pub mod dimension;
pub mod fact;
pub mod orchestrator;
pub mod quality_gate;
pub mod staging;
pub mod steps;
pub mod time_dimension;

pub use dimension::{DimensionLoadStats, DimensionLoader, DimensionSpec, FactReference, LoadMode};
pub use fact::{DimensionLookups, FactLoadStats, FactLoader, FactSpec};
pub use orchestrator::{PipelineOrchestrator, PipelineState, RunReport};
pub use quality_gate::{CheckReport, CheckResult, QualityGate, QualityRule, Verdict};
pub use staging::{StagingLoader, StagingMode};
pub use time_dimension::{TimeAttributes, TimeDimensionExtractor};
