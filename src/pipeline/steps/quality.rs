use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{PipelineStep, RunContext, StepResult};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::pipeline::orchestrator::PipelineState;
use crate::pipeline::quality_gate::QualityGate;
use crate::warehouse::run_blocking;

/// Runs the configured quality rules over the loaded star
pub struct QualityStep;

#[async_trait]
impl PipelineStep for QualityStep {
    async fn execute(&self, ctx: &RunContext, _cancel: &CancellationToken) -> Result<StepResult> {
        info!("🛡️ Running {} quality rule(s)", ctx.config.quality_rules.len());
        let gate = QualityGate::new(ctx.warehouse.clone());
        let rules = ctx.config.quality_rules.clone();

        let report = run_blocking("quality_gate", move || gate.check(&rules)).await?;
        let failed = report.failures().count();

        Ok(StepResult::success(
            vec![],
            format!("{} checks, {} failed", report.results.len(), failed),
        )
        .with_report(report))
    }

    fn step_name(&self) -> &'static str {
        "quality"
    }

    fn state(&self) -> PipelineState {
        PipelineState::QualityCheck
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["facts"]
    }

    fn timeout(&self, config: &PipelineConfig) -> Duration {
        config.timeouts.quality()
    }
}
