use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{PipelineStep, RelationCounts, RunContext, StepResult};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::pipeline::fact::{FactLoader, FactSpec};
use crate::pipeline::orchestrator::PipelineState;
use crate::warehouse::run_blocking;
use crate::warehouse::schema::SONGPLAYS;

/// Loads songplay facts once every dimension is in place
pub struct FactsStep;

#[async_trait]
impl PipelineStep for FactsStep {
    async fn execute(&self, ctx: &RunContext, cancel: &CancellationToken) -> Result<StepResult> {
        let loader = FactLoader::new(ctx.warehouse.with_busy_timeout(self.timeout(&ctx.config)));
        let lookups = ctx.lookups.clone();
        let full_reload = ctx.config.facts.full_reload;
        let cancel = cancel.clone();

        let stats = run_blocking(SONGPLAYS, move || {
            loader.load(&FactSpec::default(), &lookups, full_reload, &cancel)
        })
        .await?;

        Ok(StepResult::success(
            vec![RelationCounts {
                relation: SONGPLAYS.to_string(),
                inserted: stats.inserted,
                unresolved: stats.unresolved,
                duplicates: stats.duplicates,
                missing_user: stats.missing_user,
                ..RelationCounts::default()
            }],
            format!(
                "inserted {} songplays ({} unresolved, {} duplicates skipped)",
                stats.inserted, stats.unresolved, stats.duplicates
            ),
        ))
    }

    fn step_name(&self) -> &'static str {
        "facts"
    }

    fn state(&self) -> PipelineState {
        PipelineState::LoadingFacts
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["dimensions"]
    }

    fn timeout(&self, config: &PipelineConfig) -> Duration {
        config.timeouts.facts()
    }
}
