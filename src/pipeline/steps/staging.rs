use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{PipelineStep, RelationCounts, RunContext, StepResult};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::pipeline::orchestrator::PipelineState;
use crate::pipeline::staging::{StagingLoader, StagingMode, StagingTable, STAGING_EVENTS_TABLE, STAGING_SONGS_TABLE};

/// Copies event logs and the song catalog into staging relations
pub struct StagingStep;

/// Runs one staging load; a failure cancels `cancel` so the sibling load
/// rolls back instead of committing.
async fn load_or_cancel(
    loader: &StagingLoader,
    sources: &[String],
    table: &'static StagingTable,
    mode: StagingMode,
    cancel: &CancellationToken,
) -> Result<u64> {
    let outcome = loader.load(sources, table, mode, cancel).await;
    if let Err(e) = &outcome {
        error!("❌ Staging {} failed: {}", table.name, e);
        cancel.cancel();
    }
    outcome
}

#[async_trait]
impl PipelineStep for StagingStep {
    async fn execute(&self, ctx: &RunContext, cancel: &CancellationToken) -> Result<StepResult> {
        let sources = &ctx.config.sources;
        info!(
            run_id = %ctx.run_id,
            "📥 Staging {} event source(s) and {} catalog source(s)",
            sources.events.len(),
            sources.catalog.len()
        );

        let warehouse = ctx.warehouse.with_busy_timeout(self.timeout(&ctx.config));
        let loader = StagingLoader::new(warehouse, ctx.reader.clone());
        // Both loads finish (or roll back) before the step returns
        let (events, songs) = tokio::join!(
            load_or_cancel(&loader, &sources.events, &STAGING_EVENTS_TABLE, sources.staging_mode, cancel),
            load_or_cancel(&loader, &sources.catalog, &STAGING_SONGS_TABLE, sources.staging_mode, cancel),
        );
        let (events, songs) = (events?, songs?);

        Ok(StepResult::success(
            vec![
                RelationCounts::inserted(STAGING_EVENTS_TABLE.name, events),
                RelationCounts::inserted(STAGING_SONGS_TABLE.name, songs),
            ],
            format!("staged {} events and {} catalog rows", events, songs),
        ))
    }

    fn step_name(&self) -> &'static str {
        "staging"
    }

    fn state(&self) -> PipelineState {
        PipelineState::Staging
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![]
    }

    fn timeout(&self, config: &PipelineConfig) -> Duration {
        config.timeouts.staging()
    }
}
