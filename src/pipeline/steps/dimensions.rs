use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{PipelineStep, RelationCounts, RunContext, StepResult};
use crate::config::PipelineConfig;
use crate::error::{LoadError, Result};
use crate::pipeline::dimension::{DimensionLoader, DimensionSpec};
use crate::pipeline::orchestrator::PipelineState;

/// Loads every star dimension concurrently and waits for all of them
pub struct DimensionsStep;

#[async_trait]
impl PipelineStep for DimensionsStep {
    async fn execute(&self, ctx: &RunContext, cancel: &CancellationToken) -> Result<StepResult> {
        let warehouse = ctx.warehouse.with_busy_timeout(self.timeout(&ctx.config));
        let mut tasks = JoinSet::new();
        for spec in DimensionSpec::star() {
            let loader = DimensionLoader::new(warehouse.clone());
            let mode = ctx.config.dimensions.for_relation(&spec.relation);
            let lookups = ctx.lookups.clone();
            let cancel = cancel.clone();
            info!("🔄 Loading dimension {} ({:?})", spec.relation, mode);
            tasks.spawn_blocking(move || {
                let stats = loader.load(&spec, mode, &cancel)?;
                lookups.mark_loaded(&spec.relation);
                Ok::<_, LoadError>((spec.relation, stats))
            });
        }

        // Barrier: every loader finishes (or rolls back) before the step returns
        let mut counts = Vec::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|e| LoadError::ConnectionLost {
                relation: "dimensions".to_string(),
                detail: format!("dimension task aborted: {}", e),
            });
            match outcome.and_then(|r| r) {
                Ok((relation, stats)) => counts.push(RelationCounts {
                    relation,
                    inserted: stats.inserted,
                    skipped: stats.skipped,
                    ..RelationCounts::default()
                }),
                Err(e) => {
                    error!("❌ Dimension load failed: {}", e);
                    if first_error.is_none() {
                        // Siblings roll back instead of committing
                        cancel.cancel();
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        counts.sort_by(|a, b| a.relation.cmp(&b.relation));
        let inserted: u64 = counts.iter().map(|c| c.inserted).sum();
        Ok(StepResult::success(
            counts,
            format!("loaded 4 dimensions, {} new rows", inserted),
        ))
    }

    fn step_name(&self) -> &'static str {
        "dimensions"
    }

    fn state(&self) -> PipelineState {
        PipelineState::LoadingDimensions
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["staging"]
    }

    fn timeout(&self, config: &PipelineConfig) -> Duration {
        config.timeouts.dimensions()
    }
}
