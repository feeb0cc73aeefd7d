use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::fact::DimensionLookups;
use super::quality_gate::CheckReport;
use super::staging::{ObjectStoreReader, SourceReader};
use super::steps::{default_steps, PipelineStep, RelationCounts, RunContext};
use crate::config::PipelineConfig;
use crate::error::{LoadError, Result};
use crate::observability::metrics;
use crate::warehouse::ledger::RunLedger;
use crate::warehouse::{run_blocking, Warehouse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Pending,
    Staging,
    LoadingDimensions,
    LoadingFacts,
    QualityCheck,
    Succeeded,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Pending => "PENDING",
            PipelineState::Staging => "STAGING",
            PipelineState::LoadingDimensions => "LOADING_DIMENSIONS",
            PipelineState::LoadingFacts => "LOADING_FACTS",
            PipelineState::QualityCheck => "QUALITY_CHECK",
            PipelineState::Succeeded => "SUCCEEDED",
            PipelineState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Succeeded | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: PipelineState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub duration_ms: u64,
    pub counts: Vec<RelationCounts>,
    pub message: String,
}

/// Everything an operator needs to judge a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: PipelineState,
    pub transitions: Vec<StateTransition>,
    pub stages: Vec<StageReport>,
    pub quality: Option<CheckReport>,
    /// Failure message, when the run ended FAILED
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    fn new(run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            state: PipelineState::Pending,
            transitions: vec![StateTransition {
                state: PipelineState::Pending,
                at: now,
            }],
            stages: Vec::new(),
            quality: None,
            error: None,
            error_kind: None,
            started_at: now,
            finished_at: None,
        }
    }

    fn transition(&mut self, state: PipelineState) {
        info!("🔀 Run {}: {} -> {}", self.run_id, self.state, state);
        self.state = state;
        self.transitions.push(StateTransition {
            state,
            at: Utc::now(),
        });
    }

    fn fail(&mut self, err: &LoadError) {
        error!("❌ Run {} failed: {}", self.run_id, err);
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind().to_string());
        self.transition(PipelineState::Failed);
    }

    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Succeeded
    }

    /// Rows written per relation across all stages
    pub fn counts(&self) -> impl Iterator<Item = &RelationCounts> {
        self.stages.iter().flat_map(|s| s.counts.iter())
    }
}

/// Sequences staging, dimensions, facts and the quality gate for one run
pub struct PipelineOrchestrator {
    config: Arc<PipelineConfig>,
    warehouse: Warehouse,
    reader: Arc<dyn SourceReader>,
    steps: Vec<Box<dyn PipelineStep>>,
}

impl PipelineOrchestrator {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_steps(config, Arc::new(ObjectStoreReader::new()), default_steps())
    }

    pub fn with_steps(
        config: PipelineConfig,
        reader: Arc<dyn SourceReader>,
        steps: Vec<Box<dyn PipelineStep>>,
    ) -> Result<Self> {
        config.validate()?;
        validate_steps(&steps)?;
        let warehouse = config.warehouse();
        Ok(Self {
            config: Arc::new(config),
            warehouse,
            reader,
            steps,
        })
    }

    pub async fn run(&self) -> RunReport {
        self.run_with_cancel(CancellationToken::new()).await
    }

    /// Runs every stage in order, stopping at the first failure. The report
    /// is persisted to the run ledger before it is returned.
    pub async fn run_with_cancel(&self, cancel: CancellationToken) -> RunReport {
        let run_id = Uuid::new_v4();
        let mut report = RunReport::new(run_id);
        info!("🚀 Starting run {} with {} stages", run_id, self.steps.len());

        if let Err(e) = self.open_ledger(&report).await {
            report.fail(&e);
            self.finish(&mut report).await;
            return report;
        }

        let ctx = RunContext {
            run_id,
            config: self.config.clone(),
            warehouse: self.warehouse.clone(),
            reader: self.reader.clone(),
            lookups: DimensionLookups::new(),
        };

        for (index, step) in self.steps.iter().enumerate() {
            report.transition(step.state());
            self.record_state(run_id, step.state()).await;
            info!(
                "🔄 Executing stage {}/{}: {}",
                index + 1,
                self.steps.len(),
                step.step_name()
            );

            if cancel.is_cancelled() {
                report.fail(&LoadError::Cancelled {
                    stage: step.step_name().to_string(),
                });
                break;
            }

            let started = Instant::now();
            let stage_cancel = cancel.child_token();
            let limit = step.timeout(&self.config);
            let execution = step.execute(&ctx, &stage_cancel);
            tokio::pin!(execution);
            let outcome = match tokio::time::timeout(limit, &mut execution).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Wait for the stage's warehouse work to roll back, or to
                    // commit if it was already past its last cancellation point.
                    stage_cancel.cancel();
                    warn!("⏰ Stage '{}' exceeded {:?}, waiting for it to stop", step.step_name(), limit);
                    if let Ok(late) = execution.await {
                        warn!("⚠️ Stage '{}' committed after its deadline", step.step_name());
                        report.stages.push(StageReport {
                            stage: step.step_name().to_string(),
                            duration_ms: started.elapsed().as_millis() as u64,
                            counts: late.counts,
                            message: format!("committed after timeout: {}", late.message),
                        });
                    }
                    Err(LoadError::Timeout {
                        stage: step.step_name().to_string(),
                        after: limit,
                    })
                }
            };
            let elapsed = started.elapsed();
            metrics::pipeline::stage_duration(step.step_name(), elapsed.as_secs_f64());

            match outcome {
                Ok(result) => {
                    info!(
                        "✅ Stage '{}' completed ({} rows): {}",
                        step.step_name(),
                        result.processed_count(),
                        result.message
                    );
                    report.stages.push(StageReport {
                        stage: step.step_name().to_string(),
                        duration_ms: elapsed.as_millis() as u64,
                        counts: result.counts,
                        message: result.message,
                    });
                    if let Some(check) = result.report {
                        let verdict = check.clone().into_result();
                        report.quality = Some(check);
                        if let Err(e) = verdict {
                            report.fail(&e);
                            break;
                        }
                    }
                }
                Err(e) => {
                    report.fail(&e);
                    break;
                }
            }
        }

        if !report.state.is_terminal() {
            report.transition(PipelineState::Succeeded);
        }
        self.finish(&mut report).await;

        if report.succeeded() {
            info!("🎉 Run {} succeeded", run_id);
        } else {
            error!("💥 Run {} ended {}", run_id, report.state);
        }
        report
    }

    async fn open_ledger(&self, report: &RunReport) -> Result<()> {
        let warehouse = self.warehouse.clone();
        let run_id = report.run_id.to_string();
        let started_at = report.started_at;
        run_blocking("etl_runs", move || {
            warehouse.ensure_schema()?;
            let session = warehouse.open_session()?;
            RunLedger::record_start(session.connection(), &run_id, started_at)
        })
        .await
    }

    async fn record_state(&self, run_id: Uuid, state: PipelineState) {
        let warehouse = self.warehouse.clone();
        let outcome = run_blocking("etl_runs", move || {
            let session = warehouse.open_session()?;
            RunLedger::record_state(session.connection(), &run_id.to_string(), state.as_str())
        })
        .await;
        if let Err(e) = outcome {
            warn!("⚠️ Could not record state {} for run {}: {}", state, run_id, e);
        }
    }

    async fn finish(&self, report: &mut RunReport) {
        report.finished_at = Some(Utc::now());
        metrics::pipeline::run_completed(report.state.as_str());

        let json = match serde_json::to_string(report) {
            Ok(json) => json,
            Err(e) => {
                warn!("⚠️ Could not serialize run report {}: {}", report.run_id, e);
                return;
            }
        };
        let warehouse = self.warehouse.clone();
        let run_id = report.run_id.to_string();
        let state = report.state;
        let finished_at = report.finished_at.unwrap_or_else(Utc::now);
        let outcome = run_blocking("etl_runs", move || {
            let session = warehouse.open_session()?;
            RunLedger::record_finish(session.connection(), &run_id, state.as_str(), finished_at, &json)
        })
        .await;
        if let Err(e) = outcome {
            warn!("⚠️ Could not persist report for run {}: {}", report.run_id, e);
        }
    }
}

/// A stage may only depend on stages placed before it.
fn validate_steps(steps: &[Box<dyn PipelineStep>]) -> Result<()> {
    if steps.is_empty() {
        return Err(LoadError::Config("Pipeline must have at least one step".to_string()));
    }

    let mut seen_steps = HashSet::new();
    for step in steps {
        for dep in step.dependencies() {
            if !seen_steps.contains(dep) {
                return Err(LoadError::Config(format!(
                    "Step '{}' depends on '{}' which appears later in the pipeline",
                    step.step_name(),
                    dep
                )));
            }
        }
        seen_steps.insert(step.step_name());
    }
    Ok(())
}
