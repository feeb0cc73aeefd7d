use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use songplay_etl::config::PipelineConfig;
use songplay_etl::observability::{self, metrics};
use songplay_etl::pipeline::{PipelineOrchestrator, QualityGate, Verdict};
use songplay_etl::warehouse::{run_blocking, schema};

#[derive(Parser)]
#[command(name = "songplay-etl")]
#[command(about = "Incremental star-schema loader for songplay events")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage sources, load dimensions and facts, then run the quality gate
    Run {
        /// Pipeline config file (defaults to config/pipeline.toml)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Drop and recreate every relation before the run
        #[arg(long)]
        reset: bool,
    },
    /// Run only the quality gate against the current warehouse
    Check {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Create the warehouse relations
    Schema {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Drop every relation first
        #[arg(long)]
        reset: bool,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<PipelineConfig> {
    PipelineConfig::load(path.as_deref()).context("Failed to load pipeline config")
}

async fn apply_schema(config: &PipelineConfig, reset: bool) -> Result<()> {
    let warehouse = config.warehouse();
    info!("🏗️ Preparing warehouse at {}", warehouse.path().display());
    run_blocking("schema", move || {
        let session = warehouse.open_session()?;
        if reset {
            schema::reset(session.connection())
        } else {
            schema::apply(session.connection())
        }
    })
    .await
    .context("Failed to prepare warehouse schema")
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_logging();
    if let Err(e) = metrics::init_from_env() {
        warn!("⚠️ {}", e);
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, reset } => {
            let config = load_config(config)?;
            if reset {
                apply_schema(&config, true).await?;
            }

            let orchestrator = PipelineOrchestrator::new(config).context("Invalid pipeline")?;
            let report = orchestrator.run().await;

            println!("\n📊 Run {} finished: {}", report.run_id, report.state);
            for counts in report.counts() {
                println!(
                    "   {:<16} inserted {:>8}  skipped {:>6}  unresolved {:>6}  duplicates {:>6}",
                    counts.relation, counts.inserted, counts.skipped, counts.unresolved, counts.duplicates
                );
            }
            if let Some(quality) = &report.quality {
                for check in &quality.results {
                    let mark = if check.passed { "✅" } else { "❌" };
                    println!("   {} {} ({})", mark, check.rule, check.detail);
                }
            }
            if let Some(error) = &report.error {
                println!("\n⚠️  {}", error);
            }
            if !report.succeeded() {
                std::process::exit(1);
            }
        }
        Commands::Check { config } => {
            let config = load_config(config)?;
            let gate = QualityGate::new(config.warehouse());
            let rules = config.quality_rules.clone();
            let report = run_blocking("quality_gate", move || gate.check(&rules))
                .await
                .context("Quality gate could not run")?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.verdict() == Verdict::Fail {
                std::process::exit(1);
            }
        }
        Commands::Schema { config, reset } => {
            let config = load_config(config)?;
            apply_schema(&config, reset).await?;
            println!("✅ Warehouse schema ready");
        }
    }

    Ok(())
}
