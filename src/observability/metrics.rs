//! Pipeline metrics recorded through the `metrics` facade.
//!
//! Recording is a no-op until a recorder is installed; `init` installs the
//! Prometheus exporter with an HTTP scrape endpoint.

use std::fmt;
use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Enum representing all metric names used by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Staging
    StagingRowsStaged,
    StagingDuration,

    // Dimensions
    DimensionRowsInserted,
    DimensionRowsSkipped,

    // Facts
    FactRowsInserted,
    FactRowsUnresolved,
    FactRowsDuplicate,
    FactEventsMissingUser,

    // Quality gate
    QualityChecksEvaluated,
    QualityChecksFailed,

    // Orchestration
    StageDuration,
    RunsCompleted,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::StagingRowsStaged => "etl_staging_rows_staged_total",
            MetricName::StagingDuration => "etl_staging_duration_seconds",
            MetricName::DimensionRowsInserted => "etl_dimension_rows_inserted_total",
            MetricName::DimensionRowsSkipped => "etl_dimension_rows_skipped_total",
            MetricName::FactRowsInserted => "etl_fact_rows_inserted_total",
            MetricName::FactRowsUnresolved => "etl_fact_rows_unresolved_total",
            MetricName::FactRowsDuplicate => "etl_fact_rows_duplicate_total",
            MetricName::FactEventsMissingUser => "etl_fact_events_missing_user_total",
            MetricName::QualityChecksEvaluated => "etl_quality_checks_evaluated_total",
            MetricName::QualityChecksFailed => "etl_quality_checks_failed_total",
            MetricName::StageDuration => "etl_stage_duration_seconds",
            MetricName::RunsCompleted => "etl_runs_completed_total",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Installs the Prometheus exporter listening on `0.0.0.0:<port>`.
/// Must be called from within a tokio runtime.
pub fn init(port: u16) -> Result<(), String> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {}", e))?;
    info!("📈 Metrics exporter listening on {}", addr);
    Ok(())
}

/// Reads `ETL_METRICS_PORT` and installs the exporter when it is set.
pub fn init_from_env() -> Result<(), String> {
    match std::env::var("ETL_METRICS_PORT") {
        Ok(raw) => {
            let port = raw
                .parse::<u16>()
                .map_err(|e| format!("ETL_METRICS_PORT '{}' is not a port: {}", raw, e))?;
            init(port)
        }
        Err(_) => {
            info!("Metrics exporter disabled (ETL_METRICS_PORT not set)");
            Ok(())
        }
    }
}

pub mod staging {
    use super::MetricName;

    pub fn rows_staged(relation: &str, rows: u64) {
        ::metrics::counter!(MetricName::StagingRowsStaged.as_str(), "relation" => relation.to_string())
            .increment(rows);
    }

    pub fn duration(relation: &str, secs: f64) {
        ::metrics::histogram!(MetricName::StagingDuration.as_str(), "relation" => relation.to_string())
            .record(secs);
    }
}

pub mod dimensions {
    use super::MetricName;

    pub fn loaded(relation: &str, inserted: u64, skipped: u64) {
        ::metrics::counter!(MetricName::DimensionRowsInserted.as_str(), "relation" => relation.to_string())
            .increment(inserted);
        ::metrics::counter!(MetricName::DimensionRowsSkipped.as_str(), "relation" => relation.to_string())
            .increment(skipped);
    }
}

pub mod facts {
    use super::MetricName;
    use crate::pipeline::fact::FactLoadStats;

    pub fn loaded(stats: &FactLoadStats) {
        ::metrics::counter!(MetricName::FactRowsInserted.as_str()).increment(stats.inserted);
        ::metrics::counter!(MetricName::FactRowsUnresolved.as_str()).increment(stats.unresolved);
        ::metrics::counter!(MetricName::FactRowsDuplicate.as_str()).increment(stats.duplicates);
        ::metrics::counter!(MetricName::FactEventsMissingUser.as_str()).increment(stats.missing_user);
    }
}

pub mod quality {
    use super::MetricName;

    pub fn checks_evaluated(count: u64) {
        ::metrics::counter!(MetricName::QualityChecksEvaluated.as_str()).increment(count);
    }

    pub fn check_failed(rule: &str) {
        ::metrics::counter!(MetricName::QualityChecksFailed.as_str(), "rule" => rule.to_string())
            .increment(1);
    }
}

pub mod pipeline {
    use super::MetricName;

    pub fn stage_duration(stage: &str, secs: f64) {
        ::metrics::histogram!(MetricName::StageDuration.as_str(), "stage" => stage.to_string())
            .record(secs);
    }

    pub fn run_completed(state: &str) {
        ::metrics::counter!(MetricName::RunsCompleted.as_str(), "state" => state.to_string())
            .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_are_prometheus_style() {
        for name in [
            MetricName::StagingRowsStaged,
            MetricName::StageDuration,
            MetricName::RunsCompleted,
        ] {
            assert!(name.as_str().starts_with("etl_"));
            assert_eq!(name.to_string(), name.as_str());
        }
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        staging::rows_staged("staging_events", 10);
        pipeline::run_completed("SUCCEEDED");
    }
}
