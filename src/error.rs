use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Source unavailable: {uri}: {reason}")]
    SourceUnavailable { uri: String, reason: String },

    #[error("Schema mismatch in {source_uri} (record {record}): {detail}")]
    SchemaMismatch {
        source_uri: String,
        record: usize,
        detail: String,
    },

    #[error("Constraint violation on {relation}: {detail}")]
    ConstraintViolation { relation: String, detail: String },

    #[error("Dimension not ready: {relation} has not completed its load")]
    DimensionNotReady { relation: String },

    #[error("Quality check failed: {failed} of {total} rules did not hold")]
    QualityCheckFailed { failed: usize, total: usize },

    #[error("Stage '{stage}' timed out after {after:?}")]
    Timeout { stage: String, after: Duration },

    #[error("Warehouse connection lost while working on {relation}: {detail}")]
    ConnectionLost { relation: String, detail: String },

    #[error("Stage '{stage}' cancelled before commit")]
    Cancelled { stage: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LoadError {
    /// Maps a warehouse error onto the taxonomy, keeping the relation it came from.
    pub fn from_warehouse(relation: &str, err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                LoadError::ConstraintViolation {
                    relation: relation.to_string(),
                    detail: err.to_string(),
                }
            }
            _ => LoadError::ConnectionLost {
                relation: relation.to_string(),
                detail: err.to_string(),
            },
        }
    }

    pub fn source_unavailable(uri: &str, reason: impl ToString) -> Self {
        LoadError::SourceUnavailable {
            uri: uri.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-friendly kind, used as a metrics label and in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::SourceUnavailable { .. } => "source_unavailable",
            LoadError::SchemaMismatch { .. } => "schema_mismatch",
            LoadError::ConstraintViolation { .. } => "constraint_violation",
            LoadError::DimensionNotReady { .. } => "dimension_not_ready",
            LoadError::QualityCheckFailed { .. } => "quality_check_failed",
            LoadError::Timeout { .. } => "timeout",
            LoadError::ConnectionLost { .. } => "connection_lost",
            LoadError::Cancelled { .. } => "cancelled",
            LoadError::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, LoadError>;
