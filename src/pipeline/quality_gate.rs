use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{LoadError, Result};
use crate::observability::metrics;
use crate::warehouse::query::{count_nulls_sql, count_rows_sql};
use crate::warehouse::schema::{ARTISTS, SONGPLAYS, SONGS, TIME, USERS};
use crate::warehouse::{Transaction, Warehouse};

/// One assertion set over a loaded relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityRule {
    /// Relation the rule is evaluated against
    pub table: String,
    /// Fewest rows the relation may hold; zero disables the row-count check
    #[serde(default = "default_min_row_count")]
    pub min_row_count: u64,
    /// Columns that must not contain nulls
    #[serde(default)]
    pub not_null_columns: Vec<String>,
}

fn default_min_row_count() -> u64 {
    1
}

impl QualityRule {
    pub fn new(table: &str, min_row_count: u64, not_null_columns: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            min_row_count,
            not_null_columns: not_null_columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Every star relation non-empty with its key columns populated.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(SONGPLAYS, 1, &["start_time", "user_id", "session_id"]),
            Self::new(USERS, 1, &["user_id"]),
            Self::new(SONGS, 1, &["song_id"]),
            Self::new(ARTISTS, 1, &["artist_id"]),
            Self::new(TIME, 1, &["start_time"]),
        ]
    }
}

/// Outcome of a single check derived from a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check identifier, e.g. `row_count(users)` or `not_null(users.user_id)`
    pub rule: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub results: Vec<CheckResult>,
}

impl CheckReport {
    pub fn verdict(&self) -> Verdict {
        if self.results.iter().all(|r| r.passed) {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    /// `Err(QualityCheckFailed)` unless every check passed.
    pub fn into_result(self) -> Result<Self> {
        let failed = self.failures().count();
        if failed == 0 {
            Ok(self)
        } else {
            Err(LoadError::QualityCheckFailed {
                failed,
                total: self.results.len(),
            })
        }
    }
}

/// Read-only assertions over loaded relations.
pub struct QualityGate {
    warehouse: Warehouse,
}

impl QualityGate {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    /// Evaluates every rule under one read snapshot. Rule failures, including
    /// missing relations or columns, are reported rather than returned as
    /// errors; only an unreachable warehouse aborts the check.
    #[instrument(skip_all, fields(rules = rules.len()))]
    pub fn check(&self, rules: &[QualityRule]) -> Result<CheckReport> {
        let mut session = self.warehouse.open_session()?;
        let tx = session.begin_read("quality_gate")?;

        let mut report = CheckReport::default();
        for rule in rules {
            report.results.push(row_count_check(&tx, rule));
            for column in &rule.not_null_columns {
                report.results.push(not_null_check(&tx, &rule.table, column));
            }
        }
        // Read-only; dropping the transaction just releases the snapshot.
        drop(tx);

        for failure in report.failures() {
            warn!("❌ Quality check {} failed: {}", failure.rule, failure.detail);
            metrics::quality::check_failed(&failure.rule);
        }
        metrics::quality::checks_evaluated(report.results.len() as u64);
        info!(
            "🔍 Quality gate: {} checks, {} failed, verdict {:?}",
            report.results.len(),
            report.failures().count(),
            report.verdict()
        );
        Ok(report)
    }
}

fn row_count_check(tx: &Transaction<'_>, rule: &QualityRule) -> CheckResult {
    let name = format!("row_count({})", rule.table);
    let count = count_rows_sql(&rule.table).and_then(|sql| {
        tx.query_row(&sql, [], |r| r.get::<_, i64>(0))
            .map_err(|e| LoadError::from_warehouse(&rule.table, e))
    });

    match count {
        Err(e) => fail(name, e.to_string()),
        Ok(0) if rule.min_row_count > 0 => fail(name, "no rows".to_string()),
        Ok(n) if (n as u64) < rule.min_row_count => fail(
            name,
            format!("{} rows, expected at least {}", n, rule.min_row_count),
        ),
        Ok(n) => pass(name, format!("{} rows", n)),
    }
}

fn not_null_check(tx: &Transaction<'_>, table: &str, column: &str) -> CheckResult {
    let name = format!("not_null({}.{})", table, column);
    let nulls = count_nulls_sql(table, column).and_then(|sql| {
        tx.query_row(&sql, [], |r| r.get::<_, i64>(0))
            .map_err(|e| LoadError::from_warehouse(table, e))
    });

    match nulls {
        Err(e) => fail(name, e.to_string()),
        Ok(0) => pass(name, "no nulls".to_string()),
        Ok(n) => fail(name, format!("{} null values", n)),
    }
}

fn pass(rule: String, detail: String) -> CheckResult {
    CheckResult {
        rule,
        passed: true,
        detail,
    }
}

fn fail(rule: String, detail: String) -> CheckResult {
    CheckResult {
        rule,
        passed: false,
        detail,
    }
}
