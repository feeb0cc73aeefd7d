use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{LoadError, Result};
use crate::warehouse::schema::ETL_RUNS;

/// Persistent record of orchestrated runs, one row per run id.
pub struct RunLedger;

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub run_id: String,
    pub state: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub report: Option<String>,
}

impl RunLedger {
    pub fn record_start(conn: &Connection, run_id: &str, started_at: DateTime<Utc>) -> Result<()> {
        conn.execute(
            "INSERT INTO etl_runs (run_id, state, started_at) VALUES (?1, 'PENDING', ?2)",
            params![run_id, started_at.to_rfc3339()],
        )
        .map_err(|e| LoadError::from_warehouse(ETL_RUNS, e))?;
        Ok(())
    }

    pub fn record_state(conn: &Connection, run_id: &str, state: &str) -> Result<()> {
        conn.execute(
            "UPDATE etl_runs SET state = ?2 WHERE run_id = ?1",
            params![run_id, state],
        )
        .map_err(|e| LoadError::from_warehouse(ETL_RUNS, e))?;
        Ok(())
    }

    pub fn record_finish(
        conn: &Connection,
        run_id: &str,
        state: &str,
        finished_at: DateTime<Utc>,
        report_json: &str,
    ) -> Result<()> {
        conn.execute(
            "UPDATE etl_runs SET state = ?2, finished_at = ?3, report = ?4 WHERE run_id = ?1",
            params![run_id, state, finished_at.to_rfc3339(), report_json],
        )
        .map_err(|e| LoadError::from_warehouse(ETL_RUNS, e))?;
        Ok(())
    }

    pub fn get(conn: &Connection, run_id: &str) -> Result<Option<LedgerEntry>> {
        conn.query_row(
            "SELECT run_id, state, started_at, finished_at, report FROM etl_runs WHERE run_id = ?1",
            params![run_id],
            |row| {
                Ok(LedgerEntry {
                    run_id: row.get(0)?,
                    state: row.get(1)?,
                    started_at: row.get(2)?,
                    finished_at: row.get(3)?,
                    report: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| LoadError::from_warehouse(ETL_RUNS, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::schema;

    #[test]
    fn test_run_lifecycle_is_recorded() {
        let conn = Connection::open_in_memory().unwrap();
        schema::apply(&conn).unwrap();

        RunLedger::record_start(&conn, "run-1", Utc::now()).unwrap();
        RunLedger::record_state(&conn, "run-1", "STAGING").unwrap();
        assert_eq!(RunLedger::get(&conn, "run-1").unwrap().unwrap().state, "STAGING");

        RunLedger::record_finish(&conn, "run-1", "SUCCEEDED", Utc::now(), "{}").unwrap();
        let entry = RunLedger::get(&conn, "run-1").unwrap().unwrap();
        assert_eq!(entry.state, "SUCCEEDED");
        assert!(entry.finished_at.is_some());
        assert_eq!(entry.report.as_deref(), Some("{}"));

        assert!(RunLedger::get(&conn, "missing").unwrap().is_none());
    }
}
