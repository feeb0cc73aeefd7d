//! Warehouse access: scoped sessions over the embedded SQLite warehouse.
//!
//! Every loader opens its own [`Session`] and drops it on every exit path.
//! Write work goes through [`Session::begin_write`], which takes the write
//! lock up front (`BEGIN IMMEDIATE`) so a concurrent run of the same pipeline
//! waits on the busy timeout instead of racing the existence checks.

pub mod ledger;
pub mod query;
pub mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior};
use tracing::debug;

use crate::error::{LoadError, Result};

pub use rusqlite::Transaction;

/// Handle to the warehouse. Cheap to clone; sessions are opened on demand.
#[derive(Debug, Clone)]
pub struct Warehouse {
    path: PathBuf,
    busy_timeout: Duration,
}

impl Warehouse {
    pub fn new<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Same warehouse, with sessions waiting up to `busy_timeout` for the
    /// write lock. Concurrent loaders inside one stage take the lock in turn,
    /// so a stage waits as long as its own deadline allows.
    pub fn with_busy_timeout(&self, busy_timeout: Duration) -> Self {
        Self {
            path: self.path.clone(),
            busy_timeout: busy_timeout.max(self.busy_timeout),
        }
    }

    /// Opens a new session with foreign keys enforced and WAL journaling.
    pub fn open_session(&self) -> Result<Session> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| LoadError::ConnectionLost {
                    relation: self.path.display().to_string(),
                    detail: e.to_string(),
                })?;
            }
        }
        let db = self.path.display().to_string();
        let conn = Connection::open(&self.path).map_err(|e| LoadError::from_warehouse(&db, e))?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| LoadError::from_warehouse(&db, e))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;
            "#,
        )
        .map_err(|e| LoadError::from_warehouse(&db, e))?;
        debug!("Opened warehouse session on {}", db);
        Ok(Session { conn, db })
    }

    /// Creates every relation the pipeline touches if it does not exist yet.
    pub fn ensure_schema(&self) -> Result<()> {
        let session = self.open_session()?;
        schema::apply(session.connection())
    }
}

/// Runs blocking warehouse work off the async runtime.
pub async fn run_blocking<T, F>(relation: &str, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| LoadError::ConnectionLost {
            relation: relation.to_string(),
            detail: format!("warehouse task aborted: {}", e),
        })?
}

/// One warehouse connection, released when dropped.
pub struct Session {
    conn: Connection,
    db: String,
}

impl Session {
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Starts a write transaction holding the write lock for its whole lifetime.
    pub fn begin_write(&mut self, relation: &str) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| LoadError::from_warehouse(relation, e))
    }

    /// Starts a read transaction; every statement inside sees one snapshot.
    pub fn begin_read(&mut self, relation: &str) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(|e| LoadError::from_warehouse(relation, e))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("Released warehouse session on {}", self.db);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_session_enforces_foreign_keys() {
        let dir = tempdir().unwrap();
        let warehouse = Warehouse::new(dir.path().join("wh.db"), Duration::from_secs(1));
        let session = warehouse.open_session().unwrap();

        let enabled: i64 = session
            .connection()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn test_dropped_write_transaction_rolls_back() {
        let dir = tempdir().unwrap();
        let warehouse = Warehouse::new(dir.path().join("wh.db"), Duration::from_secs(1));
        warehouse.ensure_schema().unwrap();

        let mut session = warehouse.open_session().unwrap();
        {
            let tx = session.begin_write("users").unwrap();
            tx.execute(
                "INSERT INTO users (user_id, first_name, last_name, gender, level) VALUES ('1', 'A', 'B', 'F', 'free')",
                [],
            )
            .unwrap();
        }

        let count: i64 = session
            .connection()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
