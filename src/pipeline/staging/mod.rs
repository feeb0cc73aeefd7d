//! Staging ingestion: raw source objects into staging relations.
//!
//! Every source is fetched, parsed, validated and mapped to typed rows before
//! the warehouse is opened, so a bad source never leaves a partial load. The
//! write itself is one immediate transaction per staging relation.

pub mod reader;
pub mod tables;

use std::sync::Arc;
use std::time::Instant;

use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::{LoadError, Result};
use crate::observability::metrics;
use crate::warehouse::query::delete_all_sql;
use crate::warehouse::{run_blocking, Session, Warehouse};

pub use reader::{FileSourceReader, HttpSourceReader, ObjectStoreReader, SourceObject, SourceReader};
pub use tables::{StagingTable, STAGING_EVENTS_TABLE, STAGING_SONGS_TABLE};

/// Whether a staging load overwrites the relation or adds to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StagingMode {
    #[default]
    Replace,
    Append,
}

pub struct StagingLoader {
    warehouse: Warehouse,
    reader: Arc<dyn SourceReader>,
}

impl StagingLoader {
    pub fn new(warehouse: Warehouse, reader: Arc<dyn SourceReader>) -> Self {
        Self { warehouse, reader }
    }

    /// Copies every record under `sources` into `table`. Returns the number
    /// of rows written.
    #[instrument(skip_all, fields(relation = table.name, mode = ?mode))]
    pub async fn load(
        &self,
        sources: &[String],
        table: &'static StagingTable,
        mode: StagingMode,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let started = Instant::now();
        if sources.is_empty() {
            return Err(LoadError::Config(format!(
                "no source locations configured for {}",
                table.name
            )));
        }

        let mut objects = Vec::new();
        for uri in sources {
            let fetched = tokio::select! {
                fetched = self.reader.fetch(uri) => fetched?,
                _ = cancel.cancelled() => {
                    return Err(LoadError::Cancelled {
                        stage: format!("staging {}", table.name),
                    })
                }
            };
            debug!("📥 {} expanded to {} object(s)", uri, fetched.len());
            objects.extend(fetched);
        }

        let rows = prepare_rows(table, &objects)?;
        info!(
            "📦 Prepared {} rows for {} from {} object(s)",
            rows.len(),
            table.name,
            objects.len()
        );

        let warehouse = self.warehouse.clone();
        let cancel = cancel.clone();
        let written = run_blocking(table.name, move || {
            let mut session = warehouse.open_session()?;
            bulk_copy(&mut session, table, mode, rows, &cancel)
        })
        .await?;

        metrics::staging::rows_staged(table.name, written);
        metrics::staging::duration(table.name, started.elapsed().as_secs_f64());
        info!("✅ Staged {} rows into {} ({:?})", written, table.name, mode);
        Ok(written)
    }
}

/// Parses and validates every object, returning rows in column order.
/// Fails on the first record that does not match the staging schema.
pub fn prepare_rows(table: &StagingTable, objects: &[SourceObject]) -> Result<Vec<Vec<SqlValue>>> {
    let mut rows = Vec::new();
    for object in objects {
        info!(
            "🔏 {} sha256={} bytes={}",
            object.uri,
            object.digest(),
            object.bytes.len()
        );
        for (index, record) in object.records()?.iter().enumerate() {
            table.validate(&object.uri, index, record)?;
            rows.push(table.to_row(&object.uri, index, record)?);
        }
    }
    Ok(rows)
}

/// Writes `rows` in one immediate transaction, clearing the relation first in
/// replace mode. Rolls back if `cancel` fires before commit.
pub fn bulk_copy(
    session: &mut Session,
    table: &StagingTable,
    mode: StagingMode,
    rows: Vec<Vec<SqlValue>>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let insert = table.insert_sql()?;
    let tx = session.begin_write(table.name)?;

    if mode == StagingMode::Replace {
        tx.execute(&delete_all_sql(table.name)?, [])
            .map_err(|e| LoadError::from_warehouse(table.name, e))?;
    }

    let mut written = 0u64;
    {
        let mut stmt = tx
            .prepare(&insert)
            .map_err(|e| LoadError::from_warehouse(table.name, e))?;
        for row in rows {
            written += stmt
                .execute(params_from_iter(row))
                .map_err(|e| LoadError::from_warehouse(table.name, e))? as u64;
        }
    }

    if cancel.is_cancelled() {
        return Err(LoadError::Cancelled {
            stage: format!("staging {}", table.name),
        });
    }
    tx.commit()
        .map_err(|e| LoadError::from_warehouse(table.name, e))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn song_object(uri: &str, song_id: &str) -> SourceObject {
        let body = format!(
            r#"{{"song_id":"{song_id}","num_songs":1,"artist_id":"AR1","artist_latitude":null,"artist_longitude":null,"artist_location":"","artist_name":"Oasis","title":"Wonderwall","duration":258.3,"year":1995}}"#
        );
        SourceObject {
            uri: uri.to_string(),
            bytes: body.into_bytes(),
        }
    }

    fn staged_count(session: &Session) -> i64 {
        session
            .connection()
            .query_row("SELECT COUNT(*) FROM staging_songs", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_replace_overwrites_and_append_accumulates() {
        let dir = tempdir().unwrap();
        let warehouse = Warehouse::new(dir.path().join("wh.db"), Duration::from_secs(1));
        warehouse.ensure_schema().unwrap();
        let mut session = warehouse.open_session().unwrap();
        let cancel = CancellationToken::new();

        let rows = prepare_rows(&STAGING_SONGS_TABLE, &[song_object("a.json", "S1")]).unwrap();
        bulk_copy(&mut session, &STAGING_SONGS_TABLE, StagingMode::Replace, rows.clone(), &cancel).unwrap();
        bulk_copy(&mut session, &STAGING_SONGS_TABLE, StagingMode::Append, rows.clone(), &cancel).unwrap();
        assert_eq!(staged_count(&session), 2);

        bulk_copy(&mut session, &STAGING_SONGS_TABLE, StagingMode::Replace, rows, &cancel).unwrap();
        assert_eq!(staged_count(&session), 1);
    }

    #[test]
    fn test_cancel_before_commit_rolls_back() {
        let dir = tempdir().unwrap();
        let warehouse = Warehouse::new(dir.path().join("wh.db"), Duration::from_secs(1));
        warehouse.ensure_schema().unwrap();
        let mut session = warehouse.open_session().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let rows = prepare_rows(&STAGING_SONGS_TABLE, &[song_object("a.json", "S1")]).unwrap();
        let err = bulk_copy(&mut session, &STAGING_SONGS_TABLE, StagingMode::Replace, rows, &cancel)
            .unwrap_err();

        assert!(matches!(err, LoadError::Cancelled { .. }));
        assert_eq!(staged_count(&session), 0);
    }

    #[test]
    fn test_one_bad_record_rejects_the_batch() {
        let bad = SourceObject {
            uri: "b.json".to_string(),
            bytes: br#"{"song_id":"S2","artist_id":"AR1","title":"x","artist_name":"y","duration":"long"}"#.to_vec(),
        };
        let err = prepare_rows(&STAGING_SONGS_TABLE, &[song_object("a.json", "S1"), bad]).unwrap_err();
        match err {
            LoadError::SchemaMismatch { source_uri, record, .. } => {
                assert_eq!(source_uri, "b.json");
                assert_eq!(record, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
