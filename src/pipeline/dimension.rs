//! Dimension upserts from staged data.
//!
//! Candidates are materialized into a temporary relation inside the loader's
//! write transaction. The set difference against the target and the insert
//! both run while that transaction holds the write lock, so a key can never
//! be judged absent by two concurrent loads.

use rusqlite::{params, params_from_iter};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::{LoadError, Result};
use crate::observability::metrics;
use crate::pipeline::time_dimension::TimeDimensionExtractor;
use crate::warehouse::query::{
    count_null_keys_sql, count_present_keys_sql, create_candidates_sql, delete_all_sql,
    delete_unreferenced_sql, distinct_values_sql, drop_candidates_sql, fill_candidates_sql,
    insert_absent_sql, insert_candidate_sql, upsert_chosen_sql, Predicate, Projection,
};
use crate::warehouse::schema::{
    ARTISTS, SONGPLAYS, SONGS, STAGING_EVENTS, STAGING_SONGS, TIME, USERS,
};
use crate::warehouse::{Transaction, Warehouse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadMode {
    /// Insert only rows whose natural key is not already present.
    #[default]
    AppendIfAbsent,
    /// Rebuild the relation from staging in one transaction. Rows still
    /// referenced by facts are kept and refreshed instead of deleted.
    ReplaceAll,
}

const TIME_COLUMNS: [&str; 7] = ["start_time", "hour", "day", "week", "month", "year", "weekday"];

/// Where a dimension's candidate rows come from.
#[derive(Debug, Clone)]
pub enum CandidateSource {
    /// A distinct projection of one staging relation.
    Projection(Projection),
    /// Distinct epoch-millisecond values, expanded into calendar attributes.
    EpochMillis {
        from: String,
        column: String,
        filter: Option<Predicate>,
    },
}

/// A fact column holding foreign keys into a dimension.
#[derive(Debug, Clone)]
pub struct FactReference {
    pub relation: String,
    pub column: String,
}

impl FactReference {
    fn songplays(column: &str) -> Option<Self> {
        Some(Self {
            relation: SONGPLAYS.to_string(),
            column: column.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DimensionSpec {
    pub relation: String,
    pub key: String,
    pub source: CandidateSource,
    /// Facts pointing at this dimension; `REPLACE_ALL` never deletes their targets.
    pub referenced_by: Option<FactReference>,
}

impl DimensionSpec {
    pub fn columns(&self) -> Vec<String> {
        match &self.source {
            CandidateSource::Projection(p) => p.target_columns(),
            CandidateSource::EpochMillis { .. } => TIME_COLUMNS.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn ordered(&self) -> bool {
        matches!(&self.source, CandidateSource::Projection(p) if p.latest_by.is_some())
    }

    /// Users seen in song-play events. The most recent event wins when a
    /// user's attributes change inside one batch.
    pub fn users() -> Self {
        Self {
            relation: USERS.to_string(),
            key: "user_id".to_string(),
            source: CandidateSource::Projection(
                Projection::new(
                    STAGING_EVENTS,
                    &[
                        ("user_id", "user_id"),
                        ("first_name", "first_name"),
                        ("last_name", "last_name"),
                        ("gender", "gender"),
                        ("level", "level"),
                    ],
                )
                .filter(Predicate::And(vec![
                    Predicate::eq_text("page", "NextSong"),
                    Predicate::not_null("ts"),
                ]))
                .latest_by("ts"),
            ),
            referenced_by: FactReference::songplays("user_id"),
        }
    }

    pub fn songs() -> Self {
        Self {
            relation: SONGS.to_string(),
            key: "song_id".to_string(),
            source: CandidateSource::Projection(Projection::new(
                STAGING_SONGS,
                &[
                    ("song_id", "song_id"),
                    ("title", "title"),
                    ("artist_id", "artist_id"),
                    ("year", "year"),
                    ("duration", "duration"),
                ],
            )),
            referenced_by: FactReference::songplays("song_id"),
        }
    }

    pub fn artists() -> Self {
        Self {
            relation: ARTISTS.to_string(),
            key: "artist_id".to_string(),
            source: CandidateSource::Projection(Projection::new(
                STAGING_SONGS,
                &[
                    ("artist_id", "artist_id"),
                    ("name", "artist_name"),
                    ("location", "artist_location"),
                    ("latitude", "artist_latitude"),
                    ("longitude", "artist_longitude"),
                ],
            )),
            referenced_by: FactReference::songplays("artist_id"),
        }
    }

    pub fn time() -> Self {
        Self {
            relation: TIME.to_string(),
            key: "start_time".to_string(),
            source: CandidateSource::EpochMillis {
                from: STAGING_EVENTS.to_string(),
                column: "ts".to_string(),
                filter: Some(Predicate::eq_text("page", "NextSong")),
            },
            referenced_by: FactReference::songplays("start_time"),
        }
    }

    /// The four dimensions of the songplay star.
    pub fn star() -> Vec<Self> {
        vec![Self::users(), Self::songs(), Self::artists(), Self::time()]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionLoadStats {
    /// Rows written; under `REPLACE_ALL` this includes refreshed rows.
    pub inserted: u64,
    /// Candidates with a null key plus, when appending, keys already present.
    pub skipped: u64,
}

pub struct DimensionLoader {
    warehouse: Warehouse,
}

impl DimensionLoader {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    #[instrument(skip_all, fields(relation = %spec.relation, mode = ?mode))]
    pub fn load(
        &self,
        spec: &DimensionSpec,
        mode: LoadMode,
        cancel: &CancellationToken,
    ) -> Result<DimensionLoadStats> {
        let relation = spec.relation.as_str();
        let columns = spec.columns();
        let candidates = format!("cand_{}", relation);
        let ordered = spec.ordered();
        let wh = |e: rusqlite::Error| LoadError::from_warehouse(relation, e);

        let mut session = self.warehouse.open_session()?;
        let tx = session.begin_write(relation)?;

        tx.execute_batch(&create_candidates_sql(&candidates, &columns, ordered)?)
            .map_err(wh)?;
        fill_candidates(&tx, spec, &candidates, &columns)?;

        let null_keys: i64 = tx
            .query_row(&count_null_keys_sql(&candidates, &spec.key, &columns)?, [], |r| r.get(0))
            .map_err(wh)?;

        let (present, inserted) = match mode {
            LoadMode::AppendIfAbsent => {
                let present: i64 = tx
                    .query_row(&count_present_keys_sql(&candidates, relation, &spec.key)?, [], |r| r.get(0))
                    .map_err(wh)?;
                let inserted = tx
                    .execute(
                        &insert_absent_sql(&candidates, relation, &spec.key, &columns, ordered)?,
                        [],
                    )
                    .map_err(wh)?;
                (present, inserted)
            }
            LoadMode::ReplaceAll => {
                let clear = match &spec.referenced_by {
                    Some(fact) => delete_unreferenced_sql(relation, &spec.key, &fact.relation, &fact.column)?,
                    None => delete_all_sql(relation)?,
                };
                let removed = tx.execute(&clear, []).map_err(wh)?;
                debug!("🗑️ Cleared {} rows from {}", removed, relation);
                let written = tx
                    .execute(
                        &upsert_chosen_sql(&candidates, relation, &spec.key, &columns, ordered)?,
                        [],
                    )
                    .map_err(wh)?;
                (0, written)
            }
        };

        tx.execute_batch(&drop_candidates_sql(&candidates)?)
            .map_err(wh)?;

        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled {
                stage: format!("dimension {}", relation),
            });
        }
        tx.commit().map_err(wh)?;

        let stats = DimensionLoadStats {
            inserted: inserted as u64,
            skipped: (null_keys + present) as u64,
        };
        metrics::dimensions::loaded(relation, stats.inserted, stats.skipped);
        info!(
            "✅ {}: inserted {}, skipped {} ({} null keys)",
            relation, stats.inserted, stats.skipped, null_keys
        );
        Ok(stats)
    }
}

fn fill_candidates(
    tx: &Transaction<'_>,
    spec: &DimensionSpec,
    candidates: &str,
    columns: &[String],
) -> Result<()> {
    let relation = spec.relation.as_str();
    let wh = |e: rusqlite::Error| LoadError::from_warehouse(relation, e);

    match &spec.source {
        CandidateSource::Projection(projection) => {
            let (sql, params) = fill_candidates_sql(candidates, projection)?;
            let rows = tx.execute(&sql, params_from_iter(params)).map_err(wh)?;
            debug!("Materialized {} candidate rows for {}", rows, relation);
        }
        CandidateSource::EpochMillis { from, column, filter } => {
            let (sql, params) = distinct_values_sql(from, column, filter.as_ref())?;
            let epochs = {
                let mut stmt = tx.prepare(&sql).map_err(wh)?;
                let rows = stmt
                    .query_map(params_from_iter(params), |r| r.get::<_, Option<i64>>(0))
                    .map_err(wh)?;
                rows.collect::<std::result::Result<Vec<_>, _>>().map_err(wh)?
            };

            let mut insert = tx
                .prepare(&insert_candidate_sql(candidates, columns)?)
                .map_err(wh)?;
            for epoch in &epochs {
                match epoch {
                    Some(ms) => {
                        let t = TimeDimensionExtractor::extract(*ms)?;
                        insert
                            .execute(params![
                                t.start_time_key(),
                                t.hour,
                                t.day,
                                t.week,
                                t.month,
                                t.year,
                                t.weekday
                            ])
                            .map_err(wh)?;
                    }
                    None => {
                        insert
                            .execute(params![
                                None::<String>,
                                None::<i64>,
                                None::<i64>,
                                None::<i64>,
                                None::<i64>,
                                None::<i64>,
                                None::<i64>
                            ])
                            .map_err(wh)?;
                    }
                }
            }
            debug!("Derived {} time candidates from {}.{}", epochs.len(), from, column);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::Session;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn warehouse() -> (TempDir, Warehouse) {
        let dir = tempdir().unwrap();
        let warehouse = Warehouse::new(dir.path().join("wh.db"), Duration::from_secs(1));
        warehouse.ensure_schema().unwrap();
        (dir, warehouse)
    }

    fn stage_event(session: &Session, ts: i64, user_id: Option<&str>, level: &str, page: &str) {
        session
            .connection()
            .execute(
                "INSERT INTO staging_events (ts, user_id, first_name, last_name, gender, level, page, session_id)
                 VALUES (?1, ?2, 'Lily', 'Koch', 'F', ?3, ?4, 7)",
                params![ts, user_id, level, page],
            )
            .unwrap();
    }

    fn count(session: &Session, sql: &str) -> i64 {
        session.connection().query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn test_second_identical_load_inserts_nothing() {
        let (_dir, warehouse) = warehouse();
        let session = warehouse.open_session().unwrap();
        stage_event(&session, 1541440364796, Some("15"), "paid", "NextSong");
        stage_event(&session, 1541440400000, Some("16"), "free", "NextSong");

        let loader = DimensionLoader::new(warehouse.clone());
        let cancel = CancellationToken::new();
        let first = loader.load(&DimensionSpec::users(), LoadMode::AppendIfAbsent, &cancel).unwrap();
        let second = loader.load(&DimensionSpec::users(), LoadMode::AppendIfAbsent, &cancel).unwrap();

        assert_eq!(first, DimensionLoadStats { inserted: 2, skipped: 0 });
        assert_eq!(second, DimensionLoadStats { inserted: 0, skipped: 2 });
        assert_eq!(count(&session, "SELECT COUNT(*) FROM users"), 2);
    }

    #[test]
    fn test_null_keys_are_skipped_not_inserted() {
        let (_dir, warehouse) = warehouse();
        let session = warehouse.open_session().unwrap();
        stage_event(&session, 1541440364796, None, "free", "NextSong");
        stage_event(&session, 1541440400000, Some("15"), "paid", "NextSong");
        stage_event(&session, 1541440500000, Some("99"), "paid", "Home");

        let stats = DimensionLoader::new(warehouse.clone())
            .load(&DimensionSpec::users(), LoadMode::AppendIfAbsent, &CancellationToken::new())
            .unwrap();

        assert_eq!(stats, DimensionLoadStats { inserted: 1, skipped: 1 });
        assert_eq!(count(&session, "SELECT COUNT(*) FROM users WHERE user_id = '99'"), 0);
    }

    #[test]
    fn test_latest_event_wins_for_user_attributes() {
        let (_dir, warehouse) = warehouse();
        let session = warehouse.open_session().unwrap();
        stage_event(&session, 1541440500000, Some("15"), "paid", "NextSong");
        stage_event(&session, 1541440364796, Some("15"), "free", "NextSong");

        DimensionLoader::new(warehouse.clone())
            .load(&DimensionSpec::users(), LoadMode::AppendIfAbsent, &CancellationToken::new())
            .unwrap();

        let level: String = session
            .connection()
            .query_row("SELECT level FROM users WHERE user_id = '15'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(level, "paid");
    }

    #[test]
    fn test_replace_all_reloads_from_staging() {
        let (_dir, warehouse) = warehouse();
        let session = warehouse.open_session().unwrap();
        session
            .connection()
            .execute("INSERT INTO users (user_id, level) VALUES ('stale', 'free')", [])
            .unwrap();
        stage_event(&session, 1541440364796, Some("15"), "paid", "NextSong");

        let stats = DimensionLoader::new(warehouse.clone())
            .load(&DimensionSpec::users(), LoadMode::ReplaceAll, &CancellationToken::new())
            .unwrap();

        assert_eq!(stats.inserted, 1);
        assert_eq!(count(&session, "SELECT COUNT(*) FROM users WHERE user_id = 'stale'"), 0);
    }

    #[test]
    fn test_replace_all_keeps_and_refreshes_referenced_rows() {
        let (_dir, warehouse) = warehouse();
        let session = warehouse.open_session().unwrap();
        session
            .connection()
            .execute_batch(
                "INSERT INTO users (user_id, level) VALUES ('15', 'free'), ('gone', 'free');
                 INSERT INTO time (start_time, hour, day, week, month, year, weekday)
                     VALUES ('2018-11-01 21:01:46.796', 21, 1, 44, 11, 2018, 4);
                 INSERT INTO songplays (start_time, user_id, level, session_id)
                     VALUES ('2018-11-01 21:01:46.796', '15', 'free', 139);",
            )
            .unwrap();
        stage_event(&session, 1541440364796, Some("15"), "paid", "NextSong");

        let loader = DimensionLoader::new(warehouse.clone());
        let cancel = CancellationToken::new();
        for _ in 0..2 {
            let stats = loader.load(&DimensionSpec::users(), LoadMode::ReplaceAll, &cancel).unwrap();
            assert_eq!(stats, DimensionLoadStats { inserted: 1, skipped: 0 });
        }

        assert_eq!(count(&session, "SELECT COUNT(*) FROM users WHERE user_id = 'gone'"), 0);
        let level: String = session
            .connection()
            .query_row("SELECT level FROM users WHERE user_id = '15'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(level, "paid");
        assert_eq!(count(&session, "SELECT COUNT(*) FROM songplays"), 1);
    }

    #[test]
    fn test_time_rows_are_derived_from_epoch_millis() {
        let (_dir, warehouse) = warehouse();
        let session = warehouse.open_session().unwrap();
        stage_event(&session, 1541440364796, Some("15"), "paid", "NextSong");
        stage_event(&session, 1541440364796, Some("16"), "paid", "NextSong");

        let stats = DimensionLoader::new(warehouse.clone())
            .load(&DimensionSpec::time(), LoadMode::AppendIfAbsent, &CancellationToken::new())
            .unwrap();
        assert_eq!(stats.inserted, 1);

        let (start_time, hour, weekday): (String, i64, i64) = session
            .connection()
            .query_row("SELECT start_time, hour, weekday FROM time", [], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .unwrap();
        assert_eq!(start_time, "2018-11-05 17:52:44.796");
        assert_eq!(hour, 17);
        assert_eq!(weekday, 1);
    }

    #[test]
    fn test_cancelled_load_leaves_dimension_untouched() {
        let (_dir, warehouse) = warehouse();
        let session = warehouse.open_session().unwrap();
        stage_event(&session, 1541440364796, Some("15"), "paid", "NextSong");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = DimensionLoader::new(warehouse.clone())
            .load(&DimensionSpec::users(), LoadMode::AppendIfAbsent, &cancel)
            .unwrap_err();

        assert!(matches!(err, LoadError::Cancelled { .. }));
        assert_eq!(count(&session, "SELECT COUNT(*) FROM users"), 0);
    }
}
