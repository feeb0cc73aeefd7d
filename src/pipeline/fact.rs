//! Songplay fact load.
//!
//! Facts are keyed on `(user_id, start_time, session_id)`. Catalog matches
//! are exact on `(title, artist_name, duration)`; an event with no match is
//! still loaded with null song and artist keys.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{LoadError, Result};
use crate::observability::metrics;
use crate::pipeline::time_dimension::TimeDimensionExtractor;
use crate::warehouse::query::{delete_all_sql, drop_candidates_sql, quote_ident};
use crate::warehouse::schema::{ARTISTS, SONGPLAYS, SONGS, STAGING_EVENTS, STAGING_SONGS, TIME, USERS};
use crate::warehouse::Warehouse;

/// Dimensions every fact row references.
pub const REQUIRED_DIMENSIONS: [&str; 4] = [USERS, SONGS, ARTISTS, TIME];

const CANDIDATES: &str = "cand_songplays";

/// Which dimensions have completed their load in the current run.
#[derive(Debug, Clone, Default)]
pub struct DimensionLookups {
    loaded: Arc<Mutex<HashSet<String>>>,
}

impl DimensionLookups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_loaded(&self, relation: &str) {
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        loaded.insert(relation.to_string());
    }

    pub fn is_loaded(&self, relation: &str) -> bool {
        let loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        loaded.contains(relation)
    }

    /// Errors with the first required dimension that has not been loaded.
    pub fn ensure_ready(&self) -> Result<()> {
        match REQUIRED_DIMENSIONS.iter().find(|r| !self.is_loaded(r)) {
            Some(missing) => Err(LoadError::DimensionNotReady {
                relation: missing.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Relations the fact load reads from and writes to.
#[derive(Debug, Clone)]
pub struct FactSpec {
    pub events: String,
    pub catalog: String,
    pub target: String,
    /// Only events on this page are song plays.
    pub play_page: String,
}

impl Default for FactSpec {
    fn default() -> Self {
        Self {
            events: STAGING_EVENTS.to_string(),
            catalog: STAGING_SONGS.to_string(),
            target: SONGPLAYS.to_string(),
            play_page: "NextSong".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactLoadStats {
    pub inserted: u64,
    /// Inserted facts with no catalog match.
    pub unresolved: u64,
    /// Candidates whose key was already in the fact table.
    pub duplicates: u64,
    /// Play events without a user id; never inserted.
    pub missing_user: u64,
}

struct PlayEvent {
    ts: i64,
    user_id: Option<String>,
    level: Option<String>,
    song: Option<String>,
    artist: Option<String>,
    length: Option<f64>,
    session_id: i64,
    location: Option<String>,
    user_agent: Option<String>,
}

pub struct FactLoader {
    warehouse: Warehouse,
}

impl FactLoader {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    /// Loads song plays from staged events. With `full_reload` the fact
    /// table is emptied and rebuilt inside the same transaction.
    #[instrument(skip_all, fields(target = %spec.target, full_reload = full_reload))]
    pub fn load(
        &self,
        spec: &FactSpec,
        lookups: &DimensionLookups,
        full_reload: bool,
        cancel: &CancellationToken,
    ) -> Result<FactLoadStats> {
        lookups.ensure_ready()?;
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled {
                stage: format!("facts {}", spec.target),
            });
        }

        let target = spec.target.as_str();
        let wh = |e: rusqlite::Error| LoadError::from_warehouse(target, e);
        let events = quote_ident(&spec.events)?;
        let catalog = quote_ident(&spec.catalog)?;
        let fact = quote_ident(target)?;
        let cand = quote_ident(CANDIDATES)?;

        let mut session = self.warehouse.open_session()?;
        // From here on the load runs to commit or rolls back on error; a
        // full reload never leaves the fact table half deleted.
        let tx = session.begin_write(target)?;

        let plays = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT ts, user_id, level, song, artist, length, session_id, location, user_agent \
                     FROM {events} WHERE page = ?1 AND ts IS NOT NULL AND session_id IS NOT NULL \
                     ORDER BY ts, rowid"
                ))
                .map_err(wh)?;
            let rows = stmt
                .query_map(params![spec.play_page], |r| {
                    Ok(PlayEvent {
                        ts: r.get(0)?,
                        user_id: r.get(1)?,
                        level: r.get(2)?,
                        song: r.get(3)?,
                        artist: r.get(4)?,
                        length: r.get(5)?,
                        session_id: r.get(6)?,
                        location: r.get(7)?,
                        user_agent: r.get(8)?,
                    })
                })
                .map_err(wh)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(wh)?
        };

        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS temp.{cand}; \
             CREATE TEMP TABLE {cand} ( \
                 start_time TEXT NOT NULL, user_id TEXT NOT NULL, level TEXT, song TEXT, \
                 artist TEXT, length REAL, session_id INTEGER NOT NULL, location TEXT, \
                 user_agent TEXT, PRIMARY KEY (user_id, start_time, session_id));"
        ))
        .map_err(wh)?;

        let mut missing_user = 0u64;
        {
            // First event per key wins; plays are ordered by ts.
            let mut insert = tx
                .prepare(&format!(
                    "INSERT OR IGNORE INTO temp.{cand} \
                     (start_time, user_id, level, song, artist, length, session_id, location, user_agent) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ))
                .map_err(wh)?;
            for play in &plays {
                let Some(user_id) = play.user_id.as_deref() else {
                    missing_user += 1;
                    continue;
                };
                let start_time = TimeDimensionExtractor::start_time_key(play.ts)?;
                insert
                    .execute(params![
                        start_time,
                        user_id,
                        play.level,
                        play.song,
                        play.artist,
                        play.length,
                        play.session_id,
                        play.location,
                        play.user_agent
                    ])
                    .map_err(wh)?;
            }
        }

        if full_reload {
            let removed = tx.execute(&delete_all_sql(target)?, []).map_err(wh)?;
            debug!("🗑️ Full reload cleared {} rows from {}", removed, target);
        }

        let duplicates: i64 = tx
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM temp.{cand} c WHERE EXISTS ( \
                         SELECT 1 FROM {fact} f WHERE f.user_id = c.user_id \
                         AND f.start_time = c.start_time AND f.session_id = c.session_id)"
                ),
                [],
                |r| r.get(0),
            )
            .map_err(wh)?;

        let max_before: i64 = tx
            .query_row(&format!("SELECT COALESCE(MAX(songplay_id), 0) FROM {fact}"), [], |r| r.get(0))
            .map_err(wh)?;

        let inserted = tx
            .execute(
                &format!(
                    "INSERT INTO {fact} \
                     (start_time, user_id, level, song_id, artist_id, session_id, location, user_agent) \
                     SELECT c.start_time, c.user_id, c.level, m.song_id, m.artist_id, \
                            c.session_id, c.location, c.user_agent \
                     FROM temp.{cand} c \
                     LEFT JOIN ( \
                         SELECT title, artist_name, duration, song_id, artist_id FROM ( \
                             SELECT title, artist_name, duration, song_id, artist_id, \
                                    ROW_NUMBER() OVER ( \
                                        PARTITION BY title, artist_name, duration ORDER BY song_id \
                                    ) AS rn \
                             FROM {catalog} WHERE song_id IS NOT NULL \
                         ) WHERE rn = 1 \
                     ) m ON m.title = c.song AND m.artist_name = c.artist AND m.duration = c.length \
                     WHERE NOT EXISTS ( \
                         SELECT 1 FROM {fact} f WHERE f.user_id = c.user_id \
                         AND f.start_time = c.start_time AND f.session_id = c.session_id) \
                     ORDER BY c.start_time, c.user_id, c.session_id"
                ),
                [],
            )
            .map_err(wh)?;

        let unresolved: i64 = tx
            .query_row(
                &format!("SELECT COUNT(*) FROM {fact} WHERE songplay_id > ?1 AND song_id IS NULL"),
                params![max_before],
                |r| r.get(0),
            )
            .map_err(wh)?;

        tx.execute_batch(&drop_candidates_sql(CANDIDATES)?)
            .map_err(wh)?;
        tx.commit().map_err(wh)?;

        let stats = FactLoadStats {
            inserted: inserted as u64,
            unresolved: unresolved as u64,
            duplicates: duplicates as u64,
            missing_user,
        };
        if stats.missing_user > 0 {
            warn!("⚠️ {} play events had no user id and were not loaded", stats.missing_user);
        }
        metrics::facts::loaded(&stats);
        info!(
            "✅ {}: inserted {}, unresolved {}, duplicates {}",
            target, stats.inserted, stats.unresolved, stats.duplicates
        );
        Ok(stats)
    }
}
