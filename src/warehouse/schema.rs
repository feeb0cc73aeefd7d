use rusqlite::Connection;
use tracing::info;

use crate::error::{LoadError, Result};

pub const STAGING_EVENTS: &str = "staging_events";
pub const STAGING_SONGS: &str = "staging_songs";
pub const USERS: &str = "users";
pub const SONGS: &str = "songs";
pub const ARTISTS: &str = "artists";
pub const TIME: &str = "time";
pub const SONGPLAYS: &str = "songplays";
pub const ETL_RUNS: &str = "etl_runs";

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS staging_events (
    artist          TEXT,
    auth            TEXT,
    first_name      TEXT,
    gender          TEXT,
    item_in_session INTEGER,
    last_name       TEXT,
    length          REAL,
    level           TEXT,
    location        TEXT,
    method          TEXT,
    page            TEXT,
    registration    REAL,
    session_id      INTEGER,
    song            TEXT,
    status          INTEGER,
    ts              INTEGER,
    user_agent      TEXT,
    user_id         TEXT
);

CREATE TABLE IF NOT EXISTS staging_songs (
    song_id          TEXT,
    num_songs        INTEGER,
    artist_id        TEXT,
    artist_latitude  REAL,
    artist_longitude REAL,
    artist_location  TEXT,
    artist_name      TEXT,
    title            TEXT,
    duration         REAL,
    year             INTEGER
);

CREATE TABLE IF NOT EXISTS users (
    user_id    TEXT PRIMARY KEY NOT NULL,
    first_name TEXT,
    last_name  TEXT,
    gender     TEXT,
    level      TEXT
);

CREATE TABLE IF NOT EXISTS artists (
    artist_id TEXT PRIMARY KEY NOT NULL,
    name      TEXT,
    location  TEXT,
    latitude  REAL,
    longitude REAL
);

CREATE TABLE IF NOT EXISTS songs (
    song_id   TEXT PRIMARY KEY NOT NULL,
    title     TEXT,
    artist_id TEXT,
    year      INTEGER,
    duration  REAL
);

CREATE TABLE IF NOT EXISTS time (
    start_time TEXT PRIMARY KEY NOT NULL,
    hour       INTEGER NOT NULL,
    day        INTEGER NOT NULL,
    week       INTEGER NOT NULL,
    month      INTEGER NOT NULL,
    year       INTEGER NOT NULL,
    weekday    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS songplays (
    songplay_id INTEGER PRIMARY KEY AUTOINCREMENT,
    start_time  TEXT NOT NULL REFERENCES time(start_time),
    user_id     TEXT NOT NULL REFERENCES users(user_id),
    level       TEXT,
    song_id     TEXT REFERENCES songs(song_id),
    artist_id   TEXT REFERENCES artists(artist_id),
    session_id  INTEGER NOT NULL,
    location    TEXT,
    user_agent  TEXT,
    UNIQUE (user_id, start_time, session_id)
);

CREATE TABLE IF NOT EXISTS etl_runs (
    run_id      TEXT PRIMARY KEY NOT NULL,
    state       TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    report      TEXT
);
"#;

// Dependents first so foreign keys never block the drop.
const DROP_TABLES: &str = r#"
DROP TABLE IF EXISTS songplays;
DROP TABLE IF EXISTS users;
DROP TABLE IF EXISTS songs;
DROP TABLE IF EXISTS artists;
DROP TABLE IF EXISTS time;
DROP TABLE IF EXISTS staging_events;
DROP TABLE IF EXISTS staging_songs;
DROP TABLE IF EXISTS etl_runs;
"#;

pub fn apply(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLES)
        .map_err(|e| LoadError::from_warehouse("schema", e))
}

/// Drops and recreates every relation. The run ledger is dropped too.
pub fn reset(conn: &Connection) -> Result<()> {
    info!("🧹 Dropping warehouse relations");
    conn.execute_batch(DROP_TABLES)
        .map_err(|e| LoadError::from_warehouse("schema", e))?;
    apply(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_is_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        apply(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('users', 'songs', 'artists', 'time', 'songplays')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }

    #[test]
    fn test_reset_clears_rows() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        conn.execute("INSERT INTO artists (artist_id, name) VALUES ('AR1', 'Oasis')", [])
            .unwrap();

        reset(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM artists", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
