//! Declared staging relations: JSON Schema for incoming records plus the
//! typed mapping from record fields onto staging columns.

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::error::{LoadError, Result};
use crate::warehouse::query::quote_ident;
use crate::warehouse::schema::{STAGING_EVENTS, STAGING_SONGS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
}

#[derive(Debug, Clone, Copy)]
pub struct StagingColumn {
    pub column: &'static str,
    pub field: &'static str,
    pub kind: ColumnKind,
    /// Empty or whitespace-only strings are staged as null.
    pub blank_as_null: bool,
}

const fn col(column: &'static str, field: &'static str, kind: ColumnKind) -> StagingColumn {
    StagingColumn {
        column,
        field,
        kind,
        blank_as_null: false,
    }
}

const fn blank_null(column: &'static str, field: &'static str) -> StagingColumn {
    StagingColumn {
        column,
        field,
        kind: ColumnKind::Text,
        blank_as_null: true,
    }
}

const EVENT_COLUMNS: &[StagingColumn] = &[
    blank_null("artist", "artist"),
    col("auth", "auth", ColumnKind::Text),
    col("first_name", "firstName", ColumnKind::Text),
    col("gender", "gender", ColumnKind::Text),
    col("item_in_session", "itemInSession", ColumnKind::Integer),
    col("last_name", "lastName", ColumnKind::Text),
    col("length", "length", ColumnKind::Real),
    col("level", "level", ColumnKind::Text),
    col("location", "location", ColumnKind::Text),
    col("method", "method", ColumnKind::Text),
    col("page", "page", ColumnKind::Text),
    col("registration", "registration", ColumnKind::Real),
    col("session_id", "sessionId", ColumnKind::Integer),
    blank_null("song", "song"),
    col("status", "status", ColumnKind::Integer),
    col("ts", "ts", ColumnKind::Integer),
    col("user_agent", "userAgent", ColumnKind::Text),
    blank_null("user_id", "userId"),
];

const SONG_COLUMNS: &[StagingColumn] = &[
    blank_null("song_id", "song_id"),
    col("num_songs", "num_songs", ColumnKind::Integer),
    blank_null("artist_id", "artist_id"),
    col("artist_latitude", "artist_latitude", ColumnKind::Real),
    col("artist_longitude", "artist_longitude", ColumnKind::Real),
    blank_null("artist_location", "artist_location"),
    col("artist_name", "artist_name", ColumnKind::Text),
    col("title", "title", ColumnKind::Text),
    col("duration", "duration", ColumnKind::Real),
    col("year", "year", ColumnKind::Integer),
];

fn compile_schema(raw: &'static str) -> std::result::Result<JSONSchema, String> {
    let parsed: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    // jsonschema 0.17 expects a schema with 'static lifetime; leaked once per table
    let schema: &'static Value = Box::leak(Box::new(parsed));
    JSONSchema::options()
        .compile(schema)
        .map_err(|e| e.to_string())
}

static EVENTS_VALIDATOR: Lazy<std::result::Result<JSONSchema, String>> =
    Lazy::new(|| compile_schema(include_str!("../../../schemas/staging_events.v1.json")));

static SONGS_VALIDATOR: Lazy<std::result::Result<JSONSchema, String>> =
    Lazy::new(|| compile_schema(include_str!("../../../schemas/staging_songs.v1.json")));

pub struct StagingTable {
    pub name: &'static str,
    pub columns: &'static [StagingColumn],
    validator: &'static Lazy<std::result::Result<JSONSchema, String>>,
}

pub static STAGING_EVENTS_TABLE: StagingTable = StagingTable {
    name: STAGING_EVENTS,
    columns: EVENT_COLUMNS,
    validator: &EVENTS_VALIDATOR,
};

pub static STAGING_SONGS_TABLE: StagingTable = StagingTable {
    name: STAGING_SONGS,
    columns: SONG_COLUMNS,
    validator: &SONGS_VALIDATOR,
};

impl StagingTable {
    /// Checks one parsed record against the declared schema.
    pub fn validate(&self, source_uri: &str, index: usize, record: &Value) -> Result<()> {
        let validator = self
            .validator
            .as_ref()
            .map_err(|e| LoadError::Config(format!("staging schema for {}: {}", self.name, e)))?;

        if let Err(errors) = validator.validate(record) {
            let detail = errors
                .map(|e| format!("{} at '{}'", e, e.instance_path))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(LoadError::SchemaMismatch {
                source_uri: source_uri.to_string(),
                record: index,
                detail,
            });
        }
        Ok(())
    }

    /// Maps a validated record onto staging column values, in column order.
    pub fn to_row(&self, source_uri: &str, index: usize, record: &Value) -> Result<Vec<SqlValue>> {
        self.columns
            .iter()
            .map(|c| {
                coerce(c, record.get(c.field)).map_err(|detail| LoadError::SchemaMismatch {
                    source_uri: source_uri.to_string(),
                    record: index,
                    detail,
                })
            })
            .collect()
    }

    pub fn insert_sql(&self) -> Result<String> {
        let cols = self
            .columns
            .iter()
            .map(|c| quote_ident(c.column))
            .collect::<Result<Vec<_>>>()?;
        let placeholders = (1..=cols.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>();
        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(self.name)?,
            cols.join(", "),
            placeholders.join(", ")
        ))
    }
}

fn coerce(column: &StagingColumn, value: Option<&Value>) -> std::result::Result<SqlValue, String> {
    let value = match value {
        None | Some(Value::Null) => return Ok(SqlValue::Null),
        Some(v) => v,
    };
    match column.kind {
        ColumnKind::Text => match value {
            Value::String(s) if column.blank_as_null && s.trim().is_empty() => Ok(SqlValue::Null),
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            other => Err(format!("field '{}' expected text, found {}", column.field, other)),
        },
        ColumnKind::Integer => value
            .as_i64()
            .map(SqlValue::Integer)
            .ok_or_else(|| format!("field '{}' expected integer, found {}", column.field, value)),
        ColumnKind::Real => value
            .as_f64()
            .map(SqlValue::Real)
            .ok_or_else(|| format!("field '{}' expected number, found {}", column.field, value)),
    }
}
