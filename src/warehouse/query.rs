//! Typed operation descriptors and the SQL they render to.
//!
//! Relation and column names are validated and quoted before they reach a
//! statement; literal values are always bound as parameters.

use rusqlite::types::Value;

use crate::error::{LoadError, Result};

/// Column carrying the "latest by" ordering inside a candidate relation.
const ORDER_COLUMN: &str = "_order";

pub fn is_valid_ident(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn quote_ident(name: &str) -> Result<String> {
    if !is_valid_ident(name) {
        return Err(LoadError::Config(format!("invalid identifier '{}'", name)));
    }
    Ok(format!("\"{}\"", name))
}

fn quote_all<S: AsRef<str>>(names: &[S]) -> Result<Vec<String>> {
    names.iter().map(|n| quote_ident(n.as_ref())).collect()
}

/// Row filter over a single relation.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Text equality; the value is always bound.
    Eq(String, String),
    NotNull(String),
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn eq_text(column: &str, value: &str) -> Self {
        Predicate::Eq(column.to_string(), value.to_string())
    }

    pub fn not_null(column: &str) -> Self {
        Predicate::NotNull(column.to_string())
    }

    /// Renders the predicate, pushing bound values onto `params` in order.
    pub fn render(&self, params: &mut Vec<Value>) -> Result<String> {
        match self {
            Predicate::Eq(column, value) => {
                params.push(Value::Text(value.clone()));
                Ok(format!("{} = ?{}", quote_ident(column)?, params.len()))
            }
            Predicate::NotNull(column) => Ok(format!("{} IS NOT NULL", quote_ident(column)?)),
            Predicate::And(parts) if parts.is_empty() => Ok("1 = 1".to_string()),
            Predicate::And(parts) => {
                let rendered = parts
                    .iter()
                    .map(|p| p.render(params).map(|sql| format!("({})", sql)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(rendered.join(" AND "))
            }
        }
    }
}

/// A distinct projection of one staging relation onto dimension columns.
#[derive(Debug, Clone)]
pub struct Projection {
    pub from: String,
    /// `(target column, source column)` pairs, in target column order.
    pub columns: Vec<(String, String)>,
    pub filter: Option<Predicate>,
    /// When set, the candidate with the greatest value wins for a key.
    pub latest_by: Option<String>,
}

impl Projection {
    pub fn new(from: &str, columns: &[(&str, &str)]) -> Self {
        Self {
            from: from.to_string(),
            columns: columns
                .iter()
                .map(|(t, s)| (t.to_string(), s.to_string()))
                .collect(),
            filter: None,
            latest_by: None,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(predicate);
        self
    }

    pub fn latest_by(mut self, column: &str) -> Self {
        self.latest_by = Some(column.to_string());
        self
    }

    pub fn target_columns(&self) -> Vec<String> {
        self.columns.iter().map(|(t, _)| t.clone()).collect()
    }
}

/// `CREATE TEMP TABLE` for a candidate relation with the given columns.
pub fn create_candidates_sql(candidates: &str, columns: &[String], ordered: bool) -> Result<String> {
    let mut cols = quote_all(columns)?;
    if ordered {
        cols.push(quote_ident(ORDER_COLUMN)?);
    }
    let name = quote_ident(candidates)?;
    Ok(format!(
        "DROP TABLE IF EXISTS temp.{name}; CREATE TEMP TABLE {name} ({});",
        cols.join(", ")
    ))
}

/// `INSERT INTO temp candidates SELECT <projection> FROM <source> WHERE <filter>`.
pub fn fill_candidates_sql(candidates: &str, projection: &Projection) -> Result<(String, Vec<Value>)> {
    let mut params = Vec::new();
    let mut selects = projection
        .columns
        .iter()
        .map(|(_, source)| quote_ident(source))
        .collect::<Result<Vec<_>>>()?;
    if let Some(order) = &projection.latest_by {
        selects.push(quote_ident(order)?);
    }
    let where_clause = match &projection.filter {
        Some(p) => format!(" WHERE {}", p.render(&mut params)?),
        None => String::new(),
    };
    let sql = format!(
        "INSERT INTO temp.{} SELECT {} FROM {}{}",
        quote_ident(candidates)?,
        selects.join(", "),
        quote_ident(&projection.from)?,
        where_clause
    );
    Ok((sql, params))
}

/// `SELECT DISTINCT <column> FROM <from> WHERE <filter>`.
pub fn distinct_values_sql(
    from: &str,
    column: &str,
    filter: Option<&Predicate>,
) -> Result<(String, Vec<Value>)> {
    let mut params = Vec::new();
    let where_clause = match filter {
        Some(p) => format!(" WHERE {}", p.render(&mut params)?),
        None => String::new(),
    };
    let column = quote_ident(column)?;
    Ok((
        format!(
            "SELECT DISTINCT {column} FROM {}{} ORDER BY {column}",
            quote_ident(from)?,
            where_clause
        ),
        params,
    ))
}

/// Single-row insert into a candidate relation, one placeholder per column.
pub fn insert_candidate_sql(candidates: &str, columns: &[String]) -> Result<String> {
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!(
        "INSERT INTO temp.{} ({}) VALUES ({})",
        quote_ident(candidates)?,
        quote_all(columns)?.join(", "),
        placeholders
    ))
}

pub fn drop_candidates_sql(candidates: &str) -> Result<String> {
    Ok(format!("DROP TABLE IF EXISTS temp.{}", quote_ident(candidates)?))
}

/// Counts distinct candidate rows whose natural key is null.
pub fn count_null_keys_sql(candidates: &str, key: &str, columns: &[String]) -> Result<String> {
    Ok(format!(
        "SELECT COUNT(*) FROM (SELECT DISTINCT {} FROM temp.{} WHERE {} IS NULL)",
        quote_all(columns)?.join(", "),
        quote_ident(candidates)?,
        quote_ident(key)?
    ))
}

/// Counts distinct candidate keys already present in the target relation.
pub fn count_present_keys_sql(candidates: &str, target: &str, key: &str) -> Result<String> {
    let key = quote_ident(key)?;
    Ok(format!(
        "SELECT COUNT(DISTINCT {key}) FROM temp.{} WHERE {key} IS NOT NULL AND {key} IN (SELECT {key} FROM {})",
        quote_ident(candidates)?,
        quote_ident(target)?
    ))
}

/// One candidate row per non-null key, chosen by the ordering column when
/// present, else by candidate insertion order.
fn chosen_candidates_sql(candidates: &str, key: &str, cols: &str, ordered: bool) -> Result<String> {
    let order = if ordered {
        format!("{} DESC, rowid", quote_ident(ORDER_COLUMN)?)
    } else {
        "rowid".to_string()
    };
    Ok(format!(
        "SELECT {cols} FROM ( \
             SELECT {cols}, ROW_NUMBER() OVER (PARTITION BY {key} ORDER BY {order}) AS \"_rn\" \
             FROM temp.{} WHERE {key} IS NOT NULL \
         ) WHERE \"_rn\" = 1",
        quote_ident(candidates)?
    ))
}

/// Set-difference insert: the chosen row for every key absent from `target`.
pub fn insert_absent_sql(
    candidates: &str,
    target: &str,
    key: &str,
    columns: &[String],
    ordered: bool,
) -> Result<String> {
    let key = quote_ident(key)?;
    let cols = quote_all(columns)?.join(", ");
    let target = quote_ident(target)?;
    let chosen = chosen_candidates_sql(candidates, &key, &cols, ordered)?;
    Ok(format!(
        "INSERT INTO {target} ({cols}) {chosen} \
         AND {key} NOT IN (SELECT {key} FROM {target} WHERE {key} IS NOT NULL) \
         ORDER BY {key}"
    ))
}

/// Inserts the chosen row for every key, overwriting the attributes of keys
/// already present.
pub fn upsert_chosen_sql(
    candidates: &str,
    target: &str,
    key: &str,
    columns: &[String],
    ordered: bool,
) -> Result<String> {
    let quoted_key = quote_ident(key)?;
    let cols = quote_all(columns)?.join(", ");
    let chosen = chosen_candidates_sql(candidates, &quoted_key, &cols, ordered)?;
    let updates = columns
        .iter()
        .filter(|c| c.as_str() != key)
        .map(|c| quote_ident(c).map(|q| format!("{q} = excluded.{q}")))
        .collect::<Result<Vec<_>>>()?;
    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    Ok(format!(
        "INSERT INTO {} ({cols}) {chosen} ON CONFLICT ({quoted_key}) {conflict}",
        quote_ident(target)?
    ))
}

/// Deletes every row of `target` whose key no row of `referrer` points at.
pub fn delete_unreferenced_sql(target: &str, key: &str, referrer: &str, column: &str) -> Result<String> {
    let key = quote_ident(key)?;
    let column = quote_ident(column)?;
    Ok(format!(
        "DELETE FROM {} WHERE {key} NOT IN (SELECT {column} FROM {} WHERE {column} IS NOT NULL)",
        quote_ident(target)?,
        quote_ident(referrer)?
    ))
}

pub fn delete_all_sql(target: &str) -> Result<String> {
    Ok(format!("DELETE FROM {}", quote_ident(target)?))
}

pub fn count_rows_sql(target: &str) -> Result<String> {
    Ok(format!("SELECT COUNT(*) FROM {}", quote_ident(target)?))
}

pub fn count_nulls_sql(target: &str, column: &str) -> Result<String> {
    Ok(format!(
        "SELECT COUNT(*) FROM {} WHERE {} IS NULL",
        quote_ident(target)?,
        quote_ident(column)?
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_ident("staging_events"));
        assert!(is_valid_ident("_order"));
        assert!(!is_valid_ident("1abc"));
        assert!(!is_valid_ident("users; DROP TABLE users"));
        assert!(!is_valid_ident(""));
        assert!(quote_ident("bad name").is_err());
    }

    #[test]
    fn test_predicate_binds_values_in_order() {
        let predicate = Predicate::And(vec![
            Predicate::eq_text("page", "NextSong"),
            Predicate::not_null("user_id"),
            Predicate::eq_text("level", "paid"),
        ]);
        let mut params = Vec::new();
        let sql = predicate.render(&mut params).unwrap();

        assert_eq!(
            sql,
            "(\"page\" = ?1) AND (\"user_id\" IS NOT NULL) AND (\"level\" = ?2)"
        );
        assert_eq!(params, vec![Value::Text("NextSong".into()), Value::Text("paid".into())]);
    }

    #[test]
    fn test_fill_candidates_includes_order_column() {
        let projection = Projection::new("staging_events", &[("user_id", "user_id"), ("level", "level")])
            .filter(Predicate::eq_text("page", "NextSong"))
            .latest_by("ts");
        let (sql, params) = fill_candidates_sql("cand_users", &projection).unwrap();

        assert_eq!(
            sql,
            "INSERT INTO temp.\"cand_users\" SELECT \"user_id\", \"level\", \"ts\" FROM \"staging_events\" WHERE \"page\" = ?1"
        );
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_projection_rejects_bad_identifiers() {
        let projection = Projection::new("staging_events", &[("user_id", "user_id; --")]);
        assert!(fill_candidates_sql("cand", &projection).is_err());
    }

    #[test]
    fn test_upsert_updates_every_non_key_column() {
        let columns = vec!["user_id".to_string(), "level".to_string()];
        let sql = upsert_chosen_sql("cand_users", "users", "user_id", &columns, true).unwrap();

        assert!(sql.starts_with("INSERT INTO \"users\" (\"user_id\", \"level\") SELECT"));
        assert!(sql.contains("ORDER BY \"_order\" DESC, rowid"));
        assert!(sql.ends_with("ON CONFLICT (\"user_id\") DO UPDATE SET \"level\" = excluded.\"level\""));
    }

    #[test]
    fn test_delete_unreferenced_keeps_referenced_keys() {
        let sql = delete_unreferenced_sql("users", "user_id", "songplays", "user_id").unwrap();
        assert_eq!(
            sql,
            "DELETE FROM \"users\" WHERE \"user_id\" NOT IN (SELECT \"user_id\" FROM \"songplays\" WHERE \"user_id\" IS NOT NULL)"
        );
    }
}
