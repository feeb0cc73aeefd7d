use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{LoadError, Result};
use crate::pipeline::dimension::LoadMode;
use crate::pipeline::quality_gate::QualityRule;
use crate::pipeline::staging::StagingMode;
use crate::warehouse::query::is_valid_ident;
use crate::warehouse::schema::{ARTISTS, SONGS, TIME, USERS};
use crate::warehouse::Warehouse;

pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

/// Everything one pipeline run needs. Loaded once, then shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub warehouse: WarehouseConfig,
    pub sources: SourcesConfig,
    pub dimensions: DimensionModes,
    pub facts: FactConfig,
    pub timeouts: StageTimeouts,
    pub quality_rules: Vec<QualityRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub path: PathBuf,
    /// How long a session waits on a locked warehouse before failing
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Event log locations (files, directories, or URLs)
    pub events: Vec<String>,
    /// Song catalog locations
    pub catalog: Vec<String>,
    pub staging_mode: StagingMode,
}

/// Load mode per dimension relation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DimensionModes {
    pub users: LoadMode,
    pub songs: LoadMode,
    pub artists: LoadMode,
    pub time: LoadMode,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FactConfig {
    /// Delete and rebuild the fact table instead of appending
    pub full_reload: bool,
}

/// Per-stage time limits, in seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub staging_secs: u64,
    pub dimensions_secs: u64,
    pub facts_secs: u64,
    pub quality_secs: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/warehouse.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            events: vec!["data/log_data".to_string()],
            catalog: vec!["data/song_data".to_string()],
            staging_mode: StagingMode::Replace,
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            staging_secs: 600,
            dimensions_secs: 300,
            facts_secs: 300,
            quality_secs: 60,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            warehouse: WarehouseConfig::default(),
            sources: SourcesConfig::default(),
            dimensions: DimensionModes::default(),
            facts: FactConfig::default(),
            timeouts: StageTimeouts::default(),
            quality_rules: QualityRule::defaults(),
        }
    }
}

impl DimensionModes {
    pub fn for_relation(&self, relation: &str) -> LoadMode {
        match relation {
            USERS => self.users,
            SONGS => self.songs,
            ARTISTS => self.artists,
            TIME => self.time,
            _ => LoadMode::AppendIfAbsent,
        }
    }

    fn any_replace_all(&self) -> bool {
        [self.users, self.songs, self.artists, self.time].contains(&LoadMode::ReplaceAll)
    }
}

impl StageTimeouts {
    pub fn staging(&self) -> Duration {
        Duration::from_secs(self.staging_secs)
    }

    pub fn dimensions(&self) -> Duration {
        Duration::from_secs(self.dimensions_secs)
    }

    pub fn facts(&self) -> Duration {
        Duration::from_secs(self.facts_secs)
    }

    pub fn quality(&self) -> Duration {
        Duration::from_secs(self.quality_secs)
    }
}

impl PipelineConfig {
    /// Loads configuration: `.env`, then the TOML file, then environment
    /// overrides, then validation. Without an explicit path a missing
    /// default file falls back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => {
                info!("No config file at {}, using defaults", DEFAULT_CONFIG_PATH);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            LoadError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        debug!("Loaded config from {}", path.display());
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| LoadError::Config(format!("Invalid config: {}", e)))
    }

    /// Applies `WAREHOUSE_PATH`, `ETL_EVENT_SOURCES` and `ETL_CATALOG_SOURCES`
    /// (comma separated) from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("WAREHOUSE_PATH") {
            self.warehouse.path = PathBuf::from(path);
        }
        if let Some(events) = lookup("ETL_EVENT_SOURCES") {
            self.sources.events = split_list(&events);
        }
        if let Some(catalog) = lookup("ETL_CATALOG_SOURCES") {
            self.sources.catalog = split_list(&catalog);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.events.is_empty() {
            return Err(LoadError::Config("no event sources configured".to_string()));
        }
        if self.sources.catalog.is_empty() {
            return Err(LoadError::Config("no catalog sources configured".to_string()));
        }

        let t = &self.timeouts;
        if [t.staging_secs, t.dimensions_secs, t.facts_secs, t.quality_secs].contains(&0) {
            return Err(LoadError::Config("stage timeouts must be positive".to_string()));
        }

        for rule in &self.quality_rules {
            if !is_valid_ident(&rule.table) {
                return Err(LoadError::Config(format!(
                    "quality rule table '{}' is not a valid identifier",
                    rule.table
                )));
            }
            if let Some(col) = rule.not_null_columns.iter().find(|c| !is_valid_ident(c)) {
                return Err(LoadError::Config(format!(
                    "quality rule column '{}.{}' is not a valid identifier",
                    rule.table, col
                )));
            }
        }

        // Appended facts keep referencing dimension rows a REPLACE_ALL would delete
        if self.dimensions.any_replace_all() && !self.facts.full_reload {
            return Err(LoadError::Config(
                "REPLACE_ALL dimensions require facts.full_reload = true".to_string(),
            ));
        }
        Ok(())
    }

    pub fn warehouse(&self) -> Warehouse {
        Warehouse::new(
            &self.warehouse.path,
            Duration::from_millis(self.warehouse.busy_timeout_ms),
        )
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quality_rules.len(), 5);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [warehouse]
            path = "/tmp/wh.db"

            [dimensions]
            users = "REPLACE_ALL"

            [facts]
            full_reload = true

            [[quality_rules]]
            table = "songplays"
            not_null_columns = ["user_id"]
            "#,
        )
        .unwrap();

        assert_eq!(config.warehouse.path, PathBuf::from("/tmp/wh.db"));
        assert_eq!(config.warehouse.busy_timeout_ms, 5_000);
        assert_eq!(config.dimensions.for_relation(USERS), LoadMode::ReplaceAll);
        assert_eq!(config.dimensions.for_relation(SONGS), LoadMode::AppendIfAbsent);
        assert_eq!(config.quality_rules.len(), 1);
        assert_eq!(config.quality_rules[0].min_row_count, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_replace_sources() {
        let env: HashMap<&str, &str> = [
            ("WAREHOUSE_PATH", "/var/lib/etl/wh.db"),
            ("ETL_EVENT_SOURCES", "s3/log_data/2018, https://example.com/events.json"),
        ]
        .into_iter()
        .collect();

        let mut config = PipelineConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.warehouse.path, PathBuf::from("/var/lib/etl/wh.db"));
        assert_eq!(
            config.sources.events,
            vec!["s3/log_data/2018", "https://example.com/events.json"]
        );
        assert_eq!(config.sources.catalog, vec!["data/song_data"]);
    }

    #[test]
    fn test_replace_all_with_appending_facts_is_rejected() {
        let mut config = PipelineConfig::default();
        config.dimensions.artists = LoadMode::ReplaceAll;
        assert!(matches!(config.validate(), Err(LoadError::Config(_))));

        config.facts.full_reload = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_rule_identifier_is_rejected() {
        let mut config = PipelineConfig::default();
        config.quality_rules = vec![QualityRule::new("users; DROP TABLE users", 1, &[])];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_example_config_parses() {
        let config =
            PipelineConfig::from_toml_str(include_str!("../config/pipeline.example.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.sources.staging_mode, StagingMode::Replace);
        assert_eq!(config.quality_rules.len(), 5);
        assert_eq!(config.timeouts.quality(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let mut config = PipelineConfig::default();
        config.timeouts.facts_secs = 0;
        assert!(config.validate().is_err());
    }
}
