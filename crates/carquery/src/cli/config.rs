//! `~/.carquery/config.toml` loading.
//!
//! Every section is optional; a missing file yields the built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use carquery_sql::{CastStyle, CatalogSpec, SchemaCatalog};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "config.toml";
const DEFAULT_DATABASE_FILE: &str = "inventory.sqlite3";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CarqueryConfig {
    /// Replaces the built-in inventory catalog when present.
    pub catalog: Option<CatalogSpec>,
    pub numeric: CastStyle,
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub database: Option<PathBuf>,
    pub row_cap: usize,
    pub statement_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            database: None,
            row_cap: 500,
            statement_timeout_ms: 30_000,
        }
    }
}

impl CarqueryConfig {
    /// Read `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    pub fn load_default() -> Result<Self> {
        Self::load(&carquery_logging::carquery_home()?.join(CONFIG_FILE))
    }

    pub fn catalog(&self) -> Result<SchemaCatalog> {
        match &self.catalog {
            Some(spec) => SchemaCatalog::try_from(spec.clone()).context("Invalid [catalog] section"),
            None => Ok(SchemaCatalog::inventory()),
        }
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.execution.database {
            Some(path) => expand_home(path),
            None => Ok(carquery_logging::carquery_home()?.join(DEFAULT_DATABASE_FILE)),
        }
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.execution.statement_timeout_ms)
    }
}

fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = dirs::home_dir().context("Could not determine home directory")?;
            Ok(home.join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carquery_sql::LogicalType;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = CarqueryConfig::load(&temp.path().join(CONFIG_FILE)).unwrap();
        assert!(config.catalog.is_none());
        assert_eq!(config.execution, ExecutionConfig::default());
        assert_eq!(config.numeric, CastStyle::default());
        assert!(config.catalog().unwrap().has_table("used_cars"));
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "[execution]\nrow_cap = 20\n\n[numeric]\ncast_type = \"NUMERIC\"\n",
        )
        .unwrap();

        let config = CarqueryConfig::load(&path).unwrap();
        assert_eq!(config.execution.row_cap, 20);
        assert_eq!(config.statement_timeout(), Duration::from_secs(30));
        assert_eq!(config.numeric.cast_type, "NUMERIC");
        assert!(config.numeric.decimal_comma);
    }

    #[test]
    fn test_catalog_section_replaces_inventory() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
[catalog]
incompatible = [["listings", "archive"]]

[catalog.tables.listings]
columns = [{ name = "cost", type = "numeric_text" }, { name = "make", type = "text" }]

[catalog.tables.archive]
columns = [{ name = "cost", type = "numeric_text" }]
"#,
        )
        .unwrap();

        let catalog = CarqueryConfig::load(&path).unwrap().catalog().unwrap();
        assert!(!catalog.has_table("cars"));
        assert_eq!(catalog.column_type("listings", "cost"), LogicalType::NumericText);
        assert!(catalog.is_incompatible_join("archive", "listings"));
    }

    #[test]
    fn test_duplicate_table_columns_are_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "[catalog.tables.cars]\ncolumns = [{ name = \"mark\", type = \"text\" }, { name = \"MARK\", type = \"text\" }]\n",
        )
        .unwrap();
        let config = CarqueryConfig::load(&path).unwrap();
        assert!(config.catalog().is_err());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        std::fs::write(&path, "[execution\nrow_cap = ").unwrap();
        assert!(CarqueryConfig::load(&path).is_err());
    }

    #[test]
    fn test_explicit_database_path_is_used() {
        let config = CarqueryConfig {
            execution: ExecutionConfig {
                database: Some(PathBuf::from("/data/inventory.db")),
                ..ExecutionConfig::default()
            },
            ..CarqueryConfig::default()
        };
        assert_eq!(config.database_path().unwrap(), PathBuf::from("/data/inventory.db"));
    }
}
