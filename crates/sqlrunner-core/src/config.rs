use crate::adbc::{
    DatabaseOptions, DATABASE_OPTION_DRIVER, DATABASE_OPTION_ENTRYPOINT, DATABASE_OPTION_PATH,
    DUCKDB_DRIVER, DUCKDB_ENTRYPOINT, IN_MEMORY_PATH,
};

/// Default name (and prefix, with unique naming) of the ingested table.
pub const DEFAULT_TABLE_NAME: &str = "source_table";

/// Leaves room for the per-call counter suffix.
const MAX_TABLE_NAME_LEN: usize = 100;

/// Check that `name` can be spliced into SQL unquoted.
///
/// Rules:
/// - Must not be empty or longer than 100 bytes
/// - Must start with a letter or underscore
/// - May only contain ASCII letters, digits, underscores
pub fn validate_table_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("table name cannot be empty".into());
    }
    if name.len() > MAX_TABLE_NAME_LEN {
        return Err(format!(
            "table name too long ({} > {})",
            name.len(),
            MAX_TABLE_NAME_LEN
        ));
    }
    let first_char = name.chars().next().unwrap_or_default();
    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err("table name must start with a letter or underscore".into());
    }
    if let Some(c) = name.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(format!("table name contains invalid character: '{c}'"));
    }
    Ok(())
}

/// Configuration options for a [`SqlRunner`](crate::SqlRunner).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Driver name passed to the driver manager.
    pub driver: String,

    /// Driver entrypoint symbol.
    pub entrypoint: String,

    /// Database path. `:memory:` for an ephemeral database.
    pub path: String,

    /// Name of the ingested table, or its prefix when `unique_table_names`
    /// is set.
    pub table_name: String,

    /// Suffix the table name with a per-session counter on every call.
    pub unique_table_names: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            driver: DUCKDB_DRIVER.to_string(),
            entrypoint: DUCKDB_ENTRYPOINT.to_string(),
            path: IN_MEMORY_PATH.to_string(),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            unique_table_names: true,
        }
    }
}

impl RunnerConfig {
    /// Create a new RunnerConfig builder.
    pub fn builder() -> RunnerConfigBuilder {
        RunnerConfigBuilder::default()
    }

    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions::new()
            .with(DATABASE_OPTION_DRIVER, self.driver.as_str())
            .with(DATABASE_OPTION_ENTRYPOINT, self.entrypoint.as_str())
            .with(DATABASE_OPTION_PATH, self.path.as_str())
    }
}

/// Builder for RunnerConfig.
#[derive(Default)]
pub struct RunnerConfigBuilder {
    config: RunnerConfig,
}

impl RunnerConfigBuilder {
    /// Set driver name.
    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.config.driver = driver.into();
        self
    }

    /// Set driver entrypoint.
    pub fn entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.config.entrypoint = entrypoint.into();
        self
    }

    /// Set database path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Set table name (or prefix).
    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.config.table_name = name.into();
        self
    }

    /// Enable or disable per-call unique table names.
    pub fn unique_table_names(mut self, enabled: bool) -> Self {
        self.config.unique_table_names = enabled;
        self
    }

    /// Build the RunnerConfig.
    pub fn build(self) -> RunnerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_in_memory_duckdb() {
        let opts = RunnerConfig::default().database_options();
        assert_eq!(opts.driver(), Some("duckdb"));
        assert_eq!(opts.entrypoint(), Some("duckdb_adbc_init"));
        assert_eq!(opts.path(), ":memory:");
    }

    #[test]
    fn table_name_rules() {
        assert!(validate_table_name(DEFAULT_TABLE_NAME).is_ok());
        assert!(validate_table_name("_t1").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("1table").is_err());
        assert!(validate_table_name("drop table x; --").is_err());
        assert!(validate_table_name("t\"x").is_err());
        assert!(validate_table_name(&"a".repeat(101)).is_err());
    }

    #[test]
    fn builder_overrides_fields() {
        let cfg = RunnerConfig::builder()
            .path("/tmp/runner.duckdb")
            .table_name("input")
            .unique_table_names(false)
            .build();
        assert_eq!(cfg.path, "/tmp/runner.duckdb");
        assert_eq!(cfg.table_name, "input");
        assert!(!cfg.unique_table_names);
        assert_eq!(cfg.driver, DUCKDB_DRIVER);
    }
}
