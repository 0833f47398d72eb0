use crate::schema::SchemaMap;
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: String,
    pub merge: MergeSettings,
    pub finder: FinderSettings,
    /// Replaces the built-in HeritagePress mapping when present.
    pub schema: Option<SchemaMap>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: "heritage.db".to_string(),
            merge: MergeSettings::default(),
            finder: FinderSettings::default(),
            schema: None,
        }
    }
}

/// How a merge behaves when another merge holds one of its records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    #[default]
    Blocking,
    FailFast,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MergeSettings {
    /// Joins distinct text values under the `merge_all` field policy.
    pub separator: String,
    pub lock_mode: LockMode,
    pub lock_timeout_ms: u64,
    pub transaction_timeout_ms: u64,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            separator: "; ".to_string(),
            lock_mode: LockMode::Blocking,
            lock_timeout_ms: 5_000,
            transaction_timeout_ms: 30_000,
        }
    }
}

impl MergeSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FinderSettings {
    pub default_threshold: f64,
    /// Compare records across tree scopes instead of within each scope.
    pub cross_scope: bool,
    /// Tokens shared by more labels than this do not produce candidate pairs.
    pub max_token_frequency: usize,
}

impl Default for FinderSettings {
    fn default() -> Self {
        Self {
            default_threshold: 0.85,
            cross_scope: false,
            max_token_frequency: 50,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.finder.default_threshold) {
            return Err(ConfigError::Message(format!(
                "finder.default_threshold must be within [0, 1], got {}",
                self.finder.default_threshold
            )));
        }
        if self.merge.transaction_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "merge.transaction_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.database_path.trim().is_empty() {
            return Err(ConfigError::Message("database_path is empty".to_string()));
        }
        Ok(())
    }
}

/// Load `HeritageMerge.toml` (optional) with `HERITAGE_MERGE__*` environment overrides.
pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("HeritageMerge").required(false))
        .add_source(Environment::with_prefix("HERITAGE_MERGE").separator("__"))
        .build()?;
    let config = builder.try_deserialize::<AppConfig>()?;
    config.validate()?;
    Ok(config)
}
