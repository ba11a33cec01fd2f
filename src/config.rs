use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DB_PATH_ENV: &str = "PIPELINE_DB_PATH";
pub const LOG_DIR_ENV: &str = "PIPELINE_LOG_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    /// Daily rolling JSON logs go here; stderr when unset.
    pub log_dir: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("pipeline.db"),
            log_dir: None,
            log_filter: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("cannot read {}: {}", path.display(), err)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw)?;
        if config.log_filter.trim().is_empty() {
            return Err(AppError::Config("logFilter must not be empty".to_string()));
        }
        Ok(config)
    }

    fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(DB_PATH_ENV).filter(|value| !value.trim().is_empty()) {
            self.database_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup(LOG_DIR_ENV).filter(|value| !value.trim().is_empty()) {
            self.log_dir = Some(PathBuf::from(dir));
        }
    }
}
