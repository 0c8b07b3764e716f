//! CLI configuration.
//!
//! Loaded in order: defaults, then an optional YAML file, then environment
//! overrides (`STATEWRIGHT_LOG_LIMIT`, `STATEWRIGHT_LOG`, `STATEWRIGHT_HISTORY`).

use serde::Deserialize;
use statewright_core::design::MAX_LOG_LIMIT;
use std::path::{Path, PathBuf};

const HISTORY_FILE: &str = ".statewright_history";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub machine: MachineConfig,
    pub logging: LoggingConfig,
    pub repl: ReplConfig,
}

impl Config {
    /// Loads configuration from `path` (if any) with environment overrides applied.
    pub fn load(path: Option<&Path>) -> Result<Self, LoadError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| LoadError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| LoadError::ParseError(path.to_path_buf(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        self.machine.apply_overrides(&var);
        self.logging.apply_overrides(&var);
        self.repl.apply_overrides(&var);
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), LoadError> {
        if let Some(limit) = self.machine.log_limit {
            if limit > MAX_LOG_LIMIT {
                return Err(LoadError::Invalid(format!(
                    "machine.log_limit must be at most {}, got {}",
                    MAX_LOG_LIMIT, limit
                )));
            }
        }
        if self.logging.filter.trim().is_empty() {
            return Err(LoadError::Invalid(
                "logging.filter must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Overrides applied to every machine the CLI builds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Replaces the design's `options.log_limit`.
    pub log_limit: Option<usize>,
}

impl MachineConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(limit) = var("STATEWRIGHT_LOG_LIMIT") {
            if let Ok(n) = limit.parse() {
                self.log_limit = Some(n);
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "warn".to_string(),
        }
    }
}

impl LoggingConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(filter) = var("STATEWRIGHT_LOG") {
            if !filter.is_empty() {
                self.filter = filter;
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    pub history_file: Option<PathBuf>,
}

impl ReplConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("STATEWRIGHT_HISTORY") {
            self.history_file = Some(PathBuf::from(path));
        }
    }

    /// History file path: the configured one, else `~/.statewright_history`.
    pub fn history_path(&self) -> PathBuf {
        match &self.history_file {
            Some(path) => path.clone(),
            None => home::home_dir()
                .map(|home| home.join(HISTORY_FILE))
                .unwrap_or_else(|| PathBuf::from(HISTORY_FILE)),
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum LoadError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    Invalid(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            LoadError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            LoadError::Invalid(msg) => write!(f, "configuration validation failed: {}", msg),
        }
    }
}

impl std::error::Error for LoadError {}
