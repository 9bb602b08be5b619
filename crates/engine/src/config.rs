//! Configuration loading and typed config structures for the world state engine.
//!
//! Configuration is a YAML document. Every section is optional and falls
//! back to the defaults below:
//!
//! ```yaml
//! summarization:
//!   enabled: true
//!   tiers:
//!     daily:     { frequency_days: 1,   retention_days: 7 }
//!     weekly:    { frequency_days: 7,   retention_days: 28 }
//!     monthly:   { frequency_days: 28,  retention_days: 90 }
//!     quarterly: { frequency_days: 90,  retention_days: 365 }
//!     yearly:    { frequency_days: 365, retention_days: 730 }
//! significance:
//!   categories: [political, military, quest]
//!   numeric_delta_threshold: 100.0
//!   auto_snapshot: true
//! repository:
//!   backend: memory        # none | memory | file
//!   path: ./worldstate-data
//! logging:
//!   filter: info
//! ```
//!
//! Listing `tiers` replaces the whole default schedule.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use worldstate_history::RetentionSchedule;
use worldstate_kernel::SignificancePolicy;

/// Environment variable that points the repository at a data directory.
pub const DATA_DIR_ENV: &str = "WORLDSTATE_DATA_DIR";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml { source: serde_yaml::Error },

    /// Parsed, but the values cannot be used.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(source: serde_yaml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub summarization: SummarizationConfig,

    /// Which changes trigger auto-snapshots and survive summarization.
    #[serde(default)]
    pub significance: SignificancePolicy,

    #[serde(default)]
    pub repository: RepositoryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// `WORLDSTATE_DATA_DIR`, when set, overrides `repository.path` and
    /// selects the file backend.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string and validate it.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        config.apply_data_dir(std::env::var(DATA_DIR_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    /// Point the repository at `dir`, if given.
    pub fn apply_data_dir(&mut self, dir: Option<String>) {
        if let Some(dir) = dir.filter(|d| !d.trim().is_empty()) {
            self.repository.backend = RepositoryBackend::File;
            self.repository.path = Some(PathBuf::from(dir));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.summarization
            .tiers
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let threshold = self.significance.numeric_delta_threshold;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "significance.numeric_delta_threshold must be a non-negative number, \
                 got {threshold}"
            )));
        }

        if self.repository.backend == RepositoryBackend::File && self.repository.path.is_none() {
            return Err(ConfigError::Invalid(
                "repository.path is required for the file backend".into(),
            ));
        }
        Ok(())
    }
}

/// Summarization schedule settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizationConfig {
    pub enabled: bool,
    pub tiers: RetentionSchedule,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tiers: RetentionSchedule::default(),
        }
    }
}

/// Which repository backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryBackend {
    /// No durable storage; persistence calls report failure.
    None,
    #[default]
    Memory,
    File,
}

/// Repository settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub backend: RepositoryBackend,
    /// Store directory for the file backend.
    pub path: Option<PathBuf>,
}

impl RepositoryConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: RepositoryBackend::File,
            path: Some(path.into()),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive string.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}
