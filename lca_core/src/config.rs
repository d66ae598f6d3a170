//! # Engine Configuration
//!
//! Explicit configuration handed to [`crate::Engine::open`]. Every component
//! receives the values it needs at construction; there is no process-wide
//! client or settings singleton.
//!
//! Values come from, in increasing precedence:
//!
//! 1. `EngineConfig::default()`
//! 2. a TOML document (`EngineConfig::from_toml_str`)
//! 3. environment variables with the `LCA_ENGINE_` prefix (`apply_env`)
//!
//! ## Example
//!
//! ```rust
//! use lca_core::config::{EngineConfig, ResultPolicy};
//!
//! let config = EngineConfig::from_toml_str(r#"
//!     database_path = "data/lca.sqlite"
//!     result_policy = "replace_project"
//!
//!     [retry]
//!     max_attempts = 5
//! "#).unwrap();
//!
//! assert_eq!(config.result_policy, ResultPolicy::ReplaceProject);
//! assert_eq!(config.retry.max_attempts, 5);
//! assert_eq!(config.default_life_expectancy_years, 60);
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::file_io;
use crate::retry::RetryPolicy;

/// Process-wide default amortization period (years)
pub const DEFAULT_LIFE_EXPECTANCY_YEARS: u32 = 60;

/// How a commit treats results of earlier runs for the same project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultPolicy {
    /// Keep every run's rows, tagged with the run identifier
    #[default]
    AppendWithRun,
    /// Delete the project's prior result and error rows in the same transaction
    ReplaceProject,
}

impl ResultPolicy {
    /// Parse from string (for environment variables)
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "append" | "append_with_run" => Some(Self::AppendWithRun),
            "replace" | "replace_project" => Some(Self::ReplaceProject),
            _ => None,
        }
    }

    /// Stable name stored on history rows
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultPolicy::AppendWithRun => "append_with_run",
            ResultPolicy::ReplaceProject => "replace_project",
        }
    }
}

/// Analytics export settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Root directory of the filesystem export sink
    pub root_dir: PathBuf,
    /// Bucket name, used as the first path segment under `root_dir`
    pub bucket: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            root_dir: PathBuf::from("./export"),
            bucket: "lca-cost-data".to_string(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Fallback life span when no life-expectancy entry matches
    pub default_life_expectancy_years: u32,

    /// Append or replace prior project results on commit
    pub result_policy: ResultPolicy,

    /// Threads used for per-element calculation inside one batch
    pub worker_threads: usize,

    /// Bounded retry for collaborator calls
    pub retry: RetryPolicy,

    /// Upper bound a collaborator call may block (milliseconds)
    pub collaborator_timeout_ms: u64,

    /// Busy timeout for the SQLite connection (milliseconds)
    pub busy_timeout_ms: u64,

    /// Analytics export
    pub export: ExportConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database_path: PathBuf::from("./lca_data.sqlite"),
            default_life_expectancy_years: DEFAULT_LIFE_EXPECTANCY_YEARS,
            result_policy: ResultPolicy::default(),
            worker_threads: 4,
            retry: RetryPolicy::default(),
            collaborator_timeout_ms: 30_000,
            busy_timeout_ms: 5_000,
            export: ExportConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration for a database at `path`, defaults otherwise
    pub fn with_database(path: impl Into<PathBuf>) -> Self {
        EngineConfig {
            database_path: path.into(),
            ..EngineConfig::default()
        }
    }

    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> EngineResult<Self> {
        let config: EngineConfig = toml::from_str(contents).map_err(|e| EngineError::SerializationError {
            reason: format!("Invalid configuration TOML: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let contents = file_io::read_to_string(path)?;
        let mut config: EngineConfig = toml::from_str(&contents).map_err(|e| EngineError::SerializationError {
            reason: format!("Invalid configuration TOML in {}: {}", path.display(), e),
        })?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> EngineResult<Self> {
        let mut config = EngineConfig::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment variables.
    ///
    /// Environment variables:
    /// - LCA_ENGINE_DB_PATH: SQLite database file
    /// - LCA_ENGINE_DEFAULT_LIFE_EXPECTANCY: fallback life span (years)
    /// - LCA_ENGINE_RESULT_POLICY: append_with_run | replace_project
    /// - LCA_ENGINE_WORKERS: calculation threads per batch
    /// - LCA_ENGINE_RETRY_MAX_ATTEMPTS: collaborator attempts
    /// - LCA_ENGINE_COLLABORATOR_TIMEOUT_MS: collaborator timeout
    /// - LCA_ENGINE_EXPORT_DIR: export root directory
    /// - LCA_ENGINE_EXPORT_BUCKET: export bucket name
    pub fn apply_env(&mut self) -> EngineResult<()> {
        if let Ok(path) = env::var("LCA_ENGINE_DB_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(years) = parse_env::<u32>("LCA_ENGINE_DEFAULT_LIFE_EXPECTANCY")? {
            self.default_life_expectancy_years = years;
        }
        if let Ok(policy) = env::var("LCA_ENGINE_RESULT_POLICY") {
            self.result_policy = ResultPolicy::parse(&policy)
                .ok_or_else(|| EngineError::config("LCA_ENGINE_RESULT_POLICY", format!("unknown policy '{}'", policy)))?;
        }
        if let Some(workers) = parse_env::<usize>("LCA_ENGINE_WORKERS")? {
            self.worker_threads = workers;
        }
        if let Some(attempts) = parse_env::<u32>("LCA_ENGINE_RETRY_MAX_ATTEMPTS")? {
            self.retry.max_attempts = attempts;
        }
        if let Some(timeout) = parse_env::<u64>("LCA_ENGINE_COLLABORATOR_TIMEOUT_MS")? {
            self.collaborator_timeout_ms = timeout;
        }
        if let Ok(dir) = env::var("LCA_ENGINE_EXPORT_DIR") {
            self.export.root_dir = PathBuf::from(dir);
        }
        if let Ok(bucket) = env::var("LCA_ENGINE_EXPORT_BUCKET") {
            self.export.bucket = bucket;
        }
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.default_life_expectancy_years == 0 {
            return Err(EngineError::config(
                "default_life_expectancy_years",
                "must be positive",
            ));
        }
        if self.worker_threads == 0 {
            return Err(EngineError::config("worker_threads", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::config("retry.max_attempts", "must be at least 1"));
        }
        if self.export.bucket.trim().is_empty() {
            return Err(EngineError::config("export.bucket", "must not be empty"));
        }
        Ok(())
    }

    /// Collaborator timeout as a Duration
    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> EngineResult<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| EngineError::config(key, format!("cannot parse '{}'", raw))),
        Err(_) => Ok(None),
    }
}
