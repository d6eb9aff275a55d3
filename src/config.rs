//! Configuration loading.
//!
//! Settings are merged from, in increasing precedence:
//! - Default values
//! - System configuration (`/etc/converge/converge.toml`)
//! - User configuration (`<config dir>/converge/converge.toml`)
//! - Project configuration (`./converge.{toml,yml,yaml,json}`)
//! - The file named by `CONVERGE_CONFIG`
//! - `CONVERGE_*` environment variables
//!
//! An explicit path passed to [`Config::load`] replaces the file search.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::executor::runner::{RunnerConfig, DEFAULT_FORKS};
use crate::tags::parse_tag_list;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Execution defaults
    pub defaults: Defaults,

    /// Tag selection
    pub tags: TagConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Default execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Number of units dispatched at once
    pub forks: usize,

    /// Dry-run mode
    pub check_mode: bool,

    /// Report diffs
    pub diff_mode: bool,

    /// Per module call timeout in seconds (0 disables)
    pub task_timeout: u64,

    /// Undefined variables in conditions are errors
    pub strict_conditions: bool,

    /// Verbosity handed to modules
    pub verbosity: u8,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            forks: DEFAULT_FORKS,
            check_mode: false,
            diff_mode: false,
            task_timeout: 0,
            strict_conditions: false,
            verbosity: 0,
        }
    }
}

/// Tag selection settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagConfig {
    /// Only run tasks with these tags
    pub tags: Vec<String>,

    /// Skip tasks with these tags
    pub skip_tags: Vec<String>,
}

/// Output format of log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human oriented
    Pretty,
    /// Single line per event
    #[default]
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or full `EnvFilter` directive
    pub level: String,

    /// Line format
    pub format: LogFormat,

    /// Include timestamps
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Compact,
            timestamps: true,
        }
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(path) = config_path {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            config = config.merge_from_file(path)?;
        } else {
            for path in Self::get_config_paths() {
                if path.exists() {
                    config = config.merge_from_file(&path)?;
                }
            }
        }

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load from a single file, without environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Config::default().merge_from_file(path.as_ref())
    }

    /// Candidate configuration files, lowest precedence first
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/converge/converge.toml")];

        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("converge").join("converge.toml"));
        }

        for name in ["converge.toml", "converge.yml", "converge.yaml", "converge.json"] {
            paths.push(PathBuf::from(name));
        }

        if let Ok(env_config) = std::env::var("CONVERGE_CONFIG") {
            paths.push(PathBuf::from(env_config));
        }

        paths
    }

    /// Merge the settings present in a file over this configuration
    fn merge_from_file(&self, path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let overlay: JsonValue = match extension {
            "yml" | "yaml" => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
            "json" => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
            _ => toml::from_str::<JsonValue>(&content)
                .or_else(|_| serde_yaml::from_str(&content))
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
        };

        self.merge(overlay)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Merge a partial configuration; keys present in `overlay` win
    fn merge(&self, overlay: JsonValue) -> Result<Config> {
        let mut base = serde_json::to_value(self)?;
        deep_merge(&mut base, overlay);
        Ok(serde_json::from_value(base)?)
    }

    /// Apply `CONVERGE_*` environment variables
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(forks) = std::env::var("CONVERGE_FORKS") {
            self.defaults.forks = forks
                .trim()
                .parse()
                .with_context(|| format!("Invalid CONVERGE_FORKS value: {}", forks))?;
        }

        if let Ok(timeout) = std::env::var("CONVERGE_TIMEOUT") {
            self.defaults.task_timeout = timeout
                .trim()
                .parse()
                .with_context(|| format!("Invalid CONVERGE_TIMEOUT value: {}", timeout))?;
        }

        if let Ok(check) = std::env::var("CONVERGE_CHECK") {
            self.defaults.check_mode = parse_flag(&check);
        }

        if let Ok(diff) = std::env::var("CONVERGE_DIFF") {
            self.defaults.diff_mode = parse_flag(&diff);
        }

        if let Ok(tags) = std::env::var("CONVERGE_TAGS") {
            self.tags.tags = parse_tag_list([tags]);
        }

        if let Ok(tags) = std::env::var("CONVERGE_SKIP_TAGS") {
            self.tags.skip_tags = parse_tag_list([tags]);
        }

        if let Ok(level) = std::env::var("CONVERGE_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Runner settings derived from this configuration
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            forks: self.defaults.forks.max(1),
            check_mode: self.defaults.check_mode,
            diff_mode: self.defaults.diff_mode,
            tags: self.tags.tags.clone(),
            skip_tags: self.tags.skip_tags.clone(),
            strict_conditions: self.defaults.strict_conditions,
            verbosity: self.defaults.verbosity,
            task_timeout: (self.defaults.task_timeout > 0)
                .then(|| Duration::from_secs(self.defaults.task_timeout)),
        }
    }
}

fn deep_merge(base: &mut JsonValue, overlay: JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base), JsonValue::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
