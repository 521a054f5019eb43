//! Configuration for wodehouse.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (WODEHOUSE_HOME, WODEHOUSE_MODE)
//! 2. Config file (.wodehouse/config.yaml)
//! 3. Defaults (~/.wodehouse, poc mode)
//!
//! Config file discovery:
//! - Searches current directory and parents for .wodehouse/config.yaml
//! - `paths.home` in the config file is relative to the .wodehouse/ directory

pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::adapters::ScriptTable;
use crate::core::dispatch::RetryPolicy;
use crate::core::gate::GatePolicy;
use crate::core::resolver::ResolverSettings;
use crate::core::transport::TransportSettings;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

pub const HOME_ENV: &str = "WODEHOUSE_HOME";
pub const MODE_ENV: &str = "WODEHOUSE_MODE";

/// Invalid configuration values
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be within [0, 1], got {value}")]
    OutOfUnitRange { field: &'static str, value: f64 },

    #[error("{field} must be at least {min}, got {value}")]
    TooSmall { field: &'static str, min: u64, value: u64 },

    #[error("retry_backoff_multiplier must be at least 1.0, got {0}")]
    BadMultiplier(f64),

    #[error("Unknown mode {0:?} (expected poc or live)")]
    UnknownMode(String),

    #[error("Script for {action_type} has an empty command")]
    EmptyCommand { action_type: String },
}

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub resolver: ResolverSettings,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub scripts: ScriptTable,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to the .wodehouse/ directory)
    pub home: Option<String>,
}

/// Gate, retry and execution settings
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// mode, confidence_threshold, always_confirm_action_types
    #[serde(flatten)]
    pub gate: GatePolicy,

    #[serde(default = "default_script_timeout")]
    pub script_timeout_seconds: u64,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub retry_backoff_multiplier: f64,
}

fn default_script_timeout() -> u64 {
    30
}
fn default_max_retry_attempts() -> u32 {
    3
}
fn default_retry_initial_delay() -> u64 {
    500
}
fn default_retry_max_delay() -> u64 {
    10_000
}
fn default_retry_multiplier() -> f64 {
    2.0
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gate: GatePolicy::default(),
            script_timeout_seconds: default_script_timeout(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            retry_backoff_multiplier: default_retry_multiplier(),
        }
    }
}

impl PipelineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.retry_initial_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_seconds)
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to the state directory
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub pipeline: PipelineConfig,
    pub resolver: ResolverSettings,
    pub transport: TransportSettings,
    pub scripts: ScriptTable,
}

impl ResolvedConfig {
    /// Defaults rooted at the given home
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            config_file: None,
            pipeline: PipelineConfig::default(),
            resolver: ResolverSettings::default(),
            transport: TransportSettings::default(),
            scripts: ScriptTable::new(),
        }
    }

    /// The shared record log
    pub fn records_path(&self) -> PathBuf {
        self.home.join("records.jsonl")
    }

    /// Per-consumer offset files
    pub fn offsets_dir(&self) -> PathBuf {
        self.home.join("offsets")
    }

    /// Audit trail and daily logs
    pub fn audit_dir(&self) -> PathBuf {
        self.home.join("audit")
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        unit_range("confidence_threshold", self.pipeline.gate.confidence_threshold)?;
        unit_range("min_utterance_confidence", self.resolver.min_utterance_confidence)?;
        at_least("max_retry_attempts", 1, self.pipeline.max_retry_attempts as u64)?;
        at_least("script_timeout_seconds", 1, self.pipeline.script_timeout_seconds)?;

        if !(self.pipeline.retry_backoff_multiplier >= 1.0) {
            return Err(ConfigError::BadMultiplier(self.pipeline.retry_backoff_multiplier));
        }

        for (action_type, script) in &self.scripts {
            if script.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand {
                    action_type: action_type.clone(),
                });
            }
        }
        Ok(())
    }
}

fn unit_range(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfUnitRange { field, value })
    }
}

fn at_least(field: &'static str, min: u64, value: u64) -> Result<(), ConfigError> {
    if value >= min {
        Ok(())
    } else {
        Err(ConfigError::TooSmall { field, min, value })
    }
}

/// Environment overrides, captured once so resolution stays testable
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<String>,
    mode: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var(HOME_ENV).ok(),
            mode: std::env::var(MODE_ENV).ok(),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".wodehouse").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn resolve_config(config_file: Option<PathBuf>, env: &EnvOverrides) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".wodehouse");

    let mut resolved = ResolvedConfig::with_home(default_home);

    if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        if let Some(ref home_path) = config.paths.home {
            let config_dir = config_path.parent().unwrap_or(Path::new("."));
            resolved.home = resolve_path(config_dir, home_path);
        }
        resolved.pipeline = config.pipeline;
        resolved.resolver = config.resolver;
        resolved.transport = config.transport;
        resolved.scripts = config.scripts;
    }
    resolved.config_file = config_file;

    if let Some(home) = &env.home {
        resolved.home = PathBuf::from(home);
    }
    if let Some(mode) = &env.mode {
        resolved.pipeline.gate.mode = mode
            .parse()
            .map_err(|_| ConfigError::UnknownMode(mode.clone()))?;
    }

    resolved.validate()?;
    Ok(resolved)
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    resolve_config(find_config_file(), &EnvOverrides::from_env())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the wodehouse home directory
pub fn wodehouse_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}
