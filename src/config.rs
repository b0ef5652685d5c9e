//! Configuration for the warden operator.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (WARDEN_CONFIG, WARDEN_HOME)
//! 2. Config file (.warden/config.yaml)
//! 3. Defaults (~/.warden)
//!
//! Config file discovery:
//! - `$WARDEN_CONFIG` when set
//! - Otherwise searches current directory and parents for .warden/config.yaml
//! - Paths in config file are relative to the config file's directory

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::retry::RetryPolicy;
use crate::domain::{Platform, SidecarKind};

/// Topic the operator subscribes to by default
pub const DEFAULT_TOPIC: &str = "state-change";

/// Configuration errors (fatal at construction)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid port range: {min} > {max}")]
    PortRange { min: u16, max: u16 },

    #[error("Retry policy needs at least one attempt")]
    NoAttempts,

    #[error("Restart budget must allow at least one restart per window")]
    NoRestartBudget,

    #[error("Operator must subscribe to at least one topic")]
    NoTopics,

    #[error("Path '{0}' must not be empty")]
    EmptyPath(&'static str),
}

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    /// Root for installed programs
    pub install_path: Option<String>,
    /// Reattach state file
    pub reattach_path: Option<String>,
    /// Directory for generated program config files
    pub config_dir: Option<String>,
    #[serde(default)]
    pub download: DownloadSection,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub process: Option<ProcessSettings>,
    #[serde(default)]
    pub restart: Option<RestartSettings>,
    #[serde(default)]
    pub monitoring: Option<MonitoringSettings>,
    #[serde(default)]
    pub topics: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadSection {
    /// Where fetched artifacts land
    pub target_directory: Option<String>,
    /// Local artifact repository
    pub source_uri: Option<String>,
    /// Platform override (defaults to the running host)
    pub os: Option<String>,
    pub arch: Option<String>,
}

/// Artifact retrieval settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    pub target_directory: PathBuf,
    pub source_uri: PathBuf,
    pub platform: Platform,
}

impl DownloadConfig {
    /// Where the artifact for a binary/version is (or will be) downloaded
    pub fn artifact_path(&self, binary_name: &str, version: &str) -> PathBuf {
        self.target_directory
            .join(self.platform.artifact_name(binary_name, version))
    }
}

/// Child process settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSettings {
    /// Lowest port handed out as a process address
    #[serde(default = "default_min_port")]
    pub min_port: u16,

    /// Highest port handed out as a process address
    #[serde(default = "default_max_port")]
    pub max_port: u16,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
}

fn default_min_port() -> u16 {
    10000
}
fn default_max_port() -> u16 {
    30000
}
fn default_stop_timeout() -> u64 {
    5000
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            min_port: default_min_port(),
            max_port: default_max_port(),
            stop_timeout_ms: default_stop_timeout(),
        }
    }
}

/// Crash-restart throttling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartSettings {
    /// Restarts allowed per window
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Window length in seconds
    #[serde(default = "default_restart_window")]
    pub window_seconds: u64,
}

fn default_max_restarts() -> u32 {
    5
}
fn default_restart_window() -> u64 {
    60
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            window_seconds: default_restart_window(),
        }
    }
}

/// Monitoring sidecars attached to managed programs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringSettings {
    /// Whether sidecars are started at all
    #[serde(default)]
    pub enabled: bool,

    /// Collect logs (filebeat sidecar)
    #[serde(default = "default_true")]
    pub logs: bool,

    /// Collect metrics (metricbeat sidecar)
    #[serde(default = "default_true")]
    pub metrics: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            logs: true,
            metrics: true,
        }
    }
}

impl MonitoringSettings {
    /// Whether the sidecar of `kind` should run
    pub fn watches(&self, kind: SidecarKind) -> bool {
        match kind {
            SidecarKind::Logs => self.logs,
            SidecarKind::Metrics => self.metrics,
        }
    }
}

/// Resolved operator configuration with absolute paths
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// Root for installed programs
    pub install_path: PathBuf,
    pub download: DownloadConfig,
    /// Reattach state file
    pub reattach_path: PathBuf,
    /// Generated config files for file-configured programs
    pub config_dir: PathBuf,
    pub retry: RetryPolicy,
    pub process: ProcessSettings,
    pub restart: RestartSettings,
    pub monitoring: MonitoringSettings,
    /// Topics the operator handles
    pub topics: Vec<String>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl OperatorConfig {
    /// Defaults rooted at `home`
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();

        Self {
            install_path: home.join("install"),
            download: DownloadConfig {
                target_directory: home.join("downloads"),
                source_uri: home.join("artifacts"),
                platform: Platform::current(),
            },
            reattach_path: home.join("reattach.json"),
            config_dir: home.join("run"),
            retry: RetryPolicy::default(),
            process: ProcessSettings::default(),
            restart: RestartSettings::default(),
            monitoring: MonitoringSettings::default(),
            topics: vec![DEFAULT_TOPIC.to_string()],
            config_file: None,
            home,
        }
    }

    /// Reject configurations the operator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.install_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath("install_path"));
        }
        if self.reattach_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath("reattach_path"));
        }
        if self.process.min_port > self.process.max_port {
            return Err(ConfigError::PortRange {
                min: self.process.min_port,
                max: self.process.max_port,
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if self.restart.max_restarts == 0 || self.restart.window_seconds == 0 {
            return Err(ConfigError::NoRestartBudget);
        }
        if self.topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }
        Ok(())
    }
}

/// Default home directory (`$WARDEN_HOME` or ~/.warden)
pub fn default_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("WARDEN_HOME") {
        return Ok(PathBuf::from(home));
    }
    Ok(dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".warden"))
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("WARDEN_CONFIG") {
        return Some(PathBuf::from(path));
    }

    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".warden").join("config.yaml");
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

    parse_config_file(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn parse_config_file(content: &str) -> Result<ConfigFile> {
    if content.trim().is_empty() {
        return Ok(ConfigFile::default());
    }
    Ok(serde_yaml::from_str(content)?)
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Apply a parsed config file on top of defaults rooted at `home`
fn apply_config_file(home: PathBuf, file: ConfigFile, base: &Path) -> OperatorConfig {
    let mut config = OperatorConfig::with_home(home);

    if let Some(ref p) = file.install_path {
        config.install_path = resolve_path(base, p);
    }
    if let Some(ref p) = file.reattach_path {
        config.reattach_path = resolve_path(base, p);
    }
    if let Some(ref p) = file.config_dir {
        config.config_dir = resolve_path(base, p);
    }
    if let Some(ref p) = file.download.target_directory {
        config.download.target_directory = resolve_path(base, p);
    }
    if let Some(ref p) = file.download.source_uri {
        config.download.source_uri = resolve_path(base, p);
    }
    if let Some(os) = file.download.os {
        config.download.platform.os = os;
    }
    if let Some(arch) = file.download.arch {
        config.download.platform.arch = arch;
    }
    if let Some(retry) = file.retry {
        config.retry = retry;
    }
    if let Some(process) = file.process {
        config.process = process;
    }
    if let Some(restart) = file.restart {
        config.restart = restart;
    }
    if let Some(monitoring) = file.monitoring {
        config.monitoring = monitoring;
    }
    if let Some(topics) = file.topics {
        config.topics = topics;
    }

    config
}

/// Load configuration from a specific file
pub fn load_config_from(path: &Path) -> Result<OperatorConfig> {
    let file = load_config_file(path)?;
    let base = path.parent().unwrap_or(Path::new("."));

    let mut config = apply_config_file(default_home()?, file, base);
    config.config_file = Some(path.to_path_buf());
    config.validate()?;
    Ok(config)
}

/// Load configuration from all sources
pub fn load_config() -> Result<OperatorConfig> {
    match find_config_file() {
        Some(path) => load_config_from(&path),
        None => {
            let config = OperatorConfig::with_home(default_home()?);
            config.validate()?;
            Ok(config)
        }
    }
}
