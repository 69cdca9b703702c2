//! Configuration for batchflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (BATCHFLOW_HOME, BATCHFLOW_MAX_RETRY_COUNT)
//! 2. Config file (.batchflow/config.yaml)
//! 3. Defaults (~/.batchflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .batchflow/config.yaml
//! - `paths.home` is relative to the .batchflow/ directory

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::classifier::ClassifierRules;
use crate::core::machine::DEFAULT_MAX_RETRY_COUNT;
use crate::domain::{JobParameters, NotificationSettings};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .batchflow/)
    pub home: Option<String>,
}

/// The batch job every run executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default = "default_job_name")]
    pub name: String,

    /// Program started for each attempt
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Exported to the job as environment variables
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    #[serde(default = "default_job_timeout")]
    pub timeout_seconds: u64,
}

fn default_job_name() -> String {
    "batch-job".to_string()
}
fn default_job_timeout() -> u64 {
    3_600
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            name: default_job_name(),
            command: None,
            args: Vec::new(),
            parameters: BTreeMap::new(),
            timeout_seconds: default_job_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    #[serde(default = "default_classifier_timeout")]
    pub classifier_timeout_seconds: u64,
}

fn default_max_retry_count() -> u32 {
    DEFAULT_MAX_RETRY_COUNT
}
fn default_classifier_timeout() -> u64 {
    30
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            classifier_timeout_seconds: default_classifier_timeout(),
        }
    }
}

/// Which classifier decides retries
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// External classifier program; the built-in rules are used when unset
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(flatten)]
    pub rules: ClassifierRules,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(flatten)]
    pub settings: NotificationSettings,

    /// Publish over HTTP instead of the file outbox
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Upper bound on one publish call
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_seconds: u64,
}

fn default_publish_timeout() -> u64 {
    10
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            settings: NotificationSettings::default(),
            webhook_url: None,
            publish_timeout_seconds: default_publish_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_schedule")]
    pub expression: String,
}

fn default_schedule() -> String {
    "rate(1 day)".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            expression: default_schedule(),
        }
    }
}

/// Values read from the environment
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<String>,
    max_retry_count: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var("BATCHFLOW_HOME").ok(),
            max_retry_count: std::env::var("BATCHFLOW_MAX_RETRY_COUNT").ok(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to batchflow home (run logs, outbox)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub job: JobConfig,
    pub retry: RetryConfig,
    pub classifier: ClassifierConfig,
    pub notification: NotificationConfig,
    pub schedule: ScheduleConfig,
}

impl ResolvedConfig {
    /// Directory holding per-run event logs ($BATCHFLOW_HOME/runs)
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// File outbox ($BATCHFLOW_HOME/outbox.jsonl)
    pub fn outbox_path(&self) -> PathBuf {
        self.home.join("outbox.jsonl")
    }

    /// Parameters handed to every attempt
    pub fn job_parameters(&self) -> JobParameters {
        JobParameters {
            job_name: self.job.name.clone(),
            values: self.job.parameters.clone(),
        }
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".batchflow").join("config.yaml");
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
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
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

fn resolve(
    config_file: Option<PathBuf>,
    file: ConfigFile,
    env: EnvOverrides,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let home = if let Some(env_home) = env.home {
        PathBuf::from(env_home)
    } else if let (Some(config_path), Some(home_path)) = (&config_file, &file.paths.home) {
        let batchflow_dir = config_path.parent().unwrap_or(Path::new("."));
        resolve_path(batchflow_dir, home_path)
    } else {
        default_home
    };

    let mut retry = file.retry;
    if let Some(raw) = env.max_retry_count {
        retry.max_retry_count = raw
            .trim()
            .parse()
            .with_context(|| format!("BATCHFLOW_MAX_RETRY_COUNT is not a valid count: '{}'", raw))?;
    }

    Ok(ResolvedConfig {
        home,
        config_file,
        job: file.job,
        retry,
        classifier: file.classifier,
        notification: file.notification,
        schedule: file.schedule,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".batchflow");

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let config_file = find_config_file(&cwd);

    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    resolve(config_file, file, EnvOverrides::from_env(), default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the batchflow home directory
pub fn batchflow_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($BATCHFLOW_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.runs_dir())
}
