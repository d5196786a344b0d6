use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::{PipelineSettings, RetryPolicy};
use crate::runner::{HostPathMap, RunnerSettings};

const DEFAULT_CONFIG_FILE: &str = ".pr-pipeline.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value {value:?} for {name}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Top-level configuration loaded from .pr-pipeline.toml.
///
/// Every section is optional; the tool runs with zero config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub workspace: WorkspaceConfig,
    pub pipeline: PipelineConfig,
    pub retry: RetryConfig,
    pub runner: RunnerConfig,
    pub github: GitHubConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Where run directories are created
    pub root: PathBuf,
    /// The same directory as seen by the container engine's host. Required
    /// for test runs; equal to `root` when this process runs on that host.
    pub host_root: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/workspace/jobs"),
            host_root: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_concurrent_runs: usize,
    pub max_concurrent_tests: usize,
    pub stage_timeout_secs: u64,
    pub max_branch_suffix: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
            max_concurrent_tests: 2,
            stage_timeout_secs: 300,
            max_branch_suffix: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub pull_image: bool,
    /// Docker network for test containers
    pub network: Option<String>,
    pub max_log_bytes: usize,
    pub docker_bin: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            pull_image: true,
            network: None,
            max_log_bytes: 20_000,
            docker_bin: "docker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// GitHub API token. If None, falls back to GITHUB_TOKEN env var.
    pub token: Option<String>,
    pub api_base: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: "https://api.github.com".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from .pr-pipeline.toml in the
    /// current directory. A missing default file yields the defaults; an
    /// explicitly named file must exist. Environment overrides apply last.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::load_from(default)?
                } else {
                    Config::default()
                }
            }
        };

        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load from a specific path, without environment overrides.
    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(root) = lookup("WORKSPACE_DIR") {
            self.workspace.root = PathBuf::from(root);
        }
        if let Some(host_root) = lookup("HOST_WORKSPACE_DIR") {
            self.workspace.host_root = Some(PathBuf::from(host_root));
        }
        if let Some(value) = lookup("MAX_CONCURRENT_RUNS") {
            self.pipeline.max_concurrent_runs = parse_env("MAX_CONCURRENT_RUNS", value)?;
        }
        if let Some(value) = lookup("MAX_CONCURRENT_TESTS") {
            self.pipeline.max_concurrent_tests = parse_env("MAX_CONCURRENT_TESTS", value)?;
        }
        if let Some(value) = lookup("RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("RETRY_MAX_ATTEMPTS", value)?;
        }
        if let Some(value) = lookup("RUNNER_IMAGE_PULL") {
            self.runner.pull_image = value != "0";
        }
        if let Some(network) = lookup("RUNNER_DOCKER_NETWORK") {
            self.runner.network = Some(network).filter(|n| !n.is_empty());
        }
        if self.github.token.is_none() {
            self.github.token = lookup("GITHUB_TOKEN").filter(|t| !t.is_empty());
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            max_concurrent_runs: self.pipeline.max_concurrent_runs,
            max_concurrent_tests: self.pipeline.max_concurrent_tests,
            stage_timeout: Duration::from_secs(self.pipeline.stage_timeout_secs),
            max_branch_suffix: self.pipeline.max_branch_suffix,
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
                multiplier: self.retry.multiplier,
            },
        }
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            pull_image: self.runner.pull_image,
            network: self.runner.network.clone(),
            max_log_bytes: self.runner.max_log_bytes,
            path_map: HostPathMap {
                container_base: self.workspace.root.clone(),
                host_base: self.workspace.host_root.clone(),
            },
            ..RunnerSettings::default()
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { name, value })
}
