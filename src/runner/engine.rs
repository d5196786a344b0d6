use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::RunnerError;

/// Label put on every container the runner creates; the value is the run id.
pub const RUN_LABEL: &str = "pr-pipeline.run";

/// Everything needed to create one build container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Unique per invocation; also the handle used for every later call
    pub name: String,
    pub image: String,
    /// Shell command, run as `sh -c <command>`
    pub command: String,
    /// Mount point (and working directory) inside the container
    pub workdir: String,
    /// Host directory bind-mounted read-write at `workdir`
    pub mount_source: PathBuf,
    pub env: BTreeMap<String, String>,
    pub cpu_shares: Option<u32>,
    pub mem_limit: Option<String>,
    pub network: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// Container lifecycle operations the runner needs.
///
/// Containers are addressed by the name chosen in [`ContainerSpec`], so a
/// container can be removed even when `create` failed halfway.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn pull(&self, image: &str) -> Result<(), RunnerError>;

    async fn create(&self, spec: &ContainerSpec) -> Result<(), RunnerError>;

    async fn start(&self, name: &str) -> Result<(), RunnerError>;

    /// Block until the container exits and return its exit code.
    async fn wait(&self, name: &str) -> Result<i64, RunnerError>;

    async fn kill(&self, name: &str) -> Result<(), RunnerError>;

    /// Combined stdout and stderr of the container.
    async fn logs(&self, name: &str) -> Result<String, RunnerError>;

    /// Force-remove the container and its anonymous volumes.
    /// Removing a container that does not exist is not an error.
    async fn remove(&self, name: &str) -> Result<(), RunnerError>;

    /// Remove every container carrying `label`; returns how many were found.
    async fn sweep(&self, label: &str) -> Result<usize, RunnerError>;
}
