//! Docker CLI implementation of [`ContainerEngine`].

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use super::engine::{ContainerEngine, ContainerSpec};
use super::RunnerError;

/// Drives the host Docker daemon through the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn docker(&self, args: &[String]) -> Result<Output, RunnerError> {
        debug!(args = ?args, "docker");
        Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RunnerError::EngineUnavailable(format!("cannot run {}: {e}", self.bin)))
    }

    /// Run a docker subcommand and fail with a classified error on a
    /// non-zero exit.
    async fn checked(&self, args: &[String]) -> Result<Output, RunnerError> {
        let output = self.docker(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(classify(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    #[instrument(skip(self))]
    async fn pull(&self, image: &str) -> Result<(), RunnerError> {
        let output = self.docker(&args(["pull", image])).await?;
        if output.status.success() {
            return Ok(());
        }
        match classify(&String::from_utf8_lossy(&output.stderr)) {
            RunnerError::Engine(reason) | RunnerError::ImagePull { reason, .. } => {
                Err(RunnerError::ImagePull {
                    image: image.to_string(),
                    reason,
                })
            }
            other => Err(other),
        }
    }

    #[instrument(skip(self, spec), fields(container = %spec.name, image = %spec.image))]
    async fn create(&self, spec: &ContainerSpec) -> Result<(), RunnerError> {
        match self.checked(&create_args(spec)).await {
            Ok(_) => Ok(()),
            Err(RunnerError::ImagePull { reason, .. }) => Err(RunnerError::ImagePull {
                image: spec.image.clone(),
                reason,
            }),
            Err(e) => Err(e),
        }
    }

    async fn start(&self, name: &str) -> Result<(), RunnerError> {
        self.checked(&args(["start", name])).await.map(|_| ())
    }

    async fn wait(&self, name: &str) -> Result<i64, RunnerError> {
        let output = self.checked(&args(["wait", name])).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<i64>()
            .map_err(|_| RunnerError::Engine(format!("unexpected `docker wait` output: {stdout}")))
    }

    async fn kill(&self, name: &str) -> Result<(), RunnerError> {
        let output = self.docker(&args(["kill", name])).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("is not running") {
            Ok(())
        } else {
            Err(classify(&stderr))
        }
    }

    /// Pump stdout and stderr of `docker logs` into one buffer, line by
    /// line in arrival order.
    async fn logs(&self, name: &str) -> Result<String, RunnerError> {
        let mut child = Command::new(&self.bin)
            .args(["logs", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::EngineUnavailable(format!("cannot run {}: {e}", self.bin)))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let pumps: Vec<_> = [
            child.stdout.take().map(|s| pump_lines(s, tx.clone())),
            child.stderr.take().map(|s| pump_lines(s, tx.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();
        drop(tx);

        let mut combined = String::new();
        while let Some(line) = rx.recv().await {
            combined.push_str(&line);
            combined.push('\n');
        }
        for pump in pumps {
            let _ = pump.await;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| RunnerError::Engine(format!("docker logs: {e}")))?;
        if !status.success() && combined.is_empty() {
            return Err(RunnerError::Engine(format!("docker logs {name} exited with {status}")));
        }
        Ok(combined)
    }

    async fn remove(&self, name: &str) -> Result<(), RunnerError> {
        let output = self.docker(&args(["rm", "-f", "-v", name])).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("No such container") {
            debug!(container = %name, "container removed");
            Ok(())
        } else {
            Err(classify(&stderr))
        }
    }

    #[instrument(skip(self))]
    async fn sweep(&self, label: &str) -> Result<usize, RunnerError> {
        let filter = format!("label={label}");
        let output = self.checked(&args(["ps", "-aq", "--filter", filter.as_str()])).await?;
        let ids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let mut rm = args(["rm", "-f", "-v"]);
        rm.extend(ids.iter().cloned());
        self.checked(&rm).await?;
        Ok(ids.len())
    }
}

fn pump_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    })
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Arguments for `docker create`, in a stable order.
fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut out = args(["create", "--name", spec.name.as_str()]);
    for (key, value) in &spec.labels {
        out.push("--label".to_string());
        out.push(format!("{key}={value}"));
    }
    out.push("--workdir".to_string());
    out.push(spec.workdir.clone());
    out.push("--volume".to_string());
    out.push(format!("{}:{}:rw", spec.mount_source.display(), spec.workdir));
    for (key, value) in &spec.env {
        out.push("--env".to_string());
        out.push(format!("{key}={value}"));
    }
    if let Some(shares) = spec.cpu_shares {
        out.push("--cpu-shares".to_string());
        out.push(shares.to_string());
    }
    if let Some(limit) = &spec.mem_limit {
        out.push("--memory".to_string());
        out.push(limit.clone());
    }
    if let Some(network) = &spec.network {
        out.push("--network".to_string());
        out.push(network.clone());
    }
    out.push(spec.image.clone());
    out.push("sh".to_string());
    out.push("-c".to_string());
    out.push(spec.command.clone());
    out
}

/// Map docker CLI stderr onto the runner error taxonomy.
fn classify(stderr: &str) -> RunnerError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("error during connect")
        || lower.contains("is the docker daemon running")
    {
        RunnerError::EngineUnavailable(message)
    } else if lower.contains("pull access denied")
        || lower.contains("manifest unknown")
        || lower.contains("no such image")
        || lower.contains("repository does not exist")
    {
        RunnerError::ImagePull {
            image: String::new(),
            reason: message,
        }
    } else {
        RunnerError::Engine(message)
    }
}

/// Rewrites workspace paths for bind mounts when the pipeline itself runs
/// in a container: anything under `container_base` is mapped onto
/// `host_base`. Paths outside `container_base` are already host paths.
///
/// A path under `container_base` with no `host_base` is a
/// [`RunnerError::Mount`]: the engine would mount the wrong directory.
/// Running directly on the engine's host means setting `host_base` to the
/// same directory.
#[derive(Debug, Clone, Default)]
pub struct HostPathMap {
    pub container_base: PathBuf,
    pub host_base: Option<PathBuf>,
}

impl HostPathMap {
    pub fn to_host(&self, path: &Path) -> Result<PathBuf, RunnerError> {
        if !path.is_absolute() {
            return Err(RunnerError::Mount(format!(
                "bind mount source must be absolute: {}",
                path.display()
            )));
        }
        if self.container_base.as_os_str().is_empty() {
            return Ok(path.to_path_buf());
        }
        let Ok(suffix) = path.strip_prefix(&self.container_base) else {
            return Ok(path.to_path_buf());
        };
        let Some(host_base) = &self.host_base else {
            return Err(RunnerError::Mount(format!(
                "{} is under the workspace root {} but no host workspace root is configured \
                 (set HOST_WORKSPACE_DIR)",
                path.display(),
                self.container_base.display()
            )));
        };
        if suffix.as_os_str().is_empty() {
            Ok(host_base.clone())
        } else {
            Ok(host_base.join(suffix))
        }
    }
}
