pub mod docker;
pub mod engine;

pub use docker::{DockerCli, HostPathMap};
pub use engine::{ContainerEngine, ContainerSpec, RUN_LABEL};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::requirement::BuildSpec;

/// Infrastructure failures of the runner.
///
/// These are never test failures: a command that ran and exited non-zero
/// (or timed out) is a [`TestResult`] with `passed == false`.
#[derive(Debug, Clone, Error)]
pub enum RunnerError {
    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Cannot mount workspace: {0}")]
    Mount(String),

    #[error("Container engine error: {0}")]
    Engine(String),
}

impl RunnerError {
    /// Mount errors come from configuration and will not go away on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RunnerError::Mount(_))
    }
}

/// Outcome of one build/test command.
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    /// The only gate for publishing
    pub passed: bool,
    /// Combined stdout and stderr, bounded, with a marker on timeout
    pub logs: String,
    /// Measured from command start
    pub duration: Duration,
    /// `None` when the command was killed on timeout
    pub exit_code: Option<i64>,
    pub timed_out: bool,
}

/// Settings shared by every runner invocation.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub pull_image: bool,
    pub network: Option<String>,
    pub max_log_bytes: usize,
    pub path_map: HostPathMap,
    /// Bound on the kill and log calls that follow the wait
    pub engine_call_limit: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            pull_image: true,
            network: None,
            max_log_bytes: 20_000,
            path_map: HostPathMap::default(),
            engine_call_limit: Duration::from_secs(10),
        }
    }
}

pub const TRUNCATION_MARKER: &str = "[...truncated...]\n";

/// Runs a build command in a fresh container and always tears it down.
pub struct ExecutionRunner {
    engine: Arc<dyn ContainerEngine>,
    settings: RunnerSettings,
}

impl ExecutionRunner {
    pub fn new(engine: Arc<dyn ContainerEngine>, settings: RunnerSettings) -> Self {
        Self { engine, settings }
    }

    /// Run `spec.command` against `workspace` inside a new container.
    ///
    /// The container is removed on every exit path: completion, timeout,
    /// engine error, and cancellation (dropping this future).
    #[instrument(skip(self, spec, workspace), fields(image = %spec.container_image, run_id = %run_id))]
    pub async fn run(
        &self,
        spec: &BuildSpec,
        workspace: &Path,
        run_id: &str,
    ) -> Result<TestResult, RunnerError> {
        let mount_source = self.settings.path_map.to_host(workspace)?;

        if self.settings.pull_image {
            if let Err(e) = self.engine.pull(&spec.container_image).await {
                warn!(error = %e, "image pull failed, trying the local image");
            }
        }

        let container = ContainerSpec {
            name: container_name(run_id),
            image: spec.container_image.clone(),
            command: spec.command.clone(),
            workdir: spec.workdir.clone(),
            mount_source,
            env: spec.env.clone(),
            cpu_shares: spec.cpu_shares,
            mem_limit: spec.mem_limit.clone(),
            network: self.settings.network.clone(),
            labels: BTreeMap::from([(RUN_LABEL.to_string(), run_id.to_string())]),
        };

        let guard = ContainerGuard::new(Arc::clone(&self.engine), container.name.clone());
        let outcome = self.execute(&container, spec.timeout_seconds).await;
        guard.teardown().await;
        outcome
    }

    async fn execute(
        &self,
        container: &ContainerSpec,
        timeout_seconds: u64,
    ) -> Result<TestResult, RunnerError> {
        let name = container.name.as_str();
        let call_limit = self.settings.engine_call_limit;
        self.engine.create(container).await?;
        self.engine.start(name).await?;
        let started = Instant::now();
        debug!(container = %name, "container started");

        let limit = Duration::from_secs(timeout_seconds);
        let waited = tokio::time::timeout(limit, self.engine.wait(name)).await;
        let duration = started.elapsed();

        let exit_code = match waited {
            Ok(Ok(code)) => Some(code),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(container = %name, timeout_seconds, "build timed out, killing container");
                match tokio::time::timeout(call_limit, self.engine.kill(name)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(container = %name, error = %e, "failed to kill timed out container")
                    }
                    Err(_) => warn!(container = %name, "kill did not return in time"),
                }
                None
            }
        };

        let logs = match tokio::time::timeout(call_limit, self.engine.logs(name)).await {
            Ok(Ok(logs)) => bound_logs(logs, self.settings.max_log_bytes),
            Ok(Err(e)) => format!("[pr-pipeline] failed to collect container logs: {e}\n"),
            Err(_) => format!(
                "[pr-pipeline] container logs not returned within {}s\n",
                call_limit.as_secs()
            ),
        };

        let result = match exit_code {
            Some(code) => TestResult {
                passed: code == 0,
                logs,
                duration,
                exit_code: Some(code),
                timed_out: false,
            },
            None => TestResult {
                passed: false,
                logs: format!(
                    "{logs}\n[pr-pipeline] build timed out after {timeout_seconds}s; container killed\n"
                ),
                duration,
                exit_code: None,
                timed_out: true,
            },
        };

        info!(
            passed = result.passed,
            exit_code = ?result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            "build finished"
        );
        Ok(result)
    }
}

/// Fresh per invocation, so a retried run never reuses a container.
fn container_name(run_id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("pr-pipeline-{run_id}-{}", &suffix[..8])
}

/// Keep the tail of oversized logs: that is where failures are reported.
pub fn bound_logs(logs: String, max_bytes: usize) -> String {
    if logs.len() <= max_bytes {
        return logs;
    }
    let mut cut = logs.len() - max_bytes;
    while !logs.is_char_boundary(cut) {
        cut += 1;
    }
    format!("{TRUNCATION_MARKER}{}", &logs[cut..])
}

/// Removes a container when the run ends.
///
/// `teardown` is the normal path. If the owning future is dropped first
/// (cancellation, panic), `Drop` hands the removal to the runtime.
struct ContainerGuard {
    engine: Arc<dyn ContainerEngine>,
    name: Option<String>,
}

impl ContainerGuard {
    fn new(engine: Arc<dyn ContainerEngine>, name: String) -> Self {
        Self {
            engine,
            name: Some(name),
        }
    }

    async fn teardown(mut self) {
        if let Some(name) = self.name.take() {
            if let Err(e) = self.engine.remove(&name).await {
                warn!(container = %name, error = %e, "failed to remove container");
            }
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(name) = self.name.take() else {
            return;
        };
        let engine = Arc::clone(&self.engine);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(container = %name, "removing container of an abandoned run");
                handle.spawn(async move {
                    if let Err(e) = engine.remove(&name).await {
                        warn!(container = %name, error = %e, "failed to remove container");
                    }
                });
            }
            Err(_) => warn!(container = %name, "no runtime left to remove container"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, FakeRun};
    use std::path::PathBuf;

    fn build_spec(timeout_seconds: u64) -> BuildSpec {
        BuildSpec {
            command: "pytest -q".to_string(),
            container_image: "python:3.11".to_string(),
            workdir: "/workspace".to_string(),
            env: BTreeMap::from([("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string())]),
            timeout_seconds,
            cpu_shares: Some(256),
            mem_limit: Some("1g".to_string()),
        }
    }

    fn runner(engine: &Arc<FakeEngine>) -> ExecutionRunner {
        let engine: Arc<dyn ContainerEngine> = engine.clone();
        ExecutionRunner::new(engine, RunnerSettings::default())
    }

    fn workspace() -> PathBuf {
        PathBuf::from("/srv/jobs/r1/repo")
    }

    #[tokio::test]
    async fn test_exit_zero_passes() {
        let engine = Arc::new(FakeEngine::new(FakeRun::exit(0, "1 passed")));
        let result = runner(&engine).run(&build_spec(60), &workspace(), "r1").await.unwrap();

        assert!(result.passed);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.logs.contains("1 passed"));
        assert_eq!(engine.live_count(), 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_logs() {
        let engine = Arc::new(FakeEngine::new(FakeRun::exit(1, "E   assert 1 == 2")));
        let result = runner(&engine).run(&build_spec(60), &workspace(), "r1").await.unwrap();

        assert!(!result.passed);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, Some(1));
        assert!(result.logs.contains("assert 1 == 2"));
        assert_eq!(engine.live_count(), 0);
    }

    #[tokio::test]
    async fn test_spec_reaches_engine() {
        let engine = Arc::new(FakeEngine::new(FakeRun::exit(0, "")));
        runner(&engine).run(&build_spec(60), &workspace(), "r1").await.unwrap();

        let created = engine.created_specs();
        assert_eq!(created.len(), 1);
        let spec = &created[0];
        assert!(spec.name.starts_with("pr-pipeline-r1-"));
        assert_eq!(spec.mount_source, workspace());
        assert_eq!(spec.workdir, "/workspace");
        assert_eq!(spec.cpu_shares, Some(256));
        assert_eq!(spec.mem_limit.as_deref(), Some("1g"));
        assert_eq!(spec.env.get("PYTHONDONTWRITEBYTECODE").map(String::as_str), Some("1"));
        assert_eq!(spec.labels.get(RUN_LABEL).map(String::as_str), Some("r1"));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_tears_down() {
        let engine = Arc::new(FakeEngine::new(
            FakeRun::exit(0, "still sleeping").after(Duration::from_secs(30)),
        ));
        let started = Instant::now();
        let result = runner(&engine).run(&build_spec(1), &workspace(), "r1").await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!result.passed);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(result.logs.contains("timed out after 1s"));
        assert!(result.logs.contains("still sleeping"));
        assert_eq!(engine.kill_count(), 1);
        assert_eq!(engine.live_count(), 0);
    }

    #[tokio::test]
    async fn test_wedged_engine_after_timeout_does_not_hang() {
        let engine = Arc::new(FakeEngine::new(
            FakeRun::exit(0, "").after(Duration::from_secs(30)).wedged(),
        ));
        let engine_dyn: Arc<dyn ContainerEngine> = engine.clone();
        let runner = ExecutionRunner::new(
            engine_dyn,
            RunnerSettings {
                engine_call_limit: Duration::from_millis(200),
                ..RunnerSettings::default()
            },
        );

        let started = Instant::now();
        let result = runner.run(&build_spec(1), &workspace(), "r1").await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(result.timed_out);
        assert!(result.logs.contains("container logs not returned"));
        assert!(result.logs.contains("timed out after 1s"));
        assert_eq!(engine.kill_count(), 1);
        assert_eq!(engine.live_count(), 0);
    }

    #[tokio::test]
    async fn test_engine_error_is_runner_error_and_cleans_up() {
        let engine = Arc::new(FakeEngine::new(FakeRun::exit(0, "")));
        engine.fail_next_creates(1);
        let err = runner(&engine).run(&build_spec(60), &workspace(), "r1").await.unwrap_err();

        assert!(matches!(err, RunnerError::EngineUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(engine.live_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_error_still_tears_down() {
        let engine = Arc::new(FakeEngine::new(FakeRun::engine_error("daemon went away")));
        let err = runner(&engine).run(&build_spec(60), &workspace(), "r1").await.unwrap_err();

        assert!(matches!(err, RunnerError::Engine(_)));
        assert_eq!(engine.live_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_no_container() {
        let engine = Arc::new(FakeEngine::new(
            FakeRun::exit(0, "").after(Duration::from_secs(30)),
        ));
        let task_runner = runner(&engine);
        let handle = tokio::spawn(async move {
            task_runner.run(&build_spec(60), &workspace(), "r1").await
        });

        while engine.live_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        let _ = handle.await;
        for _ in 0..50 {
            if engine.live_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.live_count(), 0);
    }

    #[tokio::test]
    async fn test_no_orphans_after_many_runs() {
        let engine = Arc::new(FakeEngine::new(FakeRun::exit(0, "ok")));
        let runner = runner(&engine);
        engine.fail_next_creates(3);

        for i in 0..20 {
            let _ = runner.run(&build_spec(60), &workspace(), &format!("r{i}")).await;
        }
        assert_eq!(engine.created_specs().len(), 20);
        assert_eq!(engine.live_count(), 0);
    }

    #[tokio::test]
    async fn test_mount_error_not_retryable() {
        let engine = Arc::new(FakeEngine::new(FakeRun::exit(0, "")));
        let err = runner(&engine)
            .run(&build_spec(60), Path::new("relative/repo"), "r1")
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Mount(_)));
        assert!(!err.is_retryable());
        assert!(engine.created_specs().is_empty());
    }

    #[test]
    fn test_bound_logs_keeps_tail() {
        let logs = format!("{}FAILED test_x", "a".repeat(100));
        let bounded = bound_logs(logs, 20);
        assert!(bounded.starts_with(TRUNCATION_MARKER));
        assert!(bounded.ends_with("FAILED test_x"));
        assert_eq!(bounded.len(), TRUNCATION_MARKER.len() + 20);

        assert_eq!(bound_logs("short".to_string(), 20), "short");
    }

    #[test]
    fn test_bound_logs_respects_char_boundaries() {
        let bounded = bound_logs("ééééé".to_string(), 3);
        assert!(bounded.ends_with('é'));
    }
}
