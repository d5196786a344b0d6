mod apply;
mod clients;
mod config;
mod pipeline;
mod plan;
mod report;
mod requirement;
mod runner;
#[cfg(test)]
mod testing;
mod validation;
mod workspace;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

use clients::{CodeHost, GitCli, GitHubClient, Planner, ReplayPlanner, VersionControl};
use pipeline::{Collaborators, Orchestrator};
use report::RejectedRun;
use runner::{ContainerEngine, DockerCli, ExecutionRunner, RUN_LABEL};
use workspace::WorkspaceManager;

/// PR Pipeline: turns structured requirements into tested pull requests.
///
/// Each requirement is cloned, planned, edited, pushed to a feature branch,
/// tested in a throwaway container and, when the tests pass, published as
/// a pull request.
#[derive(Parser, Debug)]
#[command(name = "pr-pipeline", version, about)]
struct Cli {
    /// Requirement files (JSON)
    #[arg(required = true)]
    requirements: Vec<PathBuf>,

    /// Recorded planning-service output: {"<id>": {"plan": ..., "edits": ...}}
    #[arg(long)]
    plans: PathBuf,

    /// Config file (defaults to .pr-pipeline.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the report to this file (markdown, or JSON with --json)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Emit the report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let _main_span = info_span!("pr_pipeline", requirements = cli.requirements.len()).entered();

    info!("loading configuration");
    let config = config::Config::load(cli.config.as_deref())?;

    if config.workspace.host_root.is_none() {
        warn!(
            root = %config.workspace.root.display(),
            "no host workspace root configured (HOST_WORKSPACE_DIR); test runs cannot mount workspaces"
        );
    }

    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerCli::new(config.runner.docker_bin.clone()));
    match engine.sweep(RUN_LABEL).await {
        Ok(0) => {}
        Ok(removed) => warn!(removed, "removed containers left over from earlier runs"),
        Err(e) => warn!(error = %e, "could not sweep leftover containers"),
    }

    let vcs: Arc<dyn VersionControl> = Arc::new(GitCli::new(config.github.token.clone()));
    let planner: Arc<dyn Planner> = Arc::new(ReplayPlanner::load_from(&cli.plans)?);
    let host: Option<Arc<dyn CodeHost>> = match &config.github.token {
        Some(token) => Some(Arc::new(GitHubClient::new(&config.github.api_base, token.clone()))),
        None => {
            warn!("no GitHub token configured; pull requests will not be opened");
            None
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(
        Collaborators { vcs, planner, host },
        ExecutionRunner::new(engine, config.runner_settings()),
        WorkspaceManager::new(config.workspace.root.clone()),
        config.pipeline_settings(),
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling all runs");
                cancel.cancel();
            }
        });
    }

    // Stay under the orchestrator's admission limit instead of being refused.
    let slots = Arc::new(Semaphore::new(config.pipeline.max_concurrent_runs.max(1)));
    let mut results = Vec::new();
    let mut rejected = Vec::new();
    let mut handles = Vec::new();

    for path in &cli.requirements {
        let source = path.display().to_string();
        let requirement = match requirement::load_from(path) {
            Ok(requirement) => requirement,
            Err(e) => {
                error!(source = %source, error = %e, "cannot load requirement");
                rejected.push(RejectedRun {
                    source,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let slot = Arc::clone(&slots).acquire_owned().await?;
        let orchestrator = Arc::clone(&orchestrator);
        let cancel = cancel.child_token();
        handles.push((
            source,
            tokio::spawn(async move {
                let result = orchestrator.run(requirement, cancel).await;
                drop(slot);
                result
            }),
        ));
    }

    for (source, handle) in handles {
        match handle.await {
            Ok(Ok(result)) => {
                info!(requirement = %result.requirement_id(), status = %result.status(), "run finished");
                results.push(result);
            }
            Ok(Err(e)) => rejected.push(RejectedRun {
                source,
                reason: e.to_string(),
            }),
            Err(e) => rejected.push(RejectedRun {
                source,
                reason: format!("run task failed: {e}"),
            }),
        }
    }

    let built_report = report::build(results, rejected);
    report::output(&built_report, cli.output.as_deref(), cli.json)?;
    info!(overall = %built_report.overall, "done");

    if built_report.overall != report::RunStatus::Ok {
        std::process::exit(1);
    }
    Ok(())
}
