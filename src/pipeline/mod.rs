//! The per-requirement orchestrator.
//!
//! One [`Orchestrator`] serves many concurrent runs. Each run owns its
//! [`RunContext`] and workspace; the orchestrator itself only holds shared,
//! read-only collaborators and the two admission semaphores.

pub mod retry;
pub mod stage;

pub use retry::RetryPolicy;
pub use stage::Stage;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::apply::{self, ApplyError};
use crate::clients::{BranchOutcome, CodeHost, Planner, PullRequestDraft, VersionControl};
use crate::plan::{self, inventory, ChangePlan};
use crate::report::types::ErrorKind;
use crate::report::{Outcome, RequirementResult, RunContext};
use crate::requirement::{self, Requirement};
use crate::runner::ExecutionRunner;
use crate::validation::ValidationError;
use crate::workspace::{Workspace, WorkspaceError, WorkspaceManager};
use retry::with_retry;

/// Why a run ended in `error`. Classified where the failure happens and
/// carried unchanged into the result.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("{0}")]
    Transient(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Fatal(String),

    #[error("run cancelled")]
    Cancelled,
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Transient(_) => ErrorKind::TransientExhausted,
            StageError::Validation(_) => ErrorKind::Validation,
            StageError::Fatal(_) => ErrorKind::Fatal,
            StageError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<ApplyError> for StageError {
    fn from(error: ApplyError) -> Self {
        match error {
            ApplyError::Validation(e) => StageError::Validation(e),
            other => StageError::Fatal(other.to_string()),
        }
    }
}

/// Failures that prevent a run from producing a result at all.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Too many concurrent runs (limit {limit}); try again later")]
    Saturated { limit: usize },

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_concurrent_runs: usize,
    /// Cap on simultaneously running test containers
    pub max_concurrent_tests: usize,
    /// Per-attempt bound on collaborator calls; tests use the build timeout
    pub stage_timeout: Duration,
    pub max_branch_suffix: u32,
    pub retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
            max_concurrent_tests: 2,
            stage_timeout: Duration::from_secs(300),
            max_branch_suffix: 10,
            retry: RetryPolicy::default(),
        }
    }
}

/// The external collaborators a run delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub vcs: Arc<dyn VersionControl>,
    pub planner: Arc<dyn Planner>,
    /// `None` when no code host credentials are configured
    pub host: Option<Arc<dyn CodeHost>>,
}

pub struct Orchestrator {
    collaborators: Collaborators,
    runner: ExecutionRunner,
    workspaces: WorkspaceManager,
    settings: PipelineSettings,
    runs: Arc<Semaphore>,
    tests: Semaphore,
}

impl Orchestrator {
    pub fn new(
        collaborators: Collaborators,
        runner: ExecutionRunner,
        workspaces: WorkspaceManager,
        settings: PipelineSettings,
    ) -> Self {
        let runs = Arc::new(Semaphore::new(settings.max_concurrent_runs.max(1)));
        let tests = Semaphore::new(settings.max_concurrent_tests.max(1));
        Self {
            collaborators,
            runner,
            workspaces,
            settings,
            runs,
            tests,
        }
    }

    /// Drive one requirement to a result.
    ///
    /// Business outcomes (test failure, invalid plan, exhausted retries,
    /// cancellation) are all `Ok` results. `Err` means the run was refused
    /// or could not get a workspace.
    pub async fn run(
        &self,
        requirement: Requirement,
        cancel: CancellationToken,
    ) -> Result<RequirementResult, PipelineError> {
        let _permit = Arc::clone(&self.runs)
            .try_acquire_owned()
            .map_err(|_| PipelineError::Saturated {
                limit: self.settings.max_concurrent_runs.max(1),
            })?;

        let ctx = RunContext::new(&requirement.id);
        let span = info_span!("run", requirement = %requirement.id, run_id = %ctx.run_id());
        self.run_in_context(&requirement, ctx, &cancel)
            .instrument(span)
            .await
    }

    async fn run_in_context(
        &self,
        requirement: &Requirement,
        mut ctx: RunContext,
        cancel: &CancellationToken,
    ) -> Result<RequirementResult, PipelineError> {
        if let Err(e) = requirement::validate(requirement) {
            return Ok(ctx.finish(Err(e.into())));
        }

        let mut workspace = self.workspaces.acquire(ctx.run_id()).await?;
        ctx.set_workspace(workspace.path().to_path_buf());
        ctx.advance(Stage::WorkspaceAcquired);
        ctx.info(format!("workspace {}", workspace.path().display()));

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(StageError::Cancelled),
            outcome = self.drive(requirement, &workspace, &mut ctx) => outcome,
        };

        self.workspaces.release(&mut workspace).await;
        Ok(ctx.finish(outcome))
    }

    async fn drive(
        &self,
        requirement: &Requirement,
        workspace: &Workspace,
        ctx: &mut RunContext,
    ) -> Result<Outcome, StageError> {
        let repo_dir = self.clone_repo(requirement, workspace, ctx).await?;
        let plan = self.plan(requirement, &repo_dir, ctx).await?;
        let edits = self.apply_edits(requirement, &plan, &repo_dir, ctx).await?;
        let branch = self.branch(requirement, &repo_dir, ctx).await?;
        self.push(requirement, &repo_dir, &branch, &edits, ctx).await?;

        if !self.test(requirement, &repo_dir, ctx).await? {
            ctx.advance(Stage::Failed);
            ctx.info(format!("branch {branch} retained for inspection"));
            return Ok(Outcome::TestsFailed);
        }

        let outcome = self.publish(requirement, &plan, &branch, ctx).await;
        ctx.advance(Stage::Published);
        Ok(outcome)
    }

    async fn clone_repo(
        &self,
        requirement: &Requirement,
        workspace: &Workspace,
        ctx: &mut RunContext,
    ) -> Result<PathBuf, StageError> {
        let vcs = &self.collaborators.vcs;
        let repo = &requirement.repo;
        let dest = workspace.repo_dir();
        let dest = dest.as_path();

        ctx.info(format!("cloning {} ({})", repo.url, repo.default_branch));
        let repo_dir = with_retry(
            &self.settings.retry,
            ctx,
            "clone",
            Some(self.settings.stage_timeout),
            || vcs.clone_repo(repo, dest),
        )
        .await?;
        ctx.advance(Stage::Cloned);
        Ok(repo_dir)
    }

    async fn plan(
        &self,
        requirement: &Requirement,
        repo_dir: &Path,
        ctx: &mut RunContext,
    ) -> Result<ChangePlan, StageError> {
        let root = repo_dir.to_path_buf();
        let inventory = tokio::task::spawn_blocking(move || {
            inventory::scan_repo(&root, inventory::MAX_INVENTORY_FILES)
        })
        .await
        .map_err(|e| StageError::Fatal(format!("inventory scan failed: {e}")))?;
        ctx.info(format!(
            "inventory: {} files{}",
            inventory.files.len(),
            if inventory.truncated { " (truncated)" } else { "" }
        ));
        debug!(files = %inventory.listing(), "repository inventory");

        match requirement.language {
            Some(language) => ctx.info(format!("requesting plan for a {language} project")),
            None => ctx.info("requesting plan"),
        }
        let planner = &self.collaborators.planner;
        let inventory = &inventory;
        let raw = with_retry(
            &self.settings.retry,
            ctx,
            "plan",
            Some(self.settings.stage_timeout),
            || planner.plan(requirement, inventory),
        )
        .await?;

        let plan = plan::parse_change_plan(raw)?;
        ctx.set_plan_summary(&plan.summary);
        ctx.info(format!("plan: {}", plan.summary));
        ctx.advance(Stage::Planned);
        Ok(plan)
    }

    async fn apply_edits(
        &self,
        requirement: &Requirement,
        plan: &ChangePlan,
        repo_dir: &Path,
        ctx: &mut RunContext,
    ) -> Result<Vec<plan::FileEdit>, StageError> {
        let planner = &self.collaborators.planner;
        let raw = with_retry(
            &self.settings.retry,
            ctx,
            "generate edits",
            Some(self.settings.stage_timeout),
            || planner.generate_edits(requirement, plan, repo_dir),
        )
        .await?;

        let edits = plan::parse_file_edits(raw)?;
        let summary = apply::apply(repo_dir, &edits).await?;
        ctx.info(format!(
            "applied {} edits ({} deleted, {} already absent)",
            summary.applied_count(),
            summary.deleted.len(),
            summary.skipped.len()
        ));
        ctx.set_applied(summary);
        ctx.advance(Stage::EditsApplied);
        Ok(edits)
    }

    /// Create the feature branch, suffixing `-2`, `-3`, ... while the name
    /// is taken.
    async fn branch(
        &self,
        requirement: &Requirement,
        repo_dir: &Path,
        ctx: &mut RunContext,
    ) -> Result<String, StageError> {
        let vcs = &self.collaborators.vcs;
        let base = requirement.branch.branch_name();

        for n in 1..=self.settings.max_branch_suffix.max(1) {
            let name = branch_candidate(&base, n);
            let candidate = name.as_str();
            let outcome = with_retry(
                &self.settings.retry,
                ctx,
                "create branch",
                Some(self.settings.stage_timeout),
                || vcs.create_branch(repo_dir, candidate),
            )
            .await?;

            match outcome {
                BranchOutcome::Created => {
                    ctx.info(format!("created branch {name}"));
                    ctx.set_branch(&name);
                    ctx.advance(Stage::Branched);
                    return Ok(name);
                }
                BranchOutcome::AlreadyExists => ctx.info(format!("branch {name} already exists")),
            }
        }

        Err(StageError::Fatal(format!(
            "no free branch name for {base} after {} candidates",
            self.settings.max_branch_suffix.max(1)
        )))
    }

    async fn push(
        &self,
        requirement: &Requirement,
        repo_dir: &Path,
        branch: &str,
        edits: &[plan::FileEdit],
        ctx: &mut RunContext,
    ) -> Result<(), StageError> {
        let vcs = &self.collaborators.vcs;
        let message = format!("{}: {}", requirement.id, requirement.title);
        let message = message.as_str();

        let pushed = with_retry(
            &self.settings.retry,
            ctx,
            "push",
            Some(self.settings.stage_timeout),
            || vcs.commit_and_push(repo_dir, branch, edits, message),
        )
        .await?;
        ctx.info(format!("pushed {branch} at {pushed}"));
        ctx.set_pushed_ref(&pushed);
        ctx.advance(Stage::Pushed);
        Ok(())
    }

    /// Returns whether the tests passed. Only infrastructure faults are
    /// retried; a failing test is an answer, not a fault.
    async fn test(
        &self,
        requirement: &Requirement,
        repo_dir: &Path,
        ctx: &mut RunContext,
    ) -> Result<bool, StageError> {
        let _permit = self
            .tests
            .acquire()
            .await
            .map_err(|_| StageError::Fatal("test admission closed".to_string()))?;

        let runner = &self.runner;
        let build = &requirement.build;
        let run_id = ctx.run_id().to_string();
        let run_id = run_id.as_str();

        ctx.info(format!("running `{}` in {}", build.command, build.container_image));
        let result = with_retry(&self.settings.retry, ctx, "test run", None, || {
            runner.run(build, repo_dir, run_id)
        })
        .await?;

        ctx.record_test(&result);
        ctx.advance(Stage::Tested);
        if result.passed {
            ctx.info(format!("tests passed in {}ms", result.duration.as_millis()));
        } else {
            let reason = if result.timed_out {
                format!("timed out after {}s", build.timeout_seconds)
            } else {
                format!("exit code {}", result.exit_code.unwrap_or(-1))
            };
            ctx.warn(format!("tests failed ({reason}):\n{}", result.logs));
        }
        Ok(result.passed)
    }

    /// Publishing never turns a passing run into an error: every failure
    /// here becomes [`Outcome::PublishFailed`].
    async fn publish(
        &self,
        requirement: &Requirement,
        plan: &ChangePlan,
        branch: &str,
        ctx: &mut RunContext,
    ) -> Outcome {
        let settings = match &requirement.pull_request {
            Some(settings) if settings.create_pr => settings,
            _ => {
                ctx.info("pull request creation disabled; skipping publish");
                return Outcome::PublishSkipped;
            }
        };

        let Some(host) = &self.collaborators.host else {
            return Outcome::PublishFailed {
                reason: "no code host configured".to_string(),
            };
        };

        let slug = match requirement::parse_repo_url(&requirement.repo.url) {
            Ok(slug) => slug,
            Err(e) => {
                return Outcome::PublishFailed {
                    reason: e.to_string(),
                }
            }
        };

        let draft = PullRequestDraft::new(requirement, settings, slug, branch, plan);
        let draft = &draft;
        ctx.info(format!("opening pull request {} <- {}", draft.base, draft.head));

        match with_retry(
            &self.settings.retry,
            ctx,
            "open pull request",
            Some(self.settings.stage_timeout),
            || host.create_pull_request(draft),
        )
        .await
        {
            Ok(pr_url) => Outcome::Published { pr_url },
            Err(e) => Outcome::PublishFailed {
                reason: e.to_string(),
            },
        }
    }
}

fn branch_candidate(base: &str, n: u32) -> String {
    if n <= 1 {
        base.to_string()
    } else {
        format!("{base}-{n}")
    }
}
