//! Per-run mutable state: log stream, stage timings and the facts the
//! final result reports.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::types::{
    LogEntry, LogLevel, RequirementResult, RunStatus, StageTiming, TestSummary,
};
use crate::apply::ApplySummary;
use crate::pipeline::{Stage, StageError};
use crate::runner::TestResult;

/// How a run that got past the pipeline's error paths ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Published { pr_url: String },
    /// Tests passed and no PR was requested
    PublishSkipped,
    /// Tests passed but the PR could not be opened
    PublishFailed { reason: String },
    TestsFailed,
}

/// Owned by exactly one pipeline invocation; never shared.
#[derive(Debug)]
pub struct RunContext {
    run_id: String,
    requirement_id: String,
    stage: Stage,
    started: Instant,
    stage_started: Instant,
    workspace: Option<PathBuf>,
    logs: Vec<LogEntry>,
    timings: Vec<StageTiming>,
    plan_summary: Option<String>,
    applied: Option<ApplySummary>,
    branch: Option<String>,
    pushed_ref: Option<String>,
    test: Option<TestSummary>,
}

impl RunContext {
    pub fn new(requirement_id: &str) -> Self {
        let now = Instant::now();
        Self {
            run_id: new_run_id(requirement_id),
            requirement_id: requirement_id.to_string(),
            stage: Stage::Created,
            started: now,
            stage_started: now,
            workspace: None,
            logs: Vec::new(),
            timings: Vec::new(),
            plan_summary: None,
            applied: None,
            branch: None,
            pushed_ref: None,
            test: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(run_id = %self.run_id, stage = %self.stage, "{message}");
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(run_id = %self.run_id, stage = %self.stage, "{message}");
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!(run_id = %self.run_id, stage = %self.stage, "{message}");
        self.push(LogLevel::Error, message);
    }

    fn push(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry {
            elapsed_ms: millis(self.started.elapsed()),
            stage: self.stage,
            level,
            message,
        });
    }

    /// Move to `next`, recording how long the previous stage took.
    ///
    /// Illegal transitions are logged and ignored; they indicate a bug in
    /// the driver, not a property of the run.
    pub fn advance(&mut self, next: Stage) {
        if !self.stage.can_advance_to(next) {
            let message = format!("ignoring illegal transition {} -> {next}", self.stage);
            self.error(message);
            return;
        }
        let now = Instant::now();
        self.timings.push(StageTiming {
            stage: next,
            duration_ms: millis(now - self.stage_started),
        });
        self.stage_started = now;
        self.stage = next;
    }

    pub fn set_workspace(&mut self, path: PathBuf) {
        self.workspace = Some(path);
    }

    pub fn set_plan_summary(&mut self, summary: &str) {
        self.plan_summary = Some(summary.to_string());
    }

    pub fn set_applied(&mut self, summary: ApplySummary) {
        self.applied = Some(summary);
    }

    pub fn set_branch(&mut self, branch: &str) {
        self.branch = Some(branch.to_string());
    }

    pub fn set_pushed_ref(&mut self, pushed_ref: &str) {
        self.pushed_ref = Some(pushed_ref.to_string());
    }

    pub fn record_test(&mut self, result: &TestResult) {
        self.test = Some(TestSummary {
            passed: result.passed,
            exit_code: result.exit_code,
            timed_out: result.timed_out,
            duration_ms: millis(result.duration),
            logs: result.logs.clone(),
        });
    }

    /// Finalize the run and produce its result. Consumes the context, so a
    /// run can only ever produce one result.
    pub fn finish(mut self, outcome: Result<Outcome, StageError>) -> RequirementResult {
        let last_stage = self.stage;

        let mut pr_url = None;
        let mut publish_error = None;
        let mut error_kind = None;
        let mut error = None;

        let status = match outcome {
            Ok(Outcome::Published { pr_url: url }) => {
                self.info(format!("pull request opened: {url}"));
                pr_url = Some(url);
                RunStatus::Ok
            }
            Ok(Outcome::PublishSkipped) => RunStatus::Ok,
            Ok(Outcome::PublishFailed { reason }) => {
                self.warn(format!("tests passed but the pull request was not opened: {reason}"));
                publish_error = Some(reason);
                RunStatus::Ok
            }
            Ok(Outcome::TestsFailed) => RunStatus::Failed,
            Err(e) => {
                self.error(format!("run aborted at {last_stage}: {e}"));
                error_kind = Some(e.kind());
                error = Some(e.to_string());
                RunStatus::Error
            }
        };

        self.advance(Stage::Finalized);
        if let Some(path) = &self.workspace {
            let message = format!("finalized, workspace {} released", path.display());
            self.info(message);
        }

        RequirementResult {
            requirement_id: self.requirement_id,
            run_id: self.run_id,
            status,
            pr_url,
            branch: self.branch,
            pushed_ref: self.pushed_ref,
            publish_error,
            error_kind,
            error,
            plan_summary: self.plan_summary,
            applied: self.applied,
            test: self.test,
            last_stage,
            logs: self.logs,
            timings: self.timings,
            total_ms: millis(self.started.elapsed()),
        }
    }
}

/// `<sanitised requirement id>-<12 hex chars>`; unique per run even for
/// repeated requirement ids.
fn new_run_id(requirement_id: &str) -> String {
    let safe: String = requirement_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(48)
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{safe}-{}", &suffix[..12])
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
