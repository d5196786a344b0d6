use serde::Serialize;

use crate::apply::ApplySummary;
use crate::pipeline::Stage;

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Tests passed; the PR may still have failed to open (see `publish_error`)
    Ok,
    /// Tests ran and did not pass
    Failed,
    /// The pipeline could not complete
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Ok => write!(f, "OK"),
            RunStatus::Failed => write!(f, "FAILED"),
            RunStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// One line of a run's log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Milliseconds since the run started
    pub elapsed_ms: u64,
    pub stage: Stage,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.level {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(
            f,
            "[{:>7.3}s] {level:<5} {:<18} {}",
            self.elapsed_ms as f64 / 1000.0,
            self.stage,
            self.message
        )
    }
}

/// Time spent reaching `stage` from the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub duration_ms: u64,
}

/// The build/test part of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestSummary {
    pub passed: bool,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub logs: String,
}

/// How an error-status run failed, for callers that branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    TransientExhausted,
    Fatal,
    Cancelled,
}

/// Structured outcome of one run. Produced once, by consuming the run's
/// context, and read-only afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct RequirementResult {
    pub(super) requirement_id: String,
    pub(super) run_id: String,
    pub(super) status: RunStatus,
    pub(super) pr_url: Option<String>,
    pub(super) branch: Option<String>,
    pub(super) pushed_ref: Option<String>,
    pub(super) publish_error: Option<String>,
    pub(super) error_kind: Option<ErrorKind>,
    pub(super) error: Option<String>,
    pub(super) plan_summary: Option<String>,
    pub(super) applied: Option<ApplySummary>,
    pub(super) test: Option<TestSummary>,
    pub(super) last_stage: Stage,
    pub(super) logs: Vec<LogEntry>,
    pub(super) timings: Vec<StageTiming>,
    pub(super) total_ms: u64,
}

impl RequirementResult {
    pub fn requirement_id(&self) -> &str {
        &self.requirement_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn pr_url(&self) -> Option<&str> {
        self.pr_url.as_deref()
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn publish_error(&self) -> Option<&str> {
        self.publish_error.as_deref()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn test(&self) -> Option<&TestSummary> {
        self.test.as_ref()
    }

    /// Last stage reached before finalizing.
    pub fn last_stage(&self) -> Stage {
        self.last_stage
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn timings(&self) -> &[StageTiming] {
        &self.timings
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(RunStatus::Ok.to_string(), "OK");
        assert_eq!(RunStatus::Failed.to_string(), "FAILED");
        assert_eq!(RunStatus::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&RunStatus::Failed).unwrap(), "\"failed\"");
    }

    #[test]
    fn test_log_entry_display() {
        let entry = LogEntry {
            elapsed_ms: 1500,
            stage: Stage::Cloned,
            level: LogLevel::Warn,
            message: "clone attempt 1 failed".to_string(),
        };
        let line = entry.to_string();
        assert!(line.contains("1.500s"));
        assert!(line.contains("WARN"));
        assert!(line.contains("cloned"));
        assert!(line.ends_with("clone attempt 1 failed"));
    }
}
