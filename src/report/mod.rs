pub mod context;
pub mod types;

pub use context::{Outcome, RunContext};
pub use types::{RequirementResult, RunStatus};

use colored::Colorize;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to write report file: {0}")]
    FileWrite(#[from] std::io::Error),

    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Log lines of failing test output shown in the terminal report.
const LOG_TAIL_LINES: usize = 20;

/// A run that never produced a result (unreadable requirement, admission
/// refused, no workspace).
#[derive(Debug, Clone, Serialize)]
pub struct RejectedRun {
    pub source: String,
    pub reason: String,
}

/// Everything one CLI invocation produced.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub overall: RunStatus,
    pub results: Vec<RequirementResult>,
    pub rejected: Vec<RejectedRun>,
}

/// Collect results into a report ordered by requirement id.
///
/// The overall status is the worst individual status; any rejected run
/// makes it `error`.
pub fn build(mut results: Vec<RequirementResult>, rejected: Vec<RejectedRun>) -> Report {
    results.sort_by(|a, b| {
        a.requirement_id()
            .cmp(b.requirement_id())
            .then_with(|| a.run_id().cmp(b.run_id()))
    });

    let overall = if rejected.is_empty() {
        results
            .iter()
            .map(RequirementResult::status)
            .max_by_key(|s| severity(*s))
            .unwrap_or(RunStatus::Ok)
    } else {
        RunStatus::Error
    };

    Report {
        overall,
        results,
        rejected,
    }
}

fn severity(status: RunStatus) -> u8 {
    match status {
        RunStatus::Ok => 0,
        RunStatus::Failed => 1,
        RunStatus::Error => 2,
    }
}

/// Output the report: JSON on request, markdown when a path is given,
/// colored terminal text otherwise.
#[instrument(skip(report), fields(runs = report.results.len(), overall = %report.overall))]
pub fn output(report: &Report, output_path: Option<&Path>, json: bool) -> Result<(), ReportError> {
    match (json, output_path) {
        (true, None) => {
            debug!("writing JSON report to stdout");
            println!("{}", serde_json::to_string_pretty(report)?);
            Ok(())
        }
        (true, Some(path)) => {
            debug!(path = %path.display(), "writing JSON report to file");
            std::fs::write(path, serde_json::to_string_pretty(report)?)?;
            Ok(())
        }
        (false, None) => {
            debug!("writing report to terminal");
            print_terminal_report(report);
            Ok(())
        }
        (false, Some(path)) => {
            debug!(path = %path.display(), "writing report to file");
            write_markdown_report(report, path)
        }
    }
}

fn print_terminal_report(report: &Report) {
    println!();
    for result in &report.results {
        println!("═══ {} ({}) ═══", result.requirement_id(), result.run_id());
        println!("Status: {}", colorize_status(result.status()));
        if let Some(branch) = result.branch() {
            println!("  Branch: {branch}");
        }
        if let Some(url) = result.pr_url() {
            println!("  Pull request: {}", url.cyan());
        }
        if let Some(reason) = result.publish_error() {
            println!("  {} {reason}", "Publish failed:".yellow());
        }
        if let Some(error) = result.error() {
            println!("  {} {error}", "Error:".red());
        }
        if let Some(test) = result.test() {
            println!(
                "  Tests: {} in {:.1}s",
                if test.passed { "passed".green() } else { "failed".red() },
                test.duration_ms as f64 / 1000.0
            );
            if !test.passed {
                for line in tail(&test.logs, LOG_TAIL_LINES) {
                    println!("    {}", line.dimmed());
                }
            }
        }

        let timings: Vec<String> = result
            .timings()
            .iter()
            .map(|t| format!("{} {}ms", t.stage, t.duration_ms))
            .collect();
        println!("  Stages: {}", timings.join(" → "));
        println!("  Total: {:.1}s", result.total_ms() as f64 / 1000.0);
        println!();
    }

    for rejected in &report.rejected {
        println!("═══ {} ═══", rejected.source);
        println!("Status: {} {}", colorize_status(RunStatus::Error), rejected.reason);
        println!();
    }

    println!("═══ Overall: {} ═══", colorize_status(report.overall));
    println!();
}

fn write_markdown_report(report: &Report, path: &Path) -> Result<(), ReportError> {
    std::fs::write(path, render_markdown(report))?;
    Ok(())
}

fn render_markdown(report: &Report) -> String {
    let mut md = String::new();
    md.push_str(&format!("# Pipeline report: {}\n\n", report.overall));

    for result in &report.results {
        md.push_str(&format!("## {}\n\n", result.requirement_id()));
        md.push_str(&format!(
            "**Status: {}** | **Run:** `{}` | **Total:** {:.1}s\n\n",
            result.status(),
            result.run_id(),
            result.total_ms() as f64 / 1000.0
        ));
        if let Some(branch) = result.branch() {
            md.push_str(&format!("- **Branch:** `{branch}`\n"));
        }
        if let Some(url) = result.pr_url() {
            md.push_str(&format!("- **Pull request:** {url}\n"));
        }
        if let Some(reason) = result.publish_error() {
            md.push_str(&format!("- **Publish failed:** {reason}\n"));
        }
        if let Some(error) = result.error() {
            md.push_str(&format!("- **Error:** {error}\n"));
        }
        md.push('\n');

        md.push_str("| Stage | Duration |\n|---|---|\n");
        for timing in result.timings() {
            md.push_str(&format!("| {} | {}ms |\n", timing.stage, timing.duration_ms));
        }
        md.push('\n');

        if let Some(test) = result.test() {
            if !test.passed {
                md.push_str("<details><summary>Test output</summary>\n\n```\n");
                md.push_str(test.logs.trim_end());
                md.push_str("\n```\n\n</details>\n\n");
            }
        }

        md.push_str("<details><summary>Run log</summary>\n\n```\n");
        for entry in result.logs() {
            md.push_str(&entry.to_string());
            md.push('\n');
        }
        md.push_str("```\n\n</details>\n\n");
    }

    for rejected in &report.rejected {
        md.push_str(&format!("## {}\n\n**Status: ERROR** {}\n\n", rejected.source, rejected.reason));
    }

    md
}

fn tail(text: &str, lines: usize) -> Vec<&str> {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].to_vec()
}

fn colorize_status(status: RunStatus) -> colored::ColoredString {
    match status {
        RunStatus::Ok => "OK".green().bold(),
        RunStatus::Failed => "FAILED".yellow().bold(),
        RunStatus::Error => "ERROR".red().bold(),
    }
}
