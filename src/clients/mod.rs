//! Interfaces of the external collaborators the pipeline drives, plus
//! thin default adapters.

pub mod git;
pub mod github;
pub mod replay;

pub use git::GitCli;
pub use github::GitHubClient;
pub use replay::ReplayPlanner;

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::plan::{ChangePlan, FileEdit, RepoInventory};
use crate::requirement::types::{PrSpec, RepoSpec};
use crate::requirement::{Requirement, RepoSlug};

/// A collaborator failure, classified where it happens.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transient(_) | ClientError::RateLimited(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOutcome {
    Created,
    AlreadyExists,
}

/// Clone, branch, commit and push.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Clone `repo` at its default branch into `dest` and return the
    /// checkout directory. Must tolerate leftovers of a failed attempt.
    async fn clone_repo(&self, repo: &RepoSpec, dest: &Path) -> Result<PathBuf, ClientError>;

    async fn create_branch(&self, repo_dir: &Path, name: &str)
        -> Result<BranchOutcome, ClientError>;

    /// Stage the edited paths, commit and push `branch`; returns the pushed
    /// commit id.
    async fn commit_and_push(
        &self,
        repo_dir: &Path,
        branch: &str,
        edits: &[FileEdit],
        message: &str,
    ) -> Result<String, ClientError>;
}

/// The LLM-backed planning service. Its output is untrusted and returned
/// raw; the pipeline validates it before use.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        requirement: &Requirement,
        inventory: &RepoInventory,
    ) -> Result<Value, ClientError>;

    async fn generate_edits(
        &self,
        requirement: &Requirement,
        plan: &ChangePlan,
        repo_dir: &Path,
    ) -> Result<Value, ClientError>;
}

/// Opens pull requests.
#[async_trait]
pub trait CodeHost: Send + Sync {
    /// Returns the URL of the new pull request.
    async fn create_pull_request(&self, draft: &PullRequestDraft) -> Result<String, ClientError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestDraft {
    pub repo: RepoSlug,
    pub base: String,
    pub head: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub reviewers: Vec<String>,
    pub draft: bool,
}

impl PullRequestDraft {
    pub fn new(
        requirement: &Requirement,
        settings: &PrSpec,
        repo: RepoSlug,
        head: &str,
        plan: &ChangePlan,
    ) -> Self {
        let base = settings
            .base
            .clone()
            .unwrap_or_else(|| requirement.repo.default_branch.clone());
        let body = format!(
            "{}\n\n## Plan\n\n{}\n",
            requirement.codegen.description.trim_end(),
            plan.summary
        );
        Self {
            repo,
            base,
            head: head.to_string(),
            title: format!("{}: {}", requirement.id, requirement.title),
            body,
            labels: settings.labels.clone(),
            reviewers: settings.reviewers.clone(),
            draft: settings.draft,
        }
    }
}
