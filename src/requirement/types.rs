use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One requested change, as handed over by the requirement source.
///
/// Immutable once accepted: the orchestrator only ever borrows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    /// Unique id of the requirement (e.g., "REQ-142")
    pub id: String,
    /// Short human title, reused in the commit message and PR title
    pub title: String,
    /// Target language hint for the planning service
    #[serde(default)]
    pub language: Option<Language>,
    /// Repository to change
    pub repo: RepoSpec,
    /// Feature branch naming
    pub branch: BranchSpec,
    /// How the change is validated
    pub build: BuildSpec,
    /// Instructions for the planning service
    pub codegen: CodegenSpec,
    /// Pull request settings; `None` means no PR is opened
    #[serde(default)]
    pub pull_request: Option<PrSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Node,
    Java,
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::Node => write!(f, "node"),
            Language::Java => write!(f, "java"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoSpec {
    /// Clone URL (e.g., https://github.com/org/repo)
    pub url: String,
    /// Branch the feature branch is cut from
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchSpec {
    pub feature_id: String,
    /// Template with a `{feature_id}` placeholder
    #[serde(default = "default_name_template")]
    pub name_template: String,
}

impl BranchSpec {
    /// Render the branch name from the template.
    pub fn branch_name(&self) -> String {
        self.name_template.replace("{feature_id}", &self.feature_id)
    }
}

/// How to validate a change: one command in one container image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Build/test command, run through `sh -c`
    pub command: String,
    /// Image reference (e.g., "python:3.11")
    pub container_image: String,
    /// Mount point of the workspace inside the container
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Hard wall-clock bound for the command
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub cpu_shares: Option<u32>,
    /// Docker memory limit (e.g., "4g")
    #[serde(default)]
    pub mem_limit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodegenSpec {
    /// Natural-language description of the required change
    pub description: String,
    #[serde(default)]
    pub test_expectations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrSpec {
    #[serde(default = "default_true")]
    pub create_pr: bool,
    /// Base branch; falls back to the repo default branch
    #[serde(default)]
    pub base: Option<String>,
    /// Users, or `org/team` entries for team reviewers
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub draft: bool,
}

impl Default for PrSpec {
    fn default() -> Self {
        Self {
            create_pr: true,
            base: None,
            reviewers: Vec::new(),
            labels: Vec::new(),
            draft: false,
        }
    }
}

/// Owner and name of a GitHub repository, parsed from `RepoSpec::url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSlug {
    pub owner: String,
    pub name: String,
}

impl std::fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_name_template() -> String {
    "feature/{feature_id}".to_string()
}

fn default_workdir() -> String {
    "/workspace".to_string()
}

fn default_timeout_seconds() -> u64 {
    1800
}

fn default_true() -> bool {
    true
}
