pub mod types;

pub use types::{BuildSpec, Requirement, RepoSlug};
#[cfg(test)]
pub use types::{BranchSpec, CodegenSpec, PrSpec, RepoSpec};

use std::path::Path;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::validation::ValidationError;

#[derive(Debug, Error)]
pub enum RequirementError {
    #[error("Failed to read requirement file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse requirement file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid repository URL: {0}")]
    InvalidUrl(String),
}

/// Load a requirement from a JSON file.
///
/// Shape checks happen here; semantic checks happen in [`validate`] once the
/// orchestrator accepts the requirement.
#[instrument]
pub fn load_from(path: &Path) -> Result<Requirement, RequirementError> {
    let contents = std::fs::read_to_string(path)?;
    let requirement: Requirement = serde_json::from_str(&contents)?;
    debug!(id = %requirement.id, "loaded requirement");
    Ok(requirement)
}

/// Check the invariants the pipeline relies on.
pub fn validate(requirement: &Requirement) -> Result<(), ValidationError> {
    let invalid = |reason: &str| Err(ValidationError::Requirement(reason.to_string()));

    if requirement.id.trim().is_empty() {
        return invalid("id must not be empty");
    }
    if requirement.repo.url.trim().is_empty() {
        return invalid("repo.url must not be empty");
    }
    if requirement.branch.branch_name().trim().is_empty() {
        return invalid("branch name must not be empty");
    }
    if requirement.build.command.trim().is_empty() {
        return invalid("build.command must not be empty");
    }
    if requirement.build.container_image.trim().is_empty() {
        return invalid("build.container_image must not be empty");
    }
    if requirement.build.timeout_seconds == 0 {
        return invalid("build.timeout_seconds must be greater than zero");
    }
    if !requirement.build.workdir.starts_with('/') {
        return invalid("build.workdir must be an absolute container path");
    }
    Ok(())
}

/// Parse a GitHub repository URL into owner and name.
///
/// Accepts `https://github.com/{owner}/{repo}` with an optional `.git`
/// suffix or trailing slash.
pub fn parse_repo_url(url: &str) -> Result<RepoSlug, RequirementError> {
    let parsed =
        reqwest::Url::parse(url).map_err(|_| RequirementError::InvalidUrl(url.to_string()))?;

    if parsed.host_str() != Some("github.com") {
        return Err(RequirementError::InvalidUrl(url.to_string()));
    }

    let segments: Vec<_> = parsed
        .path_segments()
        .ok_or_else(|| RequirementError::InvalidUrl(url.to_string()))?
        .filter(|segment| !segment.is_empty())
        .collect();

    if segments.len() != 2 {
        return Err(RequirementError::InvalidUrl(url.to_string()));
    }

    let name = segments[1].strip_suffix(".git").unwrap_or(segments[1]);
    if name.is_empty() {
        return Err(RequirementError::InvalidUrl(url.to_string()));
    }

    Ok(RepoSlug {
        owner: segments[0].to_string(),
        name: name.to_string(),
    })
}

#[cfg(test)]
pub(crate) fn sample_requirement(id: &str) -> Requirement {
    use std::collections::BTreeMap;

    Requirement {
        id: id.to_string(),
        title: "Add health endpoint".to_string(),
        language: Some(types::Language::Python),
        repo: RepoSpec {
            url: "https://github.com/acme/service".to_string(),
            default_branch: "main".to_string(),
        },
        branch: BranchSpec {
            feature_id: id.to_string(),
            name_template: "feature/{feature_id}".to_string(),
        },
        build: BuildSpec {
            command: "pytest".to_string(),
            container_image: "python:3.11".to_string(),
            workdir: "/workspace".to_string(),
            env: BTreeMap::new(),
            timeout_seconds: 60,
            cpu_shares: None,
            mem_limit: None,
        },
        codegen: CodegenSpec {
            description: "Expose GET /health returning 200".to_string(),
            test_expectations: vec!["health returns ok".to_string()],
        },
        pull_request: Some(PrSpec::default()),
    }
}
