//! Planner that replays recorded planning-service output.
//!
//! The recording maps requirement ids to the raw responses:
//! `{ "<id>": { "plan": {...}, "edits": [...] } }`. The payloads go through
//! the same validation as live responses.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use super::{ClientError, Planner};
use crate::plan::{ChangePlan, RepoInventory};
use crate::requirement::Requirement;

#[derive(Debug, Clone, Default, Deserialize)]
struct Recording {
    #[serde(default)]
    plan: Value,
    #[serde(default)]
    edits: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayPlanner {
    recordings: HashMap<String, Recording>,
}

impl ReplayPlanner {
    pub fn load_from(path: &Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            recordings: serde_json::from_str(json)?,
        })
    }

    fn recording(&self, requirement: &Requirement) -> Result<&Recording, ClientError> {
        self.recordings.get(&requirement.id).ok_or_else(|| {
            ClientError::Rejected(format!("no recorded plan for requirement {}", requirement.id))
        })
    }
}

#[async_trait]
impl Planner for ReplayPlanner {
    async fn plan(
        &self,
        requirement: &Requirement,
        _inventory: &RepoInventory,
    ) -> Result<Value, ClientError> {
        Ok(self.recording(requirement)?.plan.clone())
    }

    async fn generate_edits(
        &self,
        requirement: &Requirement,
        _plan: &ChangePlan,
        _repo_dir: &Path,
    ) -> Result<Value, ClientError> {
        Ok(self.recording(requirement)?.edits.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirement::sample_requirement;

    #[tokio::test]
    async fn test_replays_recorded_payloads() {
        let planner = ReplayPlanner::from_json(
            r#"{"r1": {"plan": {"summary": "s"}, "edits": [{"action": "delete", "path": "x"}]}}"#,
        )
        .unwrap();
        let requirement = sample_requirement("r1");

        let plan = planner.plan(&requirement, &RepoInventory::default()).await.unwrap();
        assert_eq!(plan["summary"], "s");

        let change_plan = ChangePlan {
            summary: "s".to_string(),
            touched_files: vec![],
        };
        let edits = planner
            .generate_edits(&requirement, &change_plan, Path::new("."))
            .await
            .unwrap();
        assert_eq!(edits[0]["action"], "delete");
    }

    #[tokio::test]
    async fn test_unknown_requirement_is_fatal() {
        let planner = ReplayPlanner::from_json("{}").unwrap();
        let err = planner
            .plan(&sample_requirement("missing"), &RepoInventory::default())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
