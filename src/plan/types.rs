use serde::{Deserialize, Serialize};

/// Planned scope of a change, as returned by the planning service.
///
/// `touched_files` is advisory: it is logged and shown to the edit
/// generator, but the edits themselves decide what is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangePlan {
    pub summary: String,
    pub touched_files: Vec<String>,
}

/// One validated file operation. `path` is relative and normalised, but
/// containment inside the workspace is checked when the edit is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEdit {
    pub path: String,
    pub action: EditAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum EditAction {
    Create { content: String },
    Modify { content: String },
    Delete,
}

impl EditAction {
    pub fn name(&self) -> &'static str {
        match self {
            EditAction::Create { .. } => "create",
            EditAction::Modify { .. } => "modify",
            EditAction::Delete => "delete",
        }
    }
}

impl FileEdit {
    #[cfg(test)]
    pub fn create(path: &str, content: &str) -> Self {
        Self {
            path: path.to_string(),
            action: EditAction::Create {
                content: content.to_string(),
            },
        }
    }

    #[cfg(test)]
    pub fn modify(path: &str, content: &str) -> Self {
        Self {
            path: path.to_string(),
            action: EditAction::Modify {
                content: content.to_string(),
            },
        }
    }

    #[cfg(test)]
    pub fn delete(path: &str) -> Self {
        Self {
            path: path.to_string(),
            action: EditAction::Delete,
        }
    }
}

/// Unvalidated plan payload. Only the field types are enforced here.
#[derive(Debug, Deserialize)]
pub(super) struct RawChangePlan {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub touched_files: Vec<String>,
}

/// Unvalidated edit payload. `action` stays a string so unsupported
/// values surface as a validation error rather than a parse error.
#[derive(Debug, Deserialize)]
pub(super) struct RawFileEdit {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Relevant files of a cloned repository, handed to the planning service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoInventory {
    pub files: Vec<String>,
    /// True when the scan stopped at the file limit
    pub truncated: bool,
}

impl RepoInventory {
    /// Newline-separated listing, the form the planner prompt expects.
    pub fn listing(&self) -> String {
        self.files.join("\n")
    }
}
