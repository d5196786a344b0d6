pub mod inventory;
pub mod types;

pub use types::{ChangePlan, EditAction, FileEdit, RepoInventory};

use serde_json::Value;
use tracing::{debug, warn};

use crate::validation::ValidationError;
use types::{RawChangePlan, RawFileEdit};

/// Validate a raw plan payload from the planning service.
///
/// The payload must be an object with a non-empty `summary`;
/// `touched_files` is optional. Anything else is a
/// [`ValidationError::MalformedPlan`].
pub fn parse_change_plan(raw: Value) -> Result<ChangePlan, ValidationError> {
    let raw: RawChangePlan = serde_json::from_value(raw)
        .map_err(|e| ValidationError::MalformedPlan(e.to_string()))?;

    let summary = raw
        .summary
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ValidationError::MalformedPlan("summary is missing or empty".to_string()))?;

    let touched_files = raw
        .touched_files
        .iter()
        .map(|p| normalize_path(p))
        .filter(|p| !p.is_empty())
        .collect();

    Ok(ChangePlan {
        summary,
        touched_files,
    })
}

/// Validate a raw edit list from the planning service.
///
/// Accepts either `{"edits": [...]}` or a bare array. Every element must
/// carry a supported action and a path; `create` and `modify` also need
/// `content`. An empty list is rejected since there would be nothing to
/// publish.
pub fn parse_file_edits(raw: Value) -> Result<Vec<FileEdit>, ValidationError> {
    let items = match raw {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("edits") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ValidationError::MalformedEdit {
                    index: 0,
                    reason: "expected an `edits` array".to_string(),
                })
            }
        },
        other => {
            return Err(ValidationError::MalformedEdit {
                index: 0,
                reason: format!("expected an array of edits, got {}", json_kind(&other)),
            })
        }
    };

    if items.is_empty() {
        return Err(ValidationError::NoEdits);
    }

    let edits = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| validate_edit(index, item))
        .collect::<Result<Vec<_>, _>>()?;

    debug!(count = edits.len(), "validated file edits");
    Ok(edits)
}

fn validate_edit(index: usize, item: Value) -> Result<FileEdit, ValidationError> {
    let malformed = |reason: String| ValidationError::MalformedEdit { index, reason };

    let raw: RawFileEdit = serde_json::from_value(item).map_err(|e| malformed(e.to_string()))?;

    let path = raw
        .path
        .as_deref()
        .map(normalize_path)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| malformed("path is missing or empty".to_string()))?;

    if path.contains('\0') {
        return Err(malformed("path contains a NUL byte".to_string()));
    }

    let action = raw
        .action
        .as_deref()
        .map(|a| a.trim().to_ascii_lowercase())
        .ok_or_else(|| malformed("action is missing".to_string()))?;

    let action = match action.as_str() {
        "create" => EditAction::Create {
            content: raw
                .content
                .ok_or_else(|| malformed("create requires content".to_string()))?,
        },
        "modify" => EditAction::Modify {
            content: raw
                .content
                .ok_or_else(|| malformed("modify requires content".to_string()))?,
        },
        "delete" => {
            if raw.content.as_deref().is_some_and(|c| !c.is_empty()) {
                warn!(path = %path, "ignoring content on delete edit");
            }
            EditAction::Delete
        }
        other => return Err(malformed(format!("unsupported action `{other}`"))),
    };

    Ok(FileEdit { path, action })
}

/// Convert separators to `/` and drop leading `./` segments.
///
/// Deliberately does not strip `..` or a leading `/`: those must reach the
/// applicator's containment check and be rejected there.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.trim().replace('\\', "/");
    while let Some(rest) = normalized.strip_prefix("./") {
        normalized = rest.to_string();
    }
    normalized
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
