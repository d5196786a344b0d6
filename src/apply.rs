//! Applies validated file edits to a checked-out repository.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::plan::{EditAction, FileEdit};
use crate::validation::ValidationError;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        source: std::io::Error,
    },
}

/// What an `apply` call did, in edit order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    /// Paths written or removed
    pub applied: Vec<String>,
    /// Subset of `applied` that were deletions
    pub deleted: Vec<String>,
    /// Deletions of files that did not exist
    pub skipped: Vec<String>,
}

impl ApplySummary {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// Apply `edits` to `root` in order.
///
/// Each path is checked for containment before anything is touched; the
/// first edit that escapes `root` (or fails on disk) stops the batch.
/// Earlier edits stay applied, the caller decides what happens to the run.
#[instrument(skip(edits), fields(root = %root.display(), edits = edits.len()))]
pub async fn apply(root: &Path, edits: &[FileEdit]) -> Result<ApplySummary, ApplyError> {
    let canonical_root = tokio::fs::canonicalize(root)
        .await
        .map_err(|source| ApplyError::Io {
            action: "resolve",
            path: root.display().to_string(),
            source,
        })?;

    let mut summary = ApplySummary::default();

    for edit in edits {
        let target = resolve_inside(&canonical_root, &edit.path).await?;

        match &edit.action {
            EditAction::Create { content } | EditAction::Modify { content } => {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|source| io_error("create parent of", edit, source))?;
                }
                tokio::fs::write(&target, with_trailing_newline(content))
                    .await
                    .map_err(|source| io_error(edit.action.name(), edit, source))?;
                summary.applied.push(edit.path.clone());
            }
            EditAction::Delete => match tokio::fs::remove_file(&target).await {
                Ok(()) => {
                    summary.applied.push(edit.path.clone());
                    summary.deleted.push(edit.path.clone());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    summary.skipped.push(edit.path.clone());
                }
                Err(source) => return Err(io_error("delete", edit, source)),
            },
        }
        debug!(action = edit.action.name(), path = %edit.path, "applied edit");
    }

    Ok(summary)
}

/// Resolve `relative` under `root`, rejecting anything that lands outside.
///
/// The check is lexical first (absolute paths, `..` past the root), then
/// against the filesystem: the deepest existing ancestor of the target is
/// canonicalized so a symlink inside the repository cannot redirect a write.
async fn resolve_inside(root: &Path, relative: &str) -> Result<PathBuf, ValidationError> {
    let escape = || ValidationError::PathEscape(relative.to_string());

    let mut target = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                target.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(escape());
                }
                target.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape()),
        }
    }
    if depth == 0 {
        return Err(escape());
    }

    let mut probe = target.as_path();
    loop {
        match tokio::fs::canonicalize(probe).await {
            Ok(resolved) => {
                if !resolved.starts_with(root) {
                    return Err(escape());
                }
                break;
            }
            Err(_) => match probe.parent() {
                Some(parent) => probe = parent,
                None => return Err(escape()),
            },
        }
    }

    Ok(target)
}

fn io_error(action: &'static str, edit: &FileEdit, source: std::io::Error) -> ApplyError {
    ApplyError::Io {
        action,
        path: edit.path.clone(),
        source,
    }
}

/// Empty content stays empty; anything else ends with a newline.
fn with_trailing_newline(content: &str) -> String {
    if content.is_empty() || content.ends_with('\n') {
        content.to_string()
    } else {
        format!("{content}\n")
    }
}
