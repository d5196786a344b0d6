//! Per-run workspace directories.
//!
//! Every run gets its own directory under a shared root. The directory is
//! removed when the run finalizes, and again (synchronously, best-effort)
//! if a [`Workspace`] is dropped without being released, which covers
//! panics and cancelled runs.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Failed to create workspace root {path}: {source}")]
    Root {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Workspace {0} already exists")]
    Collision(PathBuf),

    #[error("Failed to create workspace {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Allocates and cleans run directories under `root`.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the exclusive directory `<root>/<run_id>`.
    ///
    /// Uses `create_dir` rather than `create_dir_all` for the leaf so two
    /// runs can never end up sharing one directory.
    pub async fn acquire(&self, run_id: &str) -> Result<Workspace, WorkspaceError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| WorkspaceError::Root {
                path: self.root.clone(),
                source,
            })?;

        let path = self.root.join(dir_name(run_id));
        match tokio::fs::create_dir(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(WorkspaceError::Collision(path))
            }
            Err(source) => return Err(WorkspaceError::Create { path, source }),
        }

        debug!(path = %path.display(), "workspace acquired");
        Ok(Workspace {
            path,
            released: false,
        })
    }

    /// Remove the workspace directory. Safe to call more than once.
    ///
    /// Removal failures are logged and swallowed: cleanup never blocks the
    /// completion of a run.
    pub async fn release(&self, workspace: &mut Workspace) {
        if workspace.released {
            return;
        }
        workspace.released = true;

        if !workspace.path.starts_with(&self.root) {
            warn!(path = %workspace.path.display(), "refusing to remove a workspace outside the root");
            return;
        }

        match tokio::fs::remove_dir_all(&workspace.path).await {
            Ok(()) => debug!(path = %workspace.path.display(), "workspace released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %workspace.path.display(), error = %e, "failed to remove workspace"),
        }
    }
}

/// One run's exclusive directory. The repository is cloned into `repo/`.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.path.join("repo")
    }

    #[cfg(test)]
    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "workspace removed on drop"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove workspace on drop"),
        }
    }
}

/// Keep run ids filesystem-safe.
fn dir_name(run_id: &str) -> String {
    run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}
