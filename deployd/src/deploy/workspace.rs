//! Workspace manager: one disposable directory per deployment attempt

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deploy::git::SourceFetcher;
use crate::deploy::runner::LineSink;
use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::models::request::DeployRequest;

/// Directory owned by exactly one deployment until released
///
/// Release consumes the workspace, so it can happen at most once. A workspace
/// dropped without being released (a panicking pipeline task) is removed
/// synchronously as a fallback.
#[derive(Debug)]
pub struct Workspace {
    dir: Dir,
    released: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn dir(&self) -> &Dir {
        &self.dir
    }

    /// Delete the directory tree
    pub async fn release(mut self) -> Result<(), EngineError> {
        self.released = true;
        self.dir.delete().await.map_err(|e| {
            EngineError::WorkspaceError(format!(
                "failed to remove {}: {}",
                self.dir.path().display(),
                e
            ))
        })?;
        debug!("Released workspace {}", self.dir.path().display());
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            "Workspace {} dropped without release, removing",
            self.dir.path().display()
        );
        if let Err(e) = std::fs::remove_dir_all(self.dir.path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.dir.path().display(), e);
            }
        }
    }
}

/// Allocates workspaces under a root directory and fills them with source
pub struct WorkspaceManager {
    root: Dir,
    fetcher: Arc<dyn SourceFetcher>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            root: Dir::new(root),
            fetcher,
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Create a fresh, uniquely named directory for a deployment
    pub async fn acquire(
        &self,
        deployment_id: &str,
        request: &DeployRequest,
    ) -> Result<Workspace, EngineError> {
        let to_workspace_error = |e: EngineError| EngineError::WorkspaceError(e.to_string());

        self.root.create().await.map_err(to_workspace_error)?;

        let name = format!("{}-{}", dir_label(request.label()), deployment_id);
        let dir = self.root.subdir(&name);
        dir.create_new().await.map_err(to_workspace_error)?;

        info!("Acquired workspace {}", dir.path().display());
        Ok(Workspace {
            dir,
            released: false,
        })
    }

    /// Retrieve the request's source tree into the workspace root
    pub async fn fetch_source(
        &self,
        workspace: &Workspace,
        request: &DeployRequest,
        cancel: &CancellationToken,
        sink: &LineSink,
    ) -> Result<(), EngineError> {
        self.fetcher
            .fetch(request, workspace.path(), cancel, sink)
            .await
    }

    /// Delete a workspace
    pub async fn release(&self, workspace: Workspace) -> Result<(), EngineError> {
        workspace.release().await
    }
}

/// Filesystem-safe prefix derived from an app name or repository
fn dir_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(40)
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "deploy".to_string()
    } else {
        trimmed.to_string()
    }
}
