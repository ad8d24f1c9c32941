//! Local change detection via `git diff --name-only <branch>`.

use std::path::{Path, PathBuf};

use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ChangeTrackerError {
    #[error("no workspace directory configured")]
    NoWorkspace,
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("git diff exited with {status}: {stderr}")]
    Git { status: i32, stderr: String },
}

/// Lists files that differ from a branch in a working copy.
#[derive(Debug, Clone)]
pub struct ChangeTracker {
    workspace: Option<PathBuf>,
    branch: String,
}

impl ChangeTracker {
    pub fn new(workspace: Option<PathBuf>, branch: impl Into<String>) -> Self {
        Self {
            workspace,
            branch: branch.into(),
        }
    }

    pub fn set_workspace(&mut self, workspace: Option<PathBuf>) {
        self.workspace = workspace;
    }

    pub fn set_branch(&mut self, branch: impl Into<String>) {
        self.branch = branch.into();
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Changed paths relative to the workspace root.
    pub async fn try_changed_files(&self) -> Result<Vec<String>, ChangeTrackerError> {
        let workspace = self.workspace.as_ref().ok_or(ChangeTrackerError::NoWorkspace)?;
        let output = Command::new("git")
            .args(["diff", "--name-only", self.branch.as_str()])
            .current_dir(workspace)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ChangeTrackerError::Git {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(parse_name_only(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Changed paths, or an empty list if they can't be determined.
    pub async fn changed_files(&self) -> Vec<String> {
        match self.try_changed_files().await {
            Ok(files) => files,
            Err(ChangeTrackerError::NoWorkspace) => {
                log::warn!("No workspace folder detected; skipping git diff.");
                Vec::new()
            }
            Err(e) => {
                log::error!("Failed to read git diff output. {e}");
                Vec::new()
            }
        }
    }
}

fn parse_name_only(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_only() {
        let files = parse_name_only("src/lib.rs\r\n\n  README.md \n\r\n");
        assert_eq!(files, vec!["src/lib.rs", "README.md"]);
        assert!(parse_name_only("").is_empty());
    }

    #[test]
    fn test_setters() {
        let mut tracker = ChangeTracker::new(None, "main");
        assert!(tracker.workspace().is_none());

        tracker.set_workspace(Some(PathBuf::from("/tmp/work")));
        tracker.set_branch("develop");
        assert_eq!(tracker.workspace(), Some(Path::new("/tmp/work")));
        assert_eq!(tracker.branch(), "develop");
    }

    #[tokio::test]
    async fn test_no_workspace_yields_empty() {
        let tracker = ChangeTracker::new(None, "main");
        assert!(matches!(
            tracker.try_changed_files().await,
            Err(ChangeTrackerError::NoWorkspace)
        ));
        assert!(tracker.changed_files().await.is_empty());
    }

    #[tokio::test]
    async fn test_non_repository_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ChangeTracker::new(Some(dir.path().to_path_buf()), "main");
        assert!(tracker.try_changed_files().await.is_err());
        assert!(tracker.changed_files().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ChangeTracker::new(Some(dir.path().join("gone")), "main");
        assert!(tracker.changed_files().await.is_empty());
    }
}
