//! Git-backed snapshots for recovery checkpoints.
//!
//! `git stash create` records the working tree as a dangling commit without
//! touching the index or the stash list.  On a clean tree it prints nothing,
//! and the checkpointer falls back to `HEAD`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use grokline_agent::SnapshotService;
use tracing::debug;

/// Snapshots the repository containing `repo_dir`.
pub struct GitSnapshotService {
    repo_dir: PathBuf,
}

impl GitSnapshotService {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    /// Whether `dir` lies inside a git work tree.
    pub async fn is_repository(dir: &Path) -> bool {
        run_git(dir, &["rev-parse", "--is-inside-work-tree"])
            .await
            .is_some_and(|out| out == "true")
    }
}

/// Run git and return its trimmed stdout when it succeeded with output.
async fn run_git(dir: &Path, args: &[&str]) -> Option<String> {
    let output = match tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .kill_on_drop(true)
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            debug!(error = %e, "failed to run git");
            return None;
        }
    };

    if !output.status.success() {
        debug!(
            ?args,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "git command failed"
        );
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    (!stdout.is_empty()).then_some(stdout)
}

#[async_trait]
impl SnapshotService for GitSnapshotService {
    async fn create_snapshot(&self, label: &str) -> Option<String> {
        run_git(&self.repo_dir, &["stash", "create", label]).await
    }

    async fn current_snapshot_id(&self) -> Option<String> {
        run_git(&self.repo_dir, &["rev-parse", "HEAD"]).await
    }
}
