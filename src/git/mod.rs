//! Git boundary: the operations the engine issues against a workspace.
//!
//! `WorkspaceVcs` is the seam consumed by the job manager; `GitRunner` is
//! the shell-out implementation.

mod runner;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use runner::GitRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub kind: ChangeKind,
    pub lines_added: usize,
    pub lines_removed: usize,
}

/// Summary of everything changed since a snapshot commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffSummary {
    pub base_commit: String,
    pub files: Vec<ChangedFile>,
    /// Unified diff text, archived as evidence.
    pub patch: String,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }

    pub fn total_lines(&self) -> usize {
        self.files
            .iter()
            .map(|f| f.lines_added + f.lines_removed)
            .sum()
    }
}

/// The git operations the orchestration core depends on.
#[async_trait]
pub trait WorkspaceVcs: Send + Sync {
    /// Commit hash of the current HEAD.
    async fn head_commit(&self) -> Result<String>;

    /// Everything changed (committed or not) since `commit`.
    async fn diff_since(&self, commit: &str) -> Result<DiffSummary>;

    /// Stage everything and commit. Returns false when there was nothing
    /// to commit.
    async fn commit_all(&self, message: &str) -> Result<bool>;

    /// Hard reset to `commit`, discarding the working tree.
    async fn hard_reset(&self, commit: &str) -> Result<()>;

    /// Remove untracked files left behind by a reverted session.
    async fn clean_untracked(&self) -> Result<()>;

    async fn is_clean(&self) -> Result<bool>;

    async fn create_branch(&self, name: &str) -> Result<()>;

    /// Create a dedicated worktree on a new branch; returns its path.
    async fn create_worktree(&self, name: &str, branch: &str) -> Result<PathBuf>;

    /// Best-effort merge of `branch` into the current branch, autostashing
    /// when the target working tree is dirty.
    async fn merge_back(&self, branch: &str, message: &str) -> Result<()>;
}
