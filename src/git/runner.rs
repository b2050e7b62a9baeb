use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ChangeKind, ChangedFile, DiffSummary, WorkspaceVcs};
use crate::error::{CovenantError, Result};

/// Shell-out git runner bound to one working directory.
pub struct GitRunner {
    working_dir: PathBuf,
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub async fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, dir = %self.working_dir.display(), "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = ?args, stderr = %stderr, "Git command failed");
        }

        Ok(output)
    }

    pub async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CovenantError::Git(git2::Error::from_str(&stderr)));
        }

        Ok(output)
    }

    fn parse_name_status(text: &str) -> Vec<(String, ChangeKind)> {
        text.lines()
            .filter_map(|line| {
                let mut parts = line.split('\t');
                let status = parts.next()?.trim();
                let kind = match status.chars().next()? {
                    'A' => ChangeKind::Added,
                    'M' => ChangeKind::Modified,
                    'D' => ChangeKind::Deleted,
                    'R' => ChangeKind::Renamed,
                    _ => ChangeKind::Modified,
                };
                // Renames carry two paths; the new one is last.
                let path = parts.last()?.trim();
                Some((path.to_string(), kind))
            })
            .collect()
    }

    fn parse_numstat(text: &str) -> Vec<(String, usize, usize)> {
        text.lines()
            .filter_map(|line| {
                let mut parts = line.split('\t');
                let added = parts.next()?.trim().parse().unwrap_or(0);
                let removed = parts.next()?.trim().parse().unwrap_or(0);
                let path = parts.last()?.trim();
                Some((path.to_string(), added, removed))
            })
            .collect()
    }
}

#[async_trait]
impl WorkspaceVcs for GitRunner {
    async fn head_commit(&self) -> Result<String> {
        let output = self.run_checked(&["rev-parse", "HEAD"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn diff_since(&self, commit: &str) -> Result<DiffSummary> {
        // Stage everything first so untracked files show up in the diff.
        self.run_checked(&["add", "-A", "-N"]).await?;

        let name_status = self
            .run_checked(&["diff", "--name-status", commit])
            .await?;
        let numstat = self.run_checked(&["diff", "--numstat", commit]).await?;
        let patch = self.run_checked(&["diff", commit]).await?;

        let kinds = Self::parse_name_status(&String::from_utf8_lossy(&name_status.stdout));
        let stats = Self::parse_numstat(&String::from_utf8_lossy(&numstat.stdout));

        let files = kinds
            .into_iter()
            .map(|(path, kind)| {
                let (lines_added, lines_removed) = stats
                    .iter()
                    .find(|(p, _, _)| *p == path)
                    .map(|(_, a, r)| (*a, *r))
                    .unwrap_or((0, 0));
                ChangedFile {
                    path,
                    kind,
                    lines_added,
                    lines_removed,
                }
            })
            .collect();

        Ok(DiffSummary {
            base_commit: commit.to_string(),
            files,
            patch: String::from_utf8_lossy(&patch.stdout).to_string(),
        })
    }

    async fn commit_all(&self, message: &str) -> Result<bool> {
        self.run_checked(&["add", "-A"]).await?;
        let output = self.run(&["commit", "-m", message]).await?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
                return Ok(false);
            }
            return Err(CovenantError::Git(git2::Error::from_str(&stderr)));
        }

        Ok(true)
    }

    async fn hard_reset(&self, commit: &str) -> Result<()> {
        self.run_checked(&["reset", "--hard", commit]).await?;
        Ok(())
    }

    async fn clean_untracked(&self) -> Result<()> {
        self.run_checked(&["clean", "-fd"]).await?;
        Ok(())
    }

    async fn is_clean(&self) -> Result<bool> {
        let output = self.run_checked(&["status", "--porcelain"]).await?;
        Ok(output.stdout.is_empty())
    }

    async fn create_branch(&self, name: &str) -> Result<()> {
        self.run_checked(&["checkout", "-b", name]).await?;
        Ok(())
    }

    async fn create_worktree(&self, name: &str, branch: &str) -> Result<PathBuf> {
        let path = self
            .working_dir
            .parent()
            .unwrap_or(&self.working_dir)
            .join(format!(".covenant-worktrees/{name}"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path_str = path.to_string_lossy().into_owned();
        self.run_checked(&["worktree", "add", "-b", branch, &path_str])
            .await?;
        Ok(path)
    }

    async fn merge_back(&self, branch: &str, message: &str) -> Result<()> {
        let output = self
            .run(&["merge", "--no-ff", branch, "-m", message])
            .await?;
        if output.status.success() {
            return Ok(());
        }

        // Dirty target tree: retry under autostash.
        if !self.is_clean().await? {
            warn!(branch, "Target tree dirty, retrying merge with autostash");
            self.run_checked(&["merge", "--no-ff", "--autostash", branch, "-m", message])
                .await?;
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(CovenantError::Git(git2::Error::from_str(&stderr)))
    }
}
