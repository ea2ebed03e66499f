//! `GitService` backed by the `git` command line.

use super::GitService;
use crate::domain::types::CommitHash;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }
}

/// Runs git in `dir` and returns trimmed stdout.
async fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl GitService for GitCli {
    async fn create_worktree(
        &self,
        repository_path: &Path,
        worktree: &Path,
        branch: &str,
        base: &str,
    ) -> Result<()> {
        if let Some(parent) = worktree.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let path = worktree.to_string_lossy();
        git(
            repository_path,
            &["worktree", "add", "-b", branch, &path, base],
        )
        .await?;
        Ok(())
    }

    async fn reset_hard(&self, worktree: &Path, commit: &CommitHash) -> Result<()> {
        git(worktree, &["reset", "--hard", commit.as_str()]).await?;
        Ok(())
    }

    async fn current_commit(&self, worktree: &Path) -> Result<CommitHash> {
        let sha = git(worktree, &["rev-parse", "HEAD"]).await?;
        Ok(CommitHash::from(sha))
    }

    async fn delete_worktree(&self, repository_path: &Path, worktree: &Path) -> Result<()> {
        let path = worktree.to_string_lossy();
        git(repository_path, &["worktree", "remove", "--force", &path]).await?;
        Ok(())
    }

    async fn branch_exists(&self, repository_path: &Path, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{}", branch);
        let status = Command::new("git")
            .current_dir(repository_path)
            .args(["show-ref", "--verify", "--quiet", &reference])
            .status()
            .await
            .context("Failed to run git show-ref")?;
        Ok(status.success())
    }

    async fn delete_branch(&self, repository_path: &Path, branch: &str) -> Result<()> {
        git(repository_path, &["branch", "-D", branch]).await?;
        Ok(())
    }

    async fn push_branch(&self, worktree: &Path, branch: &str) -> Result<()> {
        git(worktree, &["push", "--set-upstream", "origin", branch]).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/git_tests.rs"]
mod tests;
