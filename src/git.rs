//! `GitOps` (§6.4): the only interface the scheduler needs from git. Kept
//! as a trait so tests can inject a fake rather than shell out.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

#[async_trait::async_trait]
pub trait GitOps: Send + Sync {
    async fn status(&self) -> Result<String>;
    async fn add(&self, pathspec: &str) -> Result<()>;
    async fn commit(&self, message: &str) -> Result<String>;
    async fn log(&self) -> Result<String>;
    async fn diff(&self) -> Result<String>;
    async fn branch(&self) -> Result<String>;
    async fn checkout(&self, branch: &str) -> Result<()>;
}

/// Shells out to the real `git` binary in `work_dir`.
pub struct RealGitOps {
    pub work_dir: PathBuf,
}

impl RealGitOps {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("failed to execute git")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git {} failed: {}", args.join(" "), stderr);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait::async_trait]
impl GitOps for RealGitOps {
    async fn status(&self) -> Result<String> {
        self.run(&["status", "--porcelain"]).await
    }

    async fn add(&self, pathspec: &str) -> Result<()> {
        self.run(&["add", pathspec]).await?;
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<String> {
        self.run(&["commit", "-m", message]).await?;
        self.run(&["rev-parse", "HEAD"]).await
    }

    async fn log(&self) -> Result<String> {
        self.run(&["log", "--oneline", "-20"]).await
    }

    async fn diff(&self) -> Result<String> {
        self.run(&["diff"]).await
    }

    async fn branch(&self) -> Result<String> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    async fn checkout(&self, branch: &str) -> Result<()> {
        self.run(&["checkout", branch]).await?;
        Ok(())
    }
}

/// Commit message format of §6.4: `"{commitPrefix}{taskId}: {title}"`.
pub fn commit_message(prefix: &str, task_id: &str, title: &str) -> String {
    format!("{prefix}{task_id}: {title}")
}

pub async fn get_git_root(cwd: &Path) -> Result<PathBuf> {
    let ops = RealGitOps::new(cwd.to_path_buf());
    let root = ops.run(&["rev-parse", "--show-toplevel"]).await?;
    Ok(PathBuf::from(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_message_matches_format() {
        assert_eq!(
            commit_message("ralph: ", "t1", "Fix bug"),
            "ralph: t1: Fix bug"
        );
    }
}
