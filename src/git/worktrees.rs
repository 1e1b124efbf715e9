//! Worktree capability namespace: lifecycle of the per-job and per-snapshot
//! working directories.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tracing::info;

use super::command::run;
use super::error::GitError;

#[derive(Debug, Clone)]
pub struct WorktreeCreationResult {
    pub duration_ms: u64,
    pub base_commit: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
    pub bare: bool,
    pub detached: bool,
}

#[async_trait]
pub trait Worktrees: Send + Sync {
    async fn create_detached(
        &self,
        repo: &Path,
        path: &Path,
        commitish: &str,
        additional_symlink_dirs: &[PathBuf],
    ) -> Result<WorktreeCreationResult, GitError>;

    /// Idempotent: if a worktree already exists at `path` with the same git
    /// link, reuses it instead of failing. Used so a retried node doesn't
    /// leak worktrees.
    async fn create_or_reuse_detached(
        &self,
        repo: &Path,
        path: &Path,
        commitish: &str,
        additional_symlink_dirs: &[PathBuf],
    ) -> Result<WorktreeCreationResult, GitError>;

    async fn remove(&self, repo: &Path, path: &Path) -> Result<(), GitError>;
    async fn remove_safe(&self, repo: &Path, path: &Path) -> Result<(), GitError>;
    async fn is_valid(&self, path: &Path) -> bool;
    async fn get_branch(&self, path: &Path) -> Result<Option<String>, GitError>;
    async fn get_head_commit(&self, path: &Path) -> Result<String, GitError>;
    async fn list(&self, repo: &Path) -> Result<Vec<WorktreeEntry>, GitError>;
    async fn prune(&self, repo: &Path) -> Result<(), GitError>;
}

pub struct CliWorktrees;

#[async_trait]
impl Worktrees for CliWorktrees {
    async fn create_detached(
        &self,
        repo: &Path,
        path: &Path,
        commitish: &str,
        additional_symlink_dirs: &[PathBuf],
    ) -> Result<WorktreeCreationResult, GitError> {
        let start = Instant::now();
        let path_str = path_to_str(path)?;
        run(repo, &["worktree", "add", "--detach", path_str, commitish]).await?;
        run(path, &["submodule", "update", "--init", "--recursive"]).await.ok();
        run(path, &["config", "submodule.recurse", "true"]).await.ok();

        for dir in additional_symlink_dirs {
            let target = repo.join(dir);
            let link = path.join(dir);
            if target.exists() && !link.exists() {
                #[cfg(unix)]
                let _ = std::os::unix::fs::symlink(&target, &link);
                #[cfg(windows)]
                let _ = std::os::windows::fs::symlink_dir(&target, &link);
            }
        }

        let base_commit = run(path, &["rev-parse", "HEAD"]).await?;
        info!(path = %path.display(), %base_commit, "created detached worktree");
        Ok(WorktreeCreationResult {
            duration_ms: start.elapsed().as_millis() as u64,
            base_commit,
        })
    }

    async fn create_or_reuse_detached(
        &self,
        repo: &Path,
        path: &Path,
        commitish: &str,
        additional_symlink_dirs: &[PathBuf],
    ) -> Result<WorktreeCreationResult, GitError> {
        if self.is_valid(path).await {
            let base_commit = self.get_head_commit(path).await?;
            return Ok(WorktreeCreationResult { duration_ms: 0, base_commit });
        }
        self.create_detached(repo, path, commitish, additional_symlink_dirs).await
    }

    async fn remove(&self, repo: &Path, path: &Path) -> Result<(), GitError> {
        let path_str = path_to_str(path)?;
        run(repo, &["worktree", "remove", "--force", path_str]).await?;
        Ok(())
    }

    async fn remove_safe(&self, repo: &Path, path: &Path) -> Result<(), GitError> {
        if !path.exists() {
            self.prune(repo).await.ok();
            return Ok(());
        }
        let _ = self.remove(repo, path).await;
        if path.exists() {
            let _ = tokio::fs::remove_dir_all(path).await;
        }
        self.prune(repo).await.ok();
        Ok(())
    }

    async fn is_valid(&self, path: &Path) -> bool {
        path.is_dir() && path.join(".git").exists()
    }

    async fn get_branch(&self, path: &Path) -> Result<Option<String>, GitError> {
        let stdout = run(path, &["branch", "--show-current"]).await?;
        Ok((!stdout.is_empty()).then_some(stdout))
    }

    async fn get_head_commit(&self, path: &Path) -> Result<String, GitError> {
        run(path, &["rev-parse", "HEAD"]).await
    }

    async fn list(&self, repo: &Path) -> Result<Vec<WorktreeEntry>, GitError> {
        let stdout = run(repo, &["worktree", "list", "--porcelain"]).await?;
        parse_worktree_list(&stdout)
    }

    async fn prune(&self, repo: &Path) -> Result<(), GitError> {
        run(repo, &["worktree", "prune"]).await?;
        Ok(())
    }
}

fn path_to_str(path: &Path) -> Result<&str, GitError> {
    path.to_str().ok_or_else(|| GitError::InvalidUtf8Path { path: path.to_path_buf() })
}

fn parse_worktree_list(output: &str) -> Result<Vec<WorktreeEntry>, GitError> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let Some(wt) = current.take() {
                worktrees.push(wt);
            }
            continue;
        }
        let (key, value) = match line.split_once(' ') {
            Some((k, v)) => (k, Some(v)),
            None => (line, None),
        };
        match key {
            "worktree" => {
                let path = value.ok_or_else(|| GitError::ParseError("worktree line missing path".into()))?;
                current = Some(WorktreeEntry {
                    path: PathBuf::from(path),
                    head: String::new(),
                    branch: None,
                    bare: false,
                    detached: false,
                });
            }
            "HEAD" => {
                if let Some(wt) = current.as_mut() {
                    wt.head = value.unwrap_or_default().to_string();
                }
            }
            "branch" => {
                if let Some(wt) = current.as_mut() {
                    let branch_ref = value.unwrap_or_default();
                    wt.branch = Some(branch_ref.strip_prefix("refs/heads/").unwrap_or(branch_ref).to_string());
                }
            }
            "bare" => {
                if let Some(wt) = current.as_mut() {
                    wt.bare = true;
                }
            }
            "detached" => {
                if let Some(wt) = current.as_mut() {
                    wt.detached = true;
                }
            }
            _ => {}
        }
    }
    if let Some(wt) = current {
        worktrees.push(wt);
    }
    Ok(worktrees)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_worktree_list_handles_detached_entry() {
        let output = "worktree /path/to/detached\nHEAD abcd1234\ndetached\n\n";
        let worktrees = parse_worktree_list(output).unwrap();
        assert_eq!(worktrees.len(), 1);
        assert!(worktrees[0].detached);
        assert_eq!(worktrees[0].branch, None);
    }

    #[test]
    fn parse_worktree_list_strips_refs_heads_prefix() {
        let output = "worktree /path/to/main\nHEAD abcd1234\nbranch refs/heads/main\n\n";
        let worktrees = parse_worktree_list(output).unwrap();
        assert_eq!(worktrees[0].branch, Some("main".to_string()));
    }

    #[test]
    fn parse_worktree_list_handles_multiple_entries_without_trailing_blank() {
        let output = "worktree /a\nHEAD aaaa\nbranch refs/heads/a\n\nworktree /b\nHEAD bbbb\nbranch refs/heads/b";
        let worktrees = parse_worktree_list(output).unwrap();
        assert_eq!(worktrees.len(), 2);
        assert_eq!(worktrees[1].path, PathBuf::from("/b"));
    }
}
