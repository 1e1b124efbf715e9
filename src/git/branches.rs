//! Branch capability namespace: existence checks, creation, listing,
//! merge-base lookups, default-branch detection.

use std::path::Path;

use async_trait::async_trait;

use super::command::run;
use super::error::GitError;

#[async_trait]
pub trait Branches: Send + Sync {
    async fn exists_local(&self, repo: &Path, branch: &str) -> Result<bool, GitError>;
    async fn exists_remote(&self, repo: &Path, branch: &str) -> Result<bool, GitError>;
    async fn current(&self, repo: &Path) -> Result<Option<String>, GitError>;
    async fn create(&self, repo: &Path, name: &str, from_ref: &str) -> Result<(), GitError>;
    async fn create_or_reset(&self, repo: &Path, name: &str, from_ref: &str) -> Result<(), GitError>;
    async fn checkout(&self, repo: &Path, name: &str) -> Result<(), GitError>;
    async fn list(&self, repo: &Path) -> Result<Vec<String>, GitError>;
    async fn get_commit(&self, repo: &Path, branch: &str) -> Result<String, GitError>;
    async fn get_merge_base(&self, repo: &Path, a: &str, b: &str) -> Result<String, GitError>;
    async fn delete_local(&self, repo: &Path, name: &str) -> Result<(), GitError>;
    async fn delete_local_safe(&self, repo: &Path, name: &str) -> Result<(), GitError>;
    async fn delete_remote(&self, repo: &Path, remote: &str, name: &str) -> Result<(), GitError>;

    /// Consults `refs/remotes/origin/HEAD`, then `init.defaultBranch`, then
    /// falls back to the literal names `main`/`master`.
    async fn is_default_branch(&self, repo: &Path, name: &str) -> Result<bool, GitError>;
}

pub struct CliBranches;

#[async_trait]
impl Branches for CliBranches {
    async fn exists_local(&self, repo: &Path, branch: &str) -> Result<bool, GitError> {
        Ok(run(repo, &["rev-parse", "--verify", &format!("refs/heads/{branch}")])
            .await
            .is_ok())
    }

    async fn exists_remote(&self, repo: &Path, branch: &str) -> Result<bool, GitError> {
        Ok(
            run(repo, &["rev-parse", "--verify", &format!("refs/remotes/origin/{branch}")])
                .await
                .is_ok(),
        )
    }

    async fn current(&self, repo: &Path) -> Result<Option<String>, GitError> {
        let stdout = run(repo, &["branch", "--show-current"]).await?;
        Ok((!stdout.is_empty()).then_some(stdout))
    }

    async fn create(&self, repo: &Path, name: &str, from_ref: &str) -> Result<(), GitError> {
        if self.exists_local(repo, name).await? {
            return Err(GitError::BranchAlreadyExists { branch: name.to_string() });
        }
        run(repo, &["branch", name, from_ref]).await?;
        Ok(())
    }

    async fn create_or_reset(&self, repo: &Path, name: &str, from_ref: &str) -> Result<(), GitError> {
        run(repo, &["branch", "-f", name, from_ref]).await?;
        Ok(())
    }

    async fn checkout(&self, repo: &Path, name: &str) -> Result<(), GitError> {
        run(repo, &["checkout", name]).await?;
        Ok(())
    }

    async fn list(&self, repo: &Path) -> Result<Vec<String>, GitError> {
        let stdout = run(repo, &["branch", "--format=%(refname:short)"]).await?;
        Ok(stdout.lines().map(str::to_owned).collect())
    }

    async fn get_commit(&self, repo: &Path, branch: &str) -> Result<String, GitError> {
        run(repo, &["rev-parse", branch]).await
    }

    async fn get_merge_base(&self, repo: &Path, a: &str, b: &str) -> Result<String, GitError> {
        run(repo, &["merge-base", a, b]).await
    }

    async fn delete_local(&self, repo: &Path, name: &str) -> Result<(), GitError> {
        run(repo, &["branch", "-D", name]).await?;
        Ok(())
    }

    async fn delete_local_safe(&self, repo: &Path, name: &str) -> Result<(), GitError> {
        let _ = run(repo, &["branch", "-D", name]).await;
        Ok(())
    }

    async fn delete_remote(&self, repo: &Path, remote: &str, name: &str) -> Result<(), GitError> {
        run(repo, &["push", remote, "--delete", name]).await?;
        Ok(())
    }

    async fn is_default_branch(&self, repo: &Path, name: &str) -> Result<bool, GitError> {
        if let Ok(symref) = run(repo, &["symbolic-ref", "refs/remotes/origin/HEAD"]).await {
            let branch = symref.strip_prefix("refs/remotes/origin/").unwrap_or(&symref);
            return Ok(branch == name);
        }
        if let Ok(configured) = run(repo, &["config", "init.defaultBranch"]).await {
            if !configured.is_empty() {
                return Ok(configured == name);
            }
        }
        Ok(name == "main" || name == "master")
    }
}

#[cfg(test)]
mod tests {
    // Branch operations require a real git repository; exercised in
    // `tests/git_adapter_safety.rs` and the scheduler's integration tests
    // against throwaway repo fixtures.
}
