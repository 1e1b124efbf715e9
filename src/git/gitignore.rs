//! Gitignore capability namespace.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::error::GitError;

#[async_trait]
pub trait Gitignore: Send + Sync {
    /// Idempotently append any of `entries` missing from the repo's
    /// `.gitignore`, preserving the existing file.
    async fn ensure_entries(&self, repo: &Path, entries: &[&str]) -> Result<(), GitError>;
}

pub struct CliGitignore;

#[async_trait]
impl Gitignore for CliGitignore {
    async fn ensure_entries(&self, repo: &Path, entries: &[&str]) -> Result<(), GitError> {
        let path = repo.join(".gitignore");
        let existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        let existing_lines: std::collections::HashSet<&str> = existing.lines().map(str::trim).collect();

        let missing: Vec<&&str> = entries.iter().filter(|e| !existing_lines.contains(*e)).collect();
        if missing.is_empty() {
            return Ok(());
        }

        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            file.write_all(b"\n").await?;
        }
        for entry in missing {
            file.write_all(entry.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        Ok(())
    }
}

/// Scans a unified diff and reports whether every hunk only touches
/// orchestrator-managed paths (`.orchestrator/`, the configured worktree
/// root). Used by the stash-pop recovery path to decide whether a
/// leftover stash can be dropped silently.
pub fn is_diff_only_orchestrator_changes(diff: &str, managed_prefixes: &[&str]) -> bool {
    let mut touched_any = false;
    for line in diff.lines() {
        let Some(path) = line.strip_prefix("+++ b/").or_else(|| line.strip_prefix("--- a/")) else {
            continue;
        };
        touched_any = true;
        if !managed_prefixes.iter().any(|p| path.starts_with(p)) {
            return false;
        }
    }
    touched_any
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_diff_touching_only_orchestrator_paths() {
        let diff = "diff --git a/.orchestrator/plans/x b/.orchestrator/plans/x\n--- a/.orchestrator/plans/x\n+++ b/.orchestrator/plans/x\n";
        assert!(is_diff_only_orchestrator_changes(diff, &[".orchestrator/"]));
    }

    #[test]
    fn rejects_diff_touching_user_files() {
        let diff = "diff --git a/src/main.rs b/src/main.rs\n--- a/src/main.rs\n+++ b/src/main.rs\n";
        assert!(!is_diff_only_orchestrator_changes(diff, &[".orchestrator/"]));
    }

    #[test]
    fn empty_diff_is_not_orchestrator_only() {
        assert!(!is_diff_only_orchestrator_changes("", &[".orchestrator/"]));
    }
}
