//! Merge capability namespace: checkout-based merges plus the in-memory
//! merge-tree primitives the reverse-integration and final-merge paths use
//! to resolve conflicts without ever touching a working directory.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use super::command::{run, run_bytes, run_raw};
use super::error::{GitError, GitErrorKind, classify_stderr};

#[derive(Debug, Clone)]
pub struct MergeOptions<'a> {
    pub source: &'a str,
    pub no_commit: bool,
    pub message: Option<&'a str>,
    pub fast_forward: bool,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub success: bool,
    pub has_conflicts: bool,
    pub conflict_files: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MergeTreeOutcome {
    pub success: bool,
    pub tree_sha: Option<String>,
    pub has_conflicts: bool,
    pub conflict_files: Vec<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait Merge: Send + Sync {
    /// `git merge` performed in `cwd`'s checked-out working tree.
    async fn merge(&self, cwd: &Path, target_head: &str, opts: MergeOptions<'_>) -> Result<MergeOutcome, GitError>;

    /// Produce a candidate tree (or a conflicted tree) for merging `source`
    /// into `target` without checking out or mutating any working
    /// directory.
    async fn merge_without_checkout(
        &self,
        repo: &Path,
        source: &str,
        target: &str,
    ) -> Result<MergeTreeOutcome, GitError>;

    async fn commit_tree(&self, repo: &Path, tree: &str, parents: &[&str], message: &str) -> Result<String, GitError>;
    async fn cat_file_from_tree(&self, repo: &Path, tree: &str, path: &str) -> Result<Option<Vec<u8>>, GitError>;
    async fn hash_object_from_file(&self, repo: &Path, abs_path: &Path) -> Result<String, GitError>;
    async fn replace_tree_blobs(
        &self,
        repo: &Path,
        tree: &str,
        replacements: &BTreeMap<String, String>,
    ) -> Result<String, GitError>;

    async fn list_conflicts(&self, cwd: &Path) -> Result<Vec<String>, GitError>;
    async fn abort(&self, cwd: &Path) -> Result<(), GitError>;
    async fn continue_after_resolve(&self, cwd: &Path, message: &str) -> Result<(), GitError>;
    async fn is_in_progress(&self, cwd: &Path) -> Result<bool, GitError>;

    /// File count at a tree, via `ls-tree -r --name-only`. Used by the
    /// reverse-integration file-count-ratio validation.
    async fn tree_file_count(&self, repo: &Path, tree: &str) -> Result<usize, GitError>;
}

pub struct CliMerge;

#[async_trait]
impl Merge for CliMerge {
    async fn merge(&self, cwd: &Path, target_head: &str, opts: MergeOptions<'_>) -> Result<MergeOutcome, GitError> {
        let _ = target_head;
        let mut args = vec!["merge"];
        if opts.no_commit {
            args.push("--no-commit");
        }
        if !opts.fast_forward {
            args.push("--no-ff");
        }
        if let Some(message) = opts.message {
            args.push("-m");
            args.push(message);
        }
        args.push(opts.source);

        match run(cwd, &args).await {
            Ok(_) => Ok(MergeOutcome { success: true, has_conflicts: false, conflict_files: Vec::new(), error: None }),
            Err(GitError::CommandFailed { stderr, kind, .. }) => {
                let conflict_files = self.list_conflicts(cwd).await.unwrap_or_default();
                Ok(MergeOutcome {
                    success: false,
                    has_conflicts: kind == GitErrorKind::Conflict || !conflict_files.is_empty(),
                    conflict_files,
                    error: Some(stderr),
                })
            }
            Err(other) => Err(other),
        }
    }

    async fn merge_without_checkout(
        &self,
        repo: &Path,
        source: &str,
        target: &str,
    ) -> Result<MergeTreeOutcome, GitError> {
        // `git merge-tree --write-tree` signals its outcome through the exit
        // code, not through success/failure of the process in the usual
        // sense: exit 0 is a clean merge, exit 1 is a conflicted merge (the
        // conflicted tree's OID and the conflicted paths are still on
        // stdout), and anything else is a real error. `run`'s
        // success-or-stderr contract would discard that stdout on exit 1, so
        // this goes through `run_raw` instead.
        let output = run_raw(repo, &["merge-tree", "--write-tree", "--name-only", "--messages", target, source]).await?;

        if output.success {
            let tree_sha = output.stdout.lines().next().unwrap_or_default().to_string();
            if tree_sha.is_empty() {
                return Ok(MergeTreeOutcome {
                    success: false,
                    tree_sha: None,
                    has_conflicts: false,
                    conflict_files: Vec::new(),
                    error: Some("merge-tree produced no tree".to_string()),
                });
            }
            return Ok(MergeTreeOutcome { success: true, tree_sha: Some(tree_sha), has_conflicts: false, conflict_files: Vec::new(), error: None });
        }

        if output.code == Some(1) {
            let mut lines = output.stdout.lines();
            let tree_sha = lines.next().unwrap_or_default().to_string();
            if tree_sha.is_empty() {
                return Ok(MergeTreeOutcome {
                    success: false,
                    tree_sha: None,
                    has_conflicts: false,
                    conflict_files: Vec::new(),
                    error: Some(output.stderr),
                });
            }
            let conflict_files: Vec<String> = lines.filter(|l| !l.trim().is_empty()).map(str::to_owned).collect();
            let error = if output.stderr.is_empty() { "merge-tree reported conflicts".to_string() } else { output.stderr };
            return Ok(MergeTreeOutcome { success: false, tree_sha: Some(tree_sha), has_conflicts: true, conflict_files, error: Some(error) });
        }

        let kind = classify_stderr(&output.stderr);
        Err(GitError::CommandFailed { args: "merge-tree".into(), stderr: output.stderr, kind })
    }

    async fn commit_tree(&self, repo: &Path, tree: &str, parents: &[&str], message: &str) -> Result<String, GitError> {
        let mut args = vec!["commit-tree", tree];
        for parent in parents {
            args.push("-p");
            args.push(parent);
        }
        args.push("-m");
        args.push(message);
        run(repo, &args).await
    }

    async fn cat_file_from_tree(&self, repo: &Path, tree: &str, path: &str) -> Result<Option<Vec<u8>>, GitError> {
        let object = format!("{tree}:{path}");
        match run_bytes(repo, &["cat-file", "-p", &object]).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(GitError::CommandFailed { kind: GitErrorKind::NotFound, .. }) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn hash_object_from_file(&self, repo: &Path, abs_path: &Path) -> Result<String, GitError> {
        let path_str = abs_path.to_str().ok_or_else(|| GitError::InvalidUtf8Path { path: abs_path.to_path_buf() })?;
        run(repo, &["hash-object", "-w", "--", path_str]).await
    }

    async fn replace_tree_blobs(
        &self,
        repo: &Path,
        tree: &str,
        replacements: &BTreeMap<String, String>,
    ) -> Result<String, GitError> {
        let ls_tree = run(repo, &["ls-tree", "-r", tree]).await?;
        let mut lines = Vec::new();
        for line in ls_tree.lines() {
            let Some((meta, path)) = line.split_once('\t') else { continue };
            if let Some(new_blob) = replacements.get(path) {
                let mut parts = meta.split_whitespace();
                let mode = parts.next().unwrap_or("100644");
                let kind = parts.next().unwrap_or("blob");
                lines.push(format!("{mode} {kind} {new_blob}\t{path}"));
            } else {
                lines.push(line.to_string());
            }
        }
        let input = lines.join("\n") + "\n";
        run_mktree(repo, &input).await
    }

    async fn list_conflicts(&self, cwd: &Path) -> Result<Vec<String>, GitError> {
        let stdout = run(cwd, &["diff", "--name-only", "--diff-filter=U"]).await?;
        Ok(stdout.lines().map(str::to_owned).collect())
    }

    async fn abort(&self, cwd: &Path) -> Result<(), GitError> {
        run(cwd, &["merge", "--abort"]).await?;
        Ok(())
    }

    async fn continue_after_resolve(&self, cwd: &Path, message: &str) -> Result<(), GitError> {
        run(cwd, &["add", "-A"]).await?;
        run(cwd, &["commit", "-m", message]).await?;
        Ok(())
    }

    async fn is_in_progress(&self, cwd: &Path) -> Result<bool, GitError> {
        let git_dir = run(cwd, &["rev-parse", "--git-dir"]).await?;
        Ok(cwd.join(git_dir).join("MERGE_HEAD").exists())
    }

    async fn tree_file_count(&self, repo: &Path, tree: &str) -> Result<usize, GitError> {
        let stdout = run(repo, &["ls-tree", "-r", "--name-only", tree]).await?;
        Ok(stdout.lines().filter(|l| !l.trim().is_empty()).count())
    }
}

async fn run_mktree(repo: &Path, input: &str) -> Result<String, GitError> {
    use tokio::io::AsyncWriteExt;
    use tokio::process::Command;

    let mut child = Command::new("git")
        .arg("mktree")
        .current_dir(repo)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(input.as_bytes()).await?;
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(GitError::CommandFailed { args: "mktree".into(), stderr, kind: GitErrorKind::Unknown });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// `result_files / max(source_files, target_files) >= 0.80` unless
/// `max(source_files, target_files) <= 10`, in which case the ratio is not
/// enforced at all.
pub fn passes_file_count_ratio(result_files: usize, source_files: usize, target_files: usize) -> bool {
    let richer = source_files.max(target_files);
    if richer <= 10 {
        return true;
    }
    (result_files as f64) / (richer as f64) >= 0.80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_check_ignores_small_trees() {
        assert!(passes_file_count_ratio(1, 3, 10));
    }

    #[test]
    fn ratio_check_passes_at_exactly_threshold() {
        assert!(passes_file_count_ratio(80, 100, 50));
    }

    #[test]
    fn ratio_check_fails_below_threshold() {
        assert!(!passes_file_count_ratio(5, 200, 10));
    }

    #[test]
    fn ratio_check_uses_the_richer_side() {
        assert!(!passes_file_count_ratio(9, 10, 200));
        assert!(passes_file_count_ratio(160, 10, 200));
    }
}
