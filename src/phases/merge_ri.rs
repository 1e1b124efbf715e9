//! Reverse integration: lands a leaf job's completed commit onto the
//! target (in practice, the plan's snapshot branch) entirely without
//! checking out a working tree, resolving any conflicts via temp files and
//! the agent delegator.

use tempfile::TempDir;
use tracing::{info, warn};

use super::{PhaseContext, PhaseOutcome};
use crate::agent::AgentRequest;
use crate::git::passes_file_count_ratio;

/// Unlike the other phase executors, reverse integration needs the node's
/// completed commit and its base-at-start commit in addition to the shared
/// `PhaseContext`, so it does not implement the generic `PhaseExecutor`
/// trait; the Job Executor invokes `execute_with_commit` directly once the
/// commit phase has produced a result.
pub struct MergeRiExecutor;

impl MergeRiExecutor {
    /// The actual entry point, called by the Job Executor once the commit
    /// phase has produced (or not produced) a completed commit for this
    /// node.
    pub async fn execute_with_commit(
        &self,
        ctx: &mut PhaseContext<'_>,
        base_commit_at_start: &str,
        completed_commit: Option<&str>,
    ) -> PhaseOutcome {
        let Some(completed_commit) = completed_commit else {
            return PhaseOutcome::ok();
        };

        match ctx
            .git
            .repository
            .has_changes_between(&ctx.repo_path, base_commit_at_start, completed_commit)
            .await
        {
            Ok(false) => return PhaseOutcome::ok(),
            Ok(true) => {}
            Err(e) => return PhaseOutcome::failure(format!("failed to diff base against completed commit: {e}")),
        }

        let merge_tree = match ctx.git.merge.merge_without_checkout(&ctx.repo_path, completed_commit, &ctx.target_branch).await {
            Ok(m) => m,
            Err(e) => return PhaseOutcome::failure(format!("merge-tree failed: {e}")),
        };

        let target_sha = match ctx.git.repository.resolve_ref(&ctx.repo_path, &ctx.target_branch).await {
            Ok(sha) => sha,
            Err(e) => return PhaseOutcome::failure(format!("failed to resolve target branch: {e}")),
        };

        let tree = if merge_tree.has_conflicts {
            match resolve_conflicts_in_memory(ctx, &merge_tree, completed_commit).await {
                Ok(tree) => tree,
                Err(e) => return PhaseOutcome::failure(e),
            }
        } else {
            match merge_tree.tree_sha {
                Some(tree) => tree,
                None => return PhaseOutcome::failure(merge_tree.error.unwrap_or_else(|| "merge-tree produced no tree".to_string())),
            }
        };

        let message = format!("Plan {}: merge {} (commit {})", ctx.job.task, ctx.job.task, &completed_commit[..completed_commit.len().min(8)]);
        let new_commit = match ctx.git.merge.commit_tree(&ctx.repo_path, &tree, &[&target_sha, completed_commit], &message).await {
            Ok(c) => c,
            Err(e) => return PhaseOutcome::failure(format!("commit-tree failed: {e}")),
        };

        if let Err(outcome) = validate_tree_ratio(ctx, &tree, completed_commit, &target_sha).await {
            return outcome;
        }

        if let Err(e) = ctx
            .git
            .repository
            .update_branch_ref(&ctx.repo_path, &ctx.target_branch, &new_commit, &ctx.main_worktree_path)
            .await
        {
            return PhaseOutcome::failure(format!("failed to update {}: {e}", ctx.target_branch));
        }

        if ctx.config.push_on_merge_success
            && let Err(e) = ctx.git.repository.push(&ctx.repo_path, "origin", &ctx.target_branch).await
        {
            warn!(branch = %ctx.target_branch, %e, "push after successful reverse-integration merge failed, continuing");
        }

        info!(node = %ctx.node_id, commit = %new_commit, target = %ctx.target_branch, "reverse-integration merge landed");
        PhaseOutcome::ok_with_commit(new_commit)
    }
}

async fn validate_tree_ratio(
    ctx: &PhaseContext<'_>,
    result_tree: &str,
    source_commit: &str,
    target_sha: &str,
) -> Result<(), PhaseOutcome> {
    let result_files = ctx.git.merge.tree_file_count(&ctx.repo_path, result_tree).await.map_err(|e| PhaseOutcome::failure(e.to_string()))?;
    let source_files = ctx.git.merge.tree_file_count(&ctx.repo_path, source_commit).await.map_err(|e| PhaseOutcome::failure(e.to_string()))?;
    let target_files = ctx.git.merge.tree_file_count(&ctx.repo_path, target_sha).await.map_err(|e| PhaseOutcome::failure(e.to_string()))?;

    if !passes_file_count_ratio(result_files, source_files, target_files) {
        warn!(result_files, source_files, target_files, "reverse-integration tree validation aborted");
        return Err(PhaseOutcome::failure(format!(
            "tree validation aborted: result has {result_files} files, source had {source_files}, target had {target_files}"
        )));
    }
    Ok(())
}

/// Resolve each conflicted path entirely in memory: materialize the
/// conflicted blob to a scratch file, hand it to the agent, hash the
/// resolved file back into the object store, and splice it into the
/// conflicted tree. No worktree is ever created for this.
async fn resolve_conflicts_in_memory(
    ctx: &PhaseContext<'_>,
    merge_tree: &crate::git::MergeTreeOutcome,
    source_commit: &str,
) -> Result<String, String> {
    let conflicted_tree = merge_tree.tree_sha.as_ref().ok_or("conflict reported with no tree")?;
    let temp_dir = TempDir::new().map_err(|e| format!("failed to create scratch dir: {e}"))?;
    let mut replacements = std::collections::BTreeMap::new();

    for path in &merge_tree.conflict_files {
        let Some(bytes) = ctx
            .git
            .merge
            .cat_file_from_tree(&ctx.repo_path, conflicted_tree, path)
            .await
            .map_err(|e| e.to_string())?
        else {
            continue;
        };

        let scratch_path = temp_dir.path().join(path.replace('/', "__"));
        if let Some(parent) = scratch_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
        }
        tokio::fs::write(&scratch_path, &bytes).await.map_err(|e| e.to_string())?;

        let prompt = format!(
            "Resolve the git merge conflict markers in the file at {}. It is the conflicted \
version of \"{path}\" from merging {source_commit} into {}. Remove all conflict markers and \
write the fully resolved file content back to the same path.",
            scratch_path.display(),
            ctx.target_branch,
        );
        let request = AgentRequest {
            worktree_path: temp_dir.path().to_path_buf(),
            job_id: ctx.node_id.to_string(),
            instructions: prompt,
            session_id: None,
            model: None,
            config_dir: None,
            allowed_folders: vec![temp_dir.path().to_path_buf()],
            allowed_urls: Vec::new(),
            timeout: Some(std::time::Duration::from_secs(600)),
        };
        let response = ctx.agent.run(request).await.map_err(|e| e.to_string())?;
        if !response.success {
            return Err(format!("agent failed to resolve conflict in {path}: {}", response.combined_output));
        }

        let blob = ctx.git.merge.hash_object_from_file(&ctx.repo_path, &scratch_path).await.map_err(|e| e.to_string())?;
        replacements.insert(path.clone(), blob);
    }

    ctx.git
        .merge
        .replace_tree_blobs(&ctx.repo_path, conflicted_tree, &replacements)
        .await
        .map_err(|e| e.to_string())
    // `temp_dir` drops here, removing the scratch directory on every exit path.
}
